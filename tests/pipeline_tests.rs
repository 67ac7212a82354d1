//! End-to-end tests for the change capture -> join -> sink pipeline.
//!
//! Each test drives the real coordinator against an in-memory source
//! database, in-memory offset storage and the in-memory document store.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use weft::config::parse_config;
use weft::config::types::Config;
use weft::pipeline::{FailureCause, Pipeline, PipelineFailure, PipelineHandle, PipelineReport, PipelineState};
use weft::sink::{MemoryDocumentStore, WriterError};
use weft::source::{
    ChangePage, ChangeSource, DuckDbSource, LogPosition, ReaderError, Row, RowKey, Snapshot, SourceError, SourceWrite,
};
use weft::storage::duckdb::DuckDbStorage;
use weft::storage::OffsetStore;

fn config(follow: bool) -> Config {
    let yaml = format!(
        r#"
sources:
  customers:
    primary_key: [id]
    connection: {{ type: duckdb, path: /unused/source.duckdb }}
    read: {{ follow: {follow}, poll_interval: 10ms, batch_size: 3 }}
    retry: {{ max_attempts: 2, initial_backoff: 1ms, max_backoff: 2ms, timeout: 1s }}
  orders:
    primary_key: [order_id]
    connection: {{ type: duckdb, path: /unused/source.duckdb }}
    read: {{ follow: {follow}, poll_interval: 10ms, batch_size: 3 }}
    retry: {{ max_attempts: 2, initial_backoff: 1ms, max_backoff: 2ms, timeout: 1s }}
join:
  many: orders
  one: customers
  foreign_key: [customer_id]
  output:
    - {{ name: order_id, from: many, column: order_id }}
    - {{ name: customer_name, from: one, column: name }}
    - {{ name: customer_email, from: one, column: email }}
    - {{ name: product, from: many, column: product }}
    - {{ name: total_amount, from: many, column: amount }}
state:
  partitions: 4
sink:
  type: memory
  batch_size: 2
  flush_interval: 10ms
  retry: {{ max_attempts: 2, initial_backoff: 1ms, max_backoff: 2ms, timeout: 1s }}
checkpoint:
  path: /unused/offsets.duckdb
pipeline:
  channel_buffer: 8
"#
    );
    parse_config(&yaml).unwrap()
}

fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

struct Harness {
    source: Arc<DuckDbSource>,
    offsets: Arc<DuckDbStorage>,
    sink: Arc<MemoryDocumentStore>,
}

impl Harness {
    fn new() -> Self {
        let source = DuckDbSource::in_memory().unwrap();
        source.register_table("customers", &["id".to_string()]);
        source.register_table("orders", &["order_id".to_string()]);
        Self {
            source: Arc::new(source),
            offsets: Arc::new(DuckDbStorage::in_memory().unwrap()),
            sink: Arc::new(MemoryDocumentStore::new()),
        }
    }

    fn pipeline(&self, config: Config) -> Pipeline {
        let mut sources: BTreeMap<String, Arc<dyn ChangeSource>> = BTreeMap::new();
        sources.insert("customers".to_string(), self.source.clone());
        sources.insert("orders".to_string(), self.source.clone());
        Pipeline::new(config, sources, self.offsets.clone(), self.sink.clone())
    }

    async fn write(&self, writes: Vec<SourceWrite>) -> LogPosition {
        self.source.write(writes).await.unwrap()
    }

    async fn insert_customer(&self, id: i64, name: &str) -> LogPosition {
        let email = format!("{}@example.com", name.to_lowercase());
        self.write(vec![SourceWrite::Insert {
            table: "customers".to_string(),
            row: row(json!({"id": id, "name": name, "email": email})),
        }])
        .await
    }

    async fn insert_order(&self, id: i64, customer_id: i64, product: &str, amount: f64) -> LogPosition {
        self.write(vec![SourceWrite::Insert {
            table: "orders".to_string(),
            row: row(json!({"order_id": id, "customer_id": customer_id, "product": product, "amount": amount})),
        }])
        .await
    }

    async fn update_order(&self, id: i64, customer_id: i64, product: &str, amount: f64) -> LogPosition {
        self.write(vec![SourceWrite::Update {
            table: "orders".to_string(),
            row: row(json!({"order_id": id, "customer_id": customer_id, "product": product, "amount": amount})),
        }])
        .await
    }

    async fn rename_customer(&self, id: i64, name: &str) -> LogPosition {
        let email = format!("{}@example.com", name.to_lowercase());
        self.write(vec![SourceWrite::Update {
            table: "customers".to_string(),
            row: row(json!({"id": id, "name": name, "email": email})),
        }])
        .await
    }

    async fn delete(&self, table: &str, key: i64) -> LogPosition {
        self.write(vec![SourceWrite::Delete {
            table: table.to_string(),
            key: RowKey::new(key.to_string()),
        }])
        .await
    }

    async fn start_following(&self) -> (PipelineHandle, JoinHandle<Result<PipelineReport, PipelineFailure>>) {
        let pipeline = self.pipeline(config(true));
        let handle = pipeline.handle();
        let task = tokio::spawn(pipeline.run());
        assert_eq!(handle.wait_for(PipelineState::Running).await, PipelineState::Running);
        (handle, task)
    }

    /// Run a non-following pipeline until every reader reaches the log tail.
    async fn run_to_tail(&self) -> BTreeMap<String, LogPosition> {
        let report = self.pipeline(config(false)).run().await.unwrap();
        report.committed
    }
}

async fn wait_for<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

/// Drain once both sources have committed `through` or later.
async fn stop_when_committed(
    handle: PipelineHandle,
    task: JoinHandle<Result<PipelineReport, PipelineFailure>>,
    through: LogPosition,
) {
    let watch = handle.clone();
    wait_for(|| {
        let committed = watch.committed();
        ["customers", "orders"]
            .iter()
            .all(|source| committed.get(*source).is_some_and(|p| *p >= through))
    })
    .await;
    handle.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_end_to_end_insert_then_delete() {
    let h = Harness::new();
    h.insert_customer(1, "User_123").await;
    h.insert_order(1, 1, "Monitor", 199.99).await;

    let committed = h.run_to_tail().await;
    assert_eq!(committed["orders"], LogPosition(2));
    assert_eq!(committed["customers"], LogPosition(2));

    let doc = h.sink.documents()["1"].clone();
    assert_eq!(doc["order_id"], json!(1));
    assert_eq!(doc["customer_name"], json!("User_123"));
    assert_eq!(doc["customer_email"], json!("user_123@example.com"));
    assert_eq!(doc["product"], json!("Monitor"));
    assert_eq!(doc["total_amount"], json!(199.99));

    // Restart from the committed offsets and pick up the delete.
    h.delete("orders", 1).await;
    let committed = h.run_to_tail().await;

    assert!(h.sink.documents().get("1").is_none());
    assert_eq!(committed["orders"], LogPosition(3));
    assert_eq!(committed["customers"], LogPosition(3));
}

#[tokio::test]
async fn test_following_pipeline_propagates_live_changes_and_drains() {
    let h = Harness::new();
    let pipeline = h.pipeline(config(true));
    let handle = pipeline.handle();
    let task = tokio::spawn(pipeline.run());

    assert_eq!(handle.wait_for(PipelineState::Running).await, PipelineState::Running);

    h.write(vec![
        SourceWrite::Insert {
            table: "customers".to_string(),
            row: row(json!({"id": 1, "name": "Ada", "email": "ada@example.com"})),
        },
        SourceWrite::Insert {
            table: "orders".to_string(),
            row: row(json!({"order_id": 10, "customer_id": 1, "product": "Desk", "amount": 120.0})),
        },
    ])
    .await;

    let sink = h.sink.clone();
    wait_for(|| sink.documents().get("10").map(|d| d["customer_name"] == json!("Ada")) == Some(true)).await;

    let renamed = h.rename_customer(1, "Ada L.").await;
    wait_for(|| sink.documents()["10"]["customer_name"] == json!("Ada L.")).await;

    let watch = handle.clone();
    wait_for(|| watch.committed().get("customers") == Some(&renamed)).await;

    handle.shutdown();
    let report = task.await.unwrap().unwrap();
    assert_eq!(handle.state(), PipelineState::Stopped);
    assert_eq!(report.committed["customers"], renamed);
    assert!(report.rows_written >= 2);
}

#[tokio::test]
async fn test_order_without_customer_has_null_attributes() {
    let h = Harness::new();
    h.insert_order(5, 99, "Chair", 45.5).await;

    h.run_to_tail().await;

    let doc = h.sink.documents()["5"].clone();
    assert_eq!(doc["customer_name"], Value::Null);
    assert_eq!(doc["customer_email"], Value::Null);
    assert_eq!(doc["product"], json!("Chair"));
}

#[tokio::test]
async fn test_final_state_independent_of_arrival_order() {
    // Orders arriving before their customers, customers before orders, and a
    // foreign key moved between customers, all consumed live from the log.
    let a = Harness::new();
    let (handle_a, task_a) = a.start_following().await;
    a.insert_order(10, 1, "Desk", 10.0).await;
    a.insert_order(11, 2, "Lamp", 11.0).await;
    a.insert_customer(1, "Ada").await;
    a.insert_customer(2, "Bob").await;
    a.update_order(11, 1, "Lamp", 11.0).await;
    let last_a = a.insert_customer(3, "Cy").await;
    stop_when_committed(handle_a, task_a, last_a).await;

    let b = Harness::new();
    let (handle_b, task_b) = b.start_following().await;
    b.insert_customer(2, "Bob").await;
    b.insert_customer(1, "Ada").await;
    b.insert_order(11, 1, "Lamp", 11.0).await;
    b.insert_order(10, 1, "Desk", 10.0).await;
    let last_b = b.insert_customer(3, "Cy").await;
    stop_when_committed(handle_b, task_b, last_b).await;

    assert_eq!(a.sink.documents(), b.sink.documents());
    assert_eq!(a.sink.documents()["10"]["customer_name"], json!("Ada"));
    assert_eq!(a.sink.documents()["11"]["customer_name"], json!("Ada"));
}

#[tokio::test]
async fn test_incremental_runs_match_single_run() {
    // The same history applied with a restart in between ends in the same
    // documents as one run over the whole history.
    let incremental = Harness::new();
    incremental.insert_customer(1, "Ada").await;
    incremental.insert_order(10, 1, "Desk", 10.0).await;
    incremental.run_to_tail().await;
    incremental.insert_order(11, 1, "Lamp", 11.0).await;
    incremental.rename_customer(1, "Ada L.").await;
    incremental.delete("orders", 10).await;
    incremental.run_to_tail().await;

    let single = Harness::new();
    single.insert_customer(1, "Ada").await;
    single.insert_order(10, 1, "Desk", 10.0).await;
    single.insert_order(11, 1, "Lamp", 11.0).await;
    single.rename_customer(1, "Ada L.").await;
    single.delete("orders", 10).await;
    single.run_to_tail().await;

    assert_eq!(incremental.sink.documents(), single.sink.documents());
    assert_eq!(single.sink.documents().len(), 1);
    assert_eq!(single.sink.documents()["11"]["customer_name"], json!("Ada L."));
}

#[tokio::test]
async fn test_redelivered_prefix_is_idempotent() {
    let h = Harness::new();
    h.insert_customer(1, "Ada").await;
    h.insert_customer(2, "Bob").await;
    h.insert_order(10, 1, "Desk", 10.0).await;
    h.insert_order(11, 2, "Lamp", 11.0).await;
    h.update_order(10, 2, "Desk", 12.0).await;
    h.delete("orders", 11).await;
    h.rename_customer(2, "Bobby").await;

    h.run_to_tail().await;
    let expected = h.sink.documents();
    assert_eq!(expected.len(), 1);
    assert_eq!(expected["10"]["customer_name"], json!("Bobby"));

    // Simulate a crash after the sink write but before the offset commit:
    // offsets point at an early position, so everything after it is
    // delivered again against state rebuilt from the current snapshot.
    let replay = Harness {
        source: h.source.clone(),
        offsets: Arc::new(DuckDbStorage::in_memory().unwrap()),
        sink: h.sink.clone(),
    };
    replay.offsets.init_schema().await.unwrap();
    replay.offsets.save_offset("customers", LogPosition(2)).await.unwrap();
    replay.offsets.save_offset("orders", LogPosition(2)).await.unwrap();

    let committed = replay.run_to_tail().await;
    assert_eq!(h.sink.documents(), expected);
    // Orders has no entry at 7 but its drained read saw the log at 7.
    assert_eq!(committed["orders"], LogPosition(7));
    assert_eq!(committed["customers"], LogPosition(7));
}

#[tokio::test]
async fn test_restart_without_new_changes_emits_nothing() {
    let h = Harness::new();
    h.insert_customer(1, "Ada").await;
    h.insert_order(10, 1, "Desk", 10.0).await;

    let first = h.run_to_tail().await;
    let calls = h.sink.bulk_calls();

    let second = h.run_to_tail().await;
    assert_eq!(first, second);
    assert_eq!(h.sink.bulk_calls(), calls);
}

#[tokio::test]
async fn test_customer_delete_leaves_stale_document_until_next_order_event() {
    let h = Harness::new();
    h.insert_customer(1, "Ada").await;
    h.insert_order(10, 1, "Desk", 10.0).await;
    h.run_to_tail().await;

    h.delete("customers", 1).await;
    h.run_to_tail().await;
    assert_eq!(h.sink.documents()["10"]["customer_name"], json!("Ada"));

    h.update_order(10, 1, "Desk", 15.0).await;
    h.run_to_tail().await;
    let doc = h.sink.documents()["10"].clone();
    assert_eq!(doc["customer_name"], Value::Null);
    assert_eq!(doc["total_amount"], json!(15.0));
}

#[tokio::test]
async fn test_rejected_document_fails_pipeline_without_committing() {
    let h = Harness::new();
    h.insert_customer(1, "Ada").await;
    h.insert_order(10, 1, "Desk", 10.0).await;
    h.sink.reject_id("10");

    let failure = h.pipeline(config(false)).run().await.unwrap_err();

    assert_eq!(failure.component, "sink");
    assert!(matches!(failure.cause, FailureCause::Sink(WriterError::Rejected(_))));
    assert!(failure.has_unflushed());
    assert!(failure.committed.get("orders").is_none());
    assert!(h.offsets.load_offset("orders").await.unwrap().is_none());
}

#[tokio::test]
async fn test_sink_outage_within_budget_is_not_a_failure() {
    let h = Harness::new();
    h.insert_customer(1, "Ada").await;
    h.insert_order(10, 1, "Desk", 10.0).await;
    h.sink.fail_next(1);

    h.run_to_tail().await;
    assert_eq!(h.sink.documents()["10"]["customer_name"], json!("Ada"));
}

#[tokio::test]
async fn test_purged_log_fails_with_log_gap() {
    let h = Harness::new();
    h.insert_customer(1, "Ada").await;
    h.run_to_tail().await;

    h.insert_customer(2, "Bob").await;
    h.insert_customer(3, "Cy").await;
    h.source.purge_through(LogPosition(3)).await.unwrap();

    let failure = h.pipeline(config(false)).run().await.unwrap_err();
    assert_eq!(failure.component, "reader:customers");
    assert!(matches!(failure.cause, FailureCause::Reader(ReaderError::LogGap { .. })));
    assert_eq!(failure.committed["customers"], LogPosition(1));
    assert!(!failure.has_unflushed());
}

#[tokio::test]
async fn test_idle_table_survives_purge_of_other_tables_changes() {
    let h = Harness::new();
    h.insert_customer(1, "Ada").await;
    h.run_to_tail().await;

    let mut last = LogPosition(1);
    for id in 10..15 {
        last = h.insert_order(id, 1, "Desk", 10.0).await;
    }
    assert_eq!(last, LogPosition(6));

    // Customers saw no changes, yet its offset follows the log.
    let committed = h.run_to_tail().await;
    assert_eq!(committed["orders"], last);
    assert_eq!(committed["customers"], last);
    assert_eq!(h.offsets.load_offset("customers").await.unwrap().map(|o| o.position), Some(last));

    h.source.purge_through(last).await.unwrap();

    h.insert_order(15, 1, "Lamp", 11.0).await;
    let committed = h.run_to_tail().await;
    assert_eq!(committed["customers"], LogPosition(7));
    assert_eq!(h.sink.documents()["15"]["customer_name"], json!("Ada"));
}

/// Delegates to a real source but panics on snapshot reads.
struct PanickingSnapshots {
    inner: Arc<DuckDbSource>,
}

#[async_trait]
impl ChangeSource for PanickingSnapshots {
    async fn snapshot(&self, _table: &str) -> Result<Snapshot, SourceError> {
        panic!("snapshot cursor poisoned");
    }

    async fn changes_after(&self, table: &str, after: LogPosition, limit: usize) -> Result<ChangePage, SourceError> {
        self.inner.changes_after(table, after, limit).await
    }
}

#[tokio::test]
async fn test_panicking_reader_is_reported_by_component() {
    let h = Harness::new();
    h.insert_customer(1, "Ada").await;

    let mut sources: BTreeMap<String, Arc<dyn ChangeSource>> = BTreeMap::new();
    sources.insert(
        "customers".to_string(),
        Arc::new(PanickingSnapshots {
            inner: h.source.clone(),
        }),
    );
    sources.insert("orders".to_string(), h.source.clone());
    let pipeline = Pipeline::new(config(false), sources, h.offsets.clone(), h.sink.clone());

    let failure = pipeline.run().await.unwrap_err();
    assert_eq!(failure.component, "reader:customers");
    match failure.cause {
        FailureCause::Task(message) => assert!(message.contains("snapshot cursor poisoned")),
        other => panic!("expected a task failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_status_handle_reports_table_rows() {
    let h = Harness::new();
    h.insert_customer(1, "Ada").await;
    h.insert_order(10, 1, "Desk", 10.0).await;
    h.insert_order(11, 1, "Lamp", 11.0).await;

    let pipeline = h.pipeline(config(false));
    let handle = pipeline.handle();
    pipeline.run().await.unwrap();

    let rows = handle.table_rows();
    assert_eq!(rows["orders"], 2);
    assert_eq!(rows["customers"], 1);
    assert_eq!(handle.writer_stats().unflushed_rows(), 0);
}
