//! Tests for the Elasticsearch document store against a local mock of the
//! `_bulk` and `_doc` endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use weft::cli::run::{assemble, Assembled};
use weft::cli::verify::Verifier;
use weft::config::parse_config;
use weft::pipeline::PipelineState;
use weft::sink::{DocumentStore, ElasticsearchSink, SinkError, SinkOp};
use weft::source::{Row, SourceWrite};

#[derive(Clone, Default)]
struct MockState {
    docs: Arc<Mutex<BTreeMap<String, Value>>>,
    /// Number of upcoming bulk requests answered with 429.
    throttle: Arc<AtomicUsize>,
    bulk_requests: Arc<AtomicUsize>,
}

impl MockState {
    fn doc(&self, id: &str) -> Option<Value> {
        self.docs.lock().unwrap().get(id).cloned()
    }
}

async fn bulk(State(state): State<MockState>, body: String) -> Response {
    state.bulk_requests.fetch_add(1, Ordering::SeqCst);
    if state
        .throttle
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return (StatusCode::TOO_MANY_REQUESTS, "es_rejected_execution_exception").into_response();
    }

    let mut docs = state.docs.lock().unwrap();
    let mut lines = body.lines().filter(|l| !l.trim().is_empty());
    let mut items = Vec::new();
    let mut errors = false;

    while let Some(line) = lines.next() {
        let action: Value = serde_json::from_str(line).unwrap();
        if let Some(meta) = action.get("index") {
            let id = meta["_id"].as_str().unwrap().to_string();
            let document: Value = serde_json::from_str(lines.next().unwrap()).unwrap();
            if id.starts_with("bad") {
                errors = true;
                items.push(json!({"index": {
                    "_id": id,
                    "status": 400,
                    "error": {"type": "mapper_parsing_exception", "reason": "failed to parse"}
                }}));
            } else {
                docs.insert(id.clone(), document);
                items.push(json!({"index": {"_id": id, "status": 200}}));
            }
        } else if let Some(meta) = action.get("delete") {
            let id = meta["_id"].as_str().unwrap().to_string();
            let status = if docs.remove(&id).is_some() { 200 } else { 404 };
            errors |= status != 200;
            items.push(json!({"delete": {"_id": id, "status": status}}));
        }
    }

    Json(json!({"took": 1, "errors": errors, "items": items})).into_response()
}

async fn get_doc(State(state): State<MockState>, Path((_index, id)): Path<(String, String)>) -> Response {
    match state.doc(&id) {
        Some(document) => Json(json!({"_id": id, "found": true, "_source": document})).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({"_id": id, "found": false}))).into_response(),
    }
}

async fn spawn_mock(state: MockState) -> String {
    let app = Router::new()
        .route("/_bulk", post(bulk))
        .route("/:index/_doc/:id", get(get_doc))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn upsert(id: &str, document: Value) -> SinkOp {
    SinkOp::Upsert {
        id: id.to_string(),
        document: row(document),
    }
}

async fn sink() -> (ElasticsearchSink, MockState) {
    let state = MockState::default();
    let url = spawn_mock(state.clone()).await;
    let sink = ElasticsearchSink::new(&url, "enriched_orders", true, Duration::from_secs(5)).unwrap();
    (sink, state)
}

#[tokio::test]
async fn test_bulk_upsert_get_and_delete() {
    let (sink, state) = sink().await;

    sink.bulk(&[
        upsert("1", json!({"order_id": 1, "customer_name": "Ada"})),
        upsert("2", json!({"order_id": 2, "customer_name": null})),
    ])
    .await
    .unwrap();

    assert_eq!(state.doc("1").unwrap()["customer_name"], json!("Ada"));
    let fetched = sink.get("2").await.unwrap().unwrap();
    assert_eq!(fetched["customer_name"], Value::Null);

    sink.bulk(&[SinkOp::Delete { id: "1".to_string() }]).await.unwrap();
    assert!(sink.get("1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_deleting_absent_document_succeeds() {
    let (sink, state) = sink().await;
    sink.bulk(&[SinkOp::Delete { id: "404".to_string() }]).await.unwrap();
    assert_eq!(state.bulk_requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_empty_bulk_sends_nothing() {
    let (sink, state) = sink().await;
    sink.bulk(&[]).await.unwrap();
    assert_eq!(state.bulk_requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_throttled_bulk_is_transient() {
    let (sink, state) = sink().await;
    state.throttle.store(1, Ordering::SeqCst);

    let err = sink.bulk(&[upsert("1", json!({"a": 1}))]).await.unwrap_err();
    assert!(matches!(err, SinkError::Unavailable(_)));

    sink.bulk(&[upsert("1", json!({"a": 1}))]).await.unwrap();
    assert!(state.doc("1").is_some());
}

#[tokio::test]
async fn test_mapping_failure_is_rejection() {
    let (sink, _state) = sink().await;
    let err = sink
        .bulk(&[upsert("ok", json!({"a": 1})), upsert("bad-1", json!({"a": "x"}))])
        .await
        .unwrap_err();

    match err {
        SinkError::Rejected { id, reason } => {
            assert_eq!(id, "bad-1");
            assert!(reason.contains("mapper_parsing_exception"));
        }
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_store_is_transient() {
    // Bind then drop to get a port nothing listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let sink = ElasticsearchSink::new(&format!("http://{}", addr), "docs", false, Duration::from_secs(1)).unwrap();
    let err = sink.bulk(&[upsert("1", json!({}))]).await.unwrap_err();
    assert!(matches!(err, SinkError::Unavailable(_)));
}

fn file_config(dir: &TempDir, url: &str, follow: bool) -> String {
    format!(
        r#"
sources:
  customers:
    primary_key: [id]
    connection: {{ type: duckdb, path: {source} }}
    read: {{ follow: {follow}, poll_interval: 20ms }}
  orders:
    primary_key: [order_id]
    connection: {{ type: duckdb, path: {source} }}
    read: {{ follow: {follow}, poll_interval: 20ms }}
join:
  many: orders
  one: customers
  foreign_key: [customer_id]
  output:
    - {{ name: order_id, from: many, column: order_id }}
    - {{ name: customer_name, from: one, column: name }}
    - {{ name: product, from: many, column: product }}
    - {{ name: total_amount, from: many, column: amount }}
sink:
  type: elasticsearch
  url: {url}
  index: enriched_orders
  flush_interval: 20ms
  retry: {{ max_attempts: 3, initial_backoff: 5ms, max_backoff: 10ms, timeout: 2s }}
checkpoint:
  path: {checkpoint}
"#,
        source = dir.path().join("source.duckdb").display(),
        checkpoint = dir.path().join("offsets.duckdb").display(),
    )
}

#[tokio::test]
async fn test_pipeline_writes_joined_documents_to_index() {
    let state = MockState::default();
    let url = spawn_mock(state.clone()).await;
    let dir = TempDir::new().unwrap();
    let config = parse_config(&file_config(&dir, &url, false)).unwrap();

    let Assembled { pipeline, sources, .. } = assemble(config).unwrap();
    sources["customers"]
        .write(vec![
            SourceWrite::Insert {
                table: "customers".to_string(),
                row: row(json!({"id": 1, "name": "User_123", "email": "user_123@example.com"})),
            },
            SourceWrite::Insert {
                table: "orders".to_string(),
                row: row(json!({"order_id": 1, "customer_id": 1, "product": "Monitor", "amount": 199.99})),
            },
        ])
        .await
        .unwrap();
    // A throttled first attempt is retried within the budget.
    state.throttle.store(1, Ordering::SeqCst);

    let report = pipeline.run().await.unwrap();
    assert_eq!(report.rows_written, 1);

    let doc = state.doc("1").unwrap();
    assert_eq!(
        doc,
        json!({"order_id": 1, "customer_name": "User_123", "product": "Monitor", "total_amount": 199.99})
    );
}

#[tokio::test]
async fn test_verifier_round_trip() {
    let state = MockState::default();
    let url = spawn_mock(state.clone()).await;
    let dir = TempDir::new().unwrap();
    let config = parse_config(&file_config(&dir, &url, true)).unwrap();

    let Assembled { pipeline, sources, sink } = assemble(config.clone()).unwrap();
    let verifier = Verifier::new(&config, &sources, sink)
        .unwrap()
        .with_poll_interval(Duration::from_millis(20));
    assert_eq!(verifier.name_field(), "customer_name");

    let handle = pipeline.handle();
    let task = tokio::spawn(pipeline.run());
    assert_eq!(handle.wait_for(PipelineState::Running).await, PipelineState::Running);

    let inserted = verifier.insert_pair().await.unwrap();
    assert!(inserted.name.starts_with("User_"));
    assert!((20.0..=500.0).contains(&inserted.amount));

    let document = verifier
        .wait_for_document(&inserted, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(document["product"], json!(inserted.product));
    assert_eq!(document["order_id"], json!(inserted.child_id));

    handle.shutdown();
    task.await.unwrap().unwrap();
    assert_eq!(handle.state(), PipelineState::Stopped);
}

#[tokio::test]
async fn test_verifier_times_out_without_pipeline() {
    let state = MockState::default();
    let url = spawn_mock(state).await;
    let dir = TempDir::new().unwrap();
    let config = parse_config(&file_config(&dir, &url, true)).unwrap();

    let Assembled { sources, sink, .. } = assemble(config.clone()).unwrap();
    let verifier = Verifier::new(&config, &sources, sink)
        .unwrap()
        .with_poll_interval(Duration::from_millis(10));

    let inserted = verifier.insert_pair().await.unwrap();
    let err = verifier
        .wait_for_document(&inserted, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("customer_name"));
}
