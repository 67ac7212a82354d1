use crate::join::{JoinError, JoinOperator};
use crate::sink::{Progress, SinkMessage};
use crate::source::record::{ChangeBatch, LogPosition};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Run the join task.
///
/// Receives change batches from every source reader, applies each record to
/// the join operator, and forwards the joined rows together with the batch's
/// resume position to the sink writer. This task is the only writer of the
/// keyed state. An empty batch is forwarded only when it moves its source's
/// position past the last one forwarded; repeated heartbeats are dropped.
/// Returns when the input closes.
pub async fn run_join(
    mut input: mpsc::Receiver<ChangeBatch>,
    output: mpsc::Sender<SinkMessage>,
    mut join: JoinOperator,
) -> Result<(), JoinError> {
    info!(
        many = %join.spec().many_table,
        one = %join.spec().one_table,
        "Join task started"
    );

    let mut batches = 0u64;
    let mut emitted = 0u64;
    let mut forwarded: HashMap<String, LogPosition> = HashMap::new();

    while let Some(batch) = input.recv().await {
        if batch.is_heartbeat()
            && forwarded
                .get(&batch.source_id)
                .is_some_and(|last| batch.position <= *last)
        {
            continue;
        }
        forwarded.insert(batch.source_id.clone(), batch.position);

        let mut rows = Vec::new();
        for record in &batch.records {
            rows.extend(join.process(record)?);
        }

        debug!(
            source_id = %batch.source_id,
            records = batch.records.len(),
            rows = rows.len(),
            position = %batch.position,
            "Joined change batch"
        );

        batches += 1;
        emitted += rows.len() as u64;

        let message = SinkMessage {
            rows,
            progress: Progress {
                source_id: batch.source_id,
                position: batch.position,
            },
        };
        if output.send(message).await.is_err() {
            warn!("Sink channel closed, stopping join task");
            break;
        }
    }

    info!(batches, emitted, "Join task shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{JoinSide, OutputColumn};
    use crate::join::JoinSpec;
    use crate::source::record::{ChangeRecord, Operation, RowKey};
    use crate::state::MemoryStateStore;
    use serde_json::json;
    use std::sync::Arc;

    fn operator() -> JoinOperator {
        let spec = JoinSpec {
            many_table: "orders".to_string(),
            one_table: "customers".to_string(),
            foreign_key: vec!["customer_id".to_string()],
            output: vec![OutputColumn {
                name: "customer_name".to_string(),
                from: JoinSide::One,
                column: "name".to_string(),
            }],
        };
        JoinOperator::new(spec, Arc::new(MemoryStateStore::new(["orders", "customers"], 2)))
    }

    fn batch(source_id: &str, records: Vec<ChangeRecord>, position: u64, snapshot: bool) -> ChangeBatch {
        ChangeBatch {
            source_id: source_id.to_string(),
            records,
            position: LogPosition(position),
            snapshot,
        }
    }

    fn order(id: i64, position: u64) -> ChangeRecord {
        ChangeRecord {
            source_table: "orders".to_string(),
            operation: Operation::Insert,
            key: RowKey::new(id.to_string()),
            before: None,
            after: json!({"order_id": id, "customer_id": 1}).as_object().cloned(),
            log_position: LogPosition(position),
            committed_at: None,
        }
    }

    #[tokio::test]
    async fn test_forwards_rows_and_progress() {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let handle = tokio::spawn(run_join(in_rx, out_tx, operator()));

        in_tx.send(batch("customers", vec![], 0, true)).await.unwrap();
        in_tx.send(batch("orders", vec![order(1, 3), order(2, 4)], 4, false)).await.unwrap();
        in_tx.send(batch("orders", vec![], 4, false)).await.unwrap();
        in_tx.send(batch("orders", vec![], 6, false)).await.unwrap();
        drop(in_tx);

        handle.await.unwrap().unwrap();

        // Empty snapshot is forwarded so its position can be committed.
        let first = out_rx.recv().await.unwrap();
        assert!(first.rows.is_empty());
        assert_eq!(first.progress.source_id, "customers");

        let second = out_rx.recv().await.unwrap();
        assert_eq!(second.rows.len(), 2);
        assert_eq!(second.progress.position, LogPosition(4));

        // The heartbeat at 4 is dropped, the advance to 6 is not.
        let third = out_rx.recv().await.unwrap();
        assert!(third.rows.is_empty());
        assert_eq!(third.progress.source_id, "orders");
        assert_eq!(third.progress.position, LogPosition(6));
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_join_error_stops_task() {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        let handle = tokio::spawn(run_join(in_rx, out_tx, operator()));

        let mut stray = order(1, 1);
        stray.source_table = "invoices".to_string();
        in_tx.send(batch("invoices", vec![stray], 1, false)).await.unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(JoinError::UnexpectedTable(_))));
    }
}
