use super::traits::{DocumentStore, SinkError, SinkOp};
use crate::config::types::{RetryPolicy, SinkConfig};
use crate::join::JoinedRow;
use crate::retry::{with_retry, RetryError};
use crate::source::record::LogPosition;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("sink unavailable after {attempts} attempts: {cause}")]
    Unavailable { attempts: usize, cause: SinkError },

    #[error("{0}")]
    Rejected(SinkError),

    #[error("flush task failed: {0}")]
    Task(String),
}

/// A source position whose records have all been handed to the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub source_id: String,
    pub position: LogPosition,
}

/// Joined rows for one change batch, plus the source position they cover.
#[derive(Debug)]
pub struct SinkMessage {
    pub rows: Vec<JoinedRow>,
    pub progress: Progress,
}

/// Positions made durable by a successful flush, in the order received.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkAck {
    pub progress: Vec<Progress>,
    pub rows: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WriterStats {
    pub buffered_rows: usize,
    pub in_flight_rows: usize,
    pub flushed_batches: u64,
    pub flushed_rows: u64,
}

impl WriterStats {
    /// Rows accepted by the writer but not yet acknowledged by the store.
    pub fn unflushed_rows(&self) -> usize {
        self.buffered_rows + self.in_flight_rows
    }
}

pub type SharedWriterStats = Arc<Mutex<WriterStats>>;

/// Rows waiting for the next flush. Only the newest op per document id is
/// kept; document writes are keyed, so the earlier ones are superseded.
#[derive(Debug, Default)]
struct PendingBatch {
    ops: Vec<SinkOp>,
    slots: HashMap<String, usize>,
    progress: Vec<Progress>,
    rows: usize,
}

impl PendingBatch {
    fn push(&mut self, message: SinkMessage) {
        for row in message.rows {
            self.rows += 1;
            let op = SinkOp::from(row);
            match self.slots.get(op.id()) {
                Some(&slot) => self.ops[slot] = op,
                None => {
                    self.slots.insert(op.id().to_string(), self.ops.len());
                    self.ops.push(op);
                }
            }
        }
        self.progress.push(message.progress);
    }

    fn len(&self) -> usize {
        self.ops.len()
    }

    fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.progress.is_empty()
    }
}

type FlushHandle = JoinHandle<Result<SinkAck, WriterError>>;

fn spawn_flush(store: Arc<dyn DocumentStore>, retry: RetryPolicy, batch: PendingBatch) -> FlushHandle {
    tokio::spawn(async move {
        if !batch.ops.is_empty() {
            let ops = batch.ops;
            with_retry(&retry, "sink", || store.bulk(&ops))
                .await
                .map_err(|e| match e {
                    RetryError::Fatal(cause) => {
                        error!(error = %cause, "Sink rejected batch");
                        WriterError::Rejected(cause)
                    }
                    RetryError::Exhausted { attempts, last } => WriterError::Unavailable {
                        attempts,
                        cause: last,
                    },
                })?;
        }
        Ok(SinkAck {
            progress: batch.progress,
            rows: batch.rows,
        })
    })
}

async fn wait_flush(in_flight: &mut Option<FlushHandle>) -> Result<SinkAck, WriterError> {
    match in_flight {
        Some(handle) => handle.await.map_err(|e| WriterError::Task(e.to_string()))?,
        None => std::future::pending().await,
    }
}

fn record_stats(stats: &SharedWriterStats, buffered: usize, in_flight: usize, flushed: Option<&SinkAck>) {
    if let Ok(mut guard) = stats.lock() {
        guard.buffered_rows = buffered;
        guard.in_flight_rows = in_flight;
        if let Some(ack) = flushed {
            guard.flushed_batches += 1;
            guard.flushed_rows += ack.rows as u64;
        }
    }
}

/// Run the sink writer task.
///
/// Buffers joined rows and flushes them to the document store when the
/// buffer reaches `batch_size` or on every `flush_interval` tick. At most one
/// flush is in flight; rows keep buffering while it runs. Each successful
/// flush sends the progress markers it covered on `acks`, so positions are
/// only reported once their rows are durable. Returns after the input closes
/// and everything buffered has been flushed.
pub async fn run_writer(
    mut input: mpsc::Receiver<SinkMessage>,
    acks: mpsc::Sender<SinkAck>,
    store: Arc<dyn DocumentStore>,
    config: &SinkConfig,
    stats: SharedWriterStats,
) -> Result<(), WriterError> {
    let batch_size = config.batch_size.max(1);
    let mut active = PendingBatch::default();
    let mut in_flight: Option<FlushHandle> = None;
    let mut in_flight_rows = 0;
    let mut input_open = true;
    let mut flush_interval = tokio::time::interval(config.flush_interval);

    info!(batch_size, flush_interval = ?config.flush_interval, "Sink writer started");

    loop {
        if !input_open && in_flight.is_none() {
            if active.is_empty() {
                break;
            }
            in_flight_rows = active.len();
            in_flight = Some(spawn_flush(store.clone(), config.retry.clone(), std::mem::take(&mut active)));
            record_stats(&stats, 0, in_flight_rows, None);
            continue;
        }

        // Stop reading once a full batch is waiting behind the in-flight one.
        let accepting = input_open && !(in_flight.is_some() && active.len() >= batch_size);

        tokio::select! {
            message = input.recv(), if accepting => {
                match message {
                    Some(message) => {
                        active.push(message);
                        if active.len() >= batch_size && in_flight.is_none() {
                            in_flight_rows = active.len();
                            in_flight = Some(spawn_flush(store.clone(), config.retry.clone(), std::mem::take(&mut active)));
                        }
                        record_stats(&stats, active.len(), in_flight_rows, None);
                    }
                    None => {
                        debug!("Sink input closed, flushing remaining rows");
                        input_open = false;
                    }
                }
            }

            _ = flush_interval.tick() => {
                if in_flight.is_none() && !active.is_empty() {
                    in_flight_rows = active.len();
                    in_flight = Some(spawn_flush(store.clone(), config.retry.clone(), std::mem::take(&mut active)));
                    record_stats(&stats, 0, in_flight_rows, None);
                }
            }

            result = wait_flush(&mut in_flight) => {
                in_flight = None;
                let ack = result?;
                in_flight_rows = 0;
                record_stats(&stats, active.len(), 0, Some(&ack));
                debug!(rows = ack.rows, positions = ack.progress.len(), "Flush acknowledged");

                if acks.send(ack).await.is_err() {
                    warn!("Ack channel closed, stopping sink writer");
                    return Ok(());
                }

                if active.len() >= batch_size {
                    in_flight_rows = active.len();
                    in_flight = Some(spawn_flush(store.clone(), config.retry.clone(), std::mem::take(&mut active)));
                    record_stats(&stats, 0, in_flight_rows, None);
                }
            }
        }
    }

    info!("Sink writer shutdown complete");
    Ok(())
}
