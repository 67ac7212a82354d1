use super::channel::create_channel;
use super::runner::run_join;
use crate::config::types::Config;
use crate::join::{JoinError, JoinOperator, JoinSpec};
use crate::sink::{run_writer, DocumentStore, SharedWriterStats, SinkAck, WriterError, WriterStats};
use crate::source::{ChangeBatch, ChangeLogReader, ChangeSource, LogPosition, ReaderError};
use crate::state::{KeyedStateStore, MemoryStateStore};
use crate::storage::{OffsetStore, OffsetTracker, SharedOffsets, StorageError};
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Starting,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Failed)
    }
}

#[derive(Debug, Error)]
pub enum FailureCause {
    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error(transparent)]
    Sink(#[from] WriterError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("no source collaborator for '{0}'")]
    MissingSource(String),

    #[error("task failed: {0}")]
    Task(String),
}

/// Terminal pipeline error. Describes where it failed and what was durable
/// at that point, to guide manual recovery.
#[derive(Debug, Error)]
#[error("pipeline failed in {component}: {cause}")]
pub struct PipelineFailure {
    pub component: String,
    /// Last durably committed offset per source.
    pub committed: BTreeMap<String, LogPosition>,
    /// Rows accepted by the sink writer but never acknowledged by the store.
    pub unflushed_rows: usize,
    #[source]
    pub cause: FailureCause,
}

impl PipelineFailure {
    pub fn has_unflushed(&self) -> bool {
        self.unflushed_rows > 0
    }
}

/// Outcome of a pipeline that reached `Stopped`.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub committed: BTreeMap<String, LogPosition>,
    pub rows_written: u64,
}

/// Cheap handle for observing and stopping a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    shutdown: CancellationToken,
    state: watch::Receiver<PipelineState>,
    offsets: SharedOffsets,
    writer: SharedWriterStats,
    join_state: Arc<dyn KeyedStateStore>,
    tables: Vec<String>,
}

impl PipelineHandle {
    /// Request a graceful drain.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Wait until the pipeline reaches `target` or a terminal state.
    pub async fn wait_for(&self, target: PipelineState) -> PipelineState {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            if current == target || current.is_terminal() {
                return current;
            }
            if state.changed().await.is_err() {
                return *state.borrow();
            }
        }
    }

    pub fn committed(&self) -> BTreeMap<String, LogPosition> {
        self.offsets.read().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn writer_stats(&self) -> WriterStats {
        self.writer.lock().map(|g| g.clone()).unwrap_or_default()
    }

    /// Rows currently held in keyed state, per table.
    pub fn table_rows(&self) -> BTreeMap<String, usize> {
        self.tables
            .iter()
            .filter_map(|t| self.join_state.len(t).ok().map(|n| (t.clone(), n)))
            .collect()
    }
}

type TaskOutcome = (String, Result<(), FailureCause>);

/// Spawn a pipeline component, reporting a panic as that component's failure.
fn spawn_component<F>(tasks: &mut JoinSet<TaskOutcome>, component: String, future: F)
where
    F: Future<Output = Result<(), FailureCause>> + Send + 'static,
{
    tasks.spawn(async move {
        let result = match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(component = %component, "Pipeline task panicked: {}", message);
                Err(FailureCause::Task(format!("panicked: {}", message)))
            }
        };
        (component, result)
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

struct Running {
    tasks: JoinSet<TaskOutcome>,
    acks: mpsc::Receiver<SinkAck>,
}

/// Wires readers, the join task and the sink writer together, commits
/// offsets as the sink acknowledges, and owns the pipeline state machine:
/// `Starting -> Running -> Draining -> Stopped`, or `Failed` from any
/// non-terminal state.
pub struct Pipeline {
    config: Config,
    sources: BTreeMap<String, Arc<dyn ChangeSource>>,
    offset_store: Arc<dyn OffsetStore>,
    sink: Arc<dyn DocumentStore>,
    join_state: Arc<dyn KeyedStateStore>,
    tracker: OffsetTracker,
    writer_stats: SharedWriterStats,
    shutdown: CancellationToken,
    state_tx: watch::Sender<PipelineState>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        sources: BTreeMap<String, Arc<dyn ChangeSource>>,
        offset_store: Arc<dyn OffsetStore>,
        sink: Arc<dyn DocumentStore>,
    ) -> Self {
        let spec = JoinSpec::from_config(&config);
        let join_state: Arc<dyn KeyedStateStore> = Arc::new(MemoryStateStore::new(
            [spec.many_table, spec.one_table],
            config.state.partitions,
        ));
        let (state_tx, _) = watch::channel(PipelineState::Starting);

        Self {
            tracker: OffsetTracker::new(Arc::clone(&offset_store)),
            config,
            sources,
            offset_store,
            sink,
            join_state,
            writer_stats: SharedWriterStats::default(),
            shutdown: CancellationToken::new(),
            state_tx,
        }
    }

    pub fn handle(&self) -> PipelineHandle {
        let spec = JoinSpec::from_config(&self.config);
        PipelineHandle {
            shutdown: self.shutdown.clone(),
            state: self.state_tx.subscribe(),
            offsets: self.tracker.shared(),
            writer: Arc::clone(&self.writer_stats),
            join_state: Arc::clone(&self.join_state),
            tables: vec![spec.many_table, spec.one_table],
        }
    }

    /// Run until every reader reaches the end of its log, a drain is
    /// requested through the handle, or a component fails.
    pub async fn run(self) -> Result<PipelineReport, PipelineFailure> {
        let result = self.run_inner().await;
        // Releases anything waiting on the token, such as the status server.
        self.shutdown.cancel();
        result
    }

    async fn run_inner(&self) -> Result<PipelineReport, PipelineFailure> {
        self.set_state(PipelineState::Starting);

        let Running { mut tasks, mut acks } = match self.start().await {
            Ok(running) => running,
            Err((component, cause)) => return Err(self.fail(component, cause)),
        };

        self.set_state(PipelineState::Running);
        info!(sources = self.sources.len(), "Pipeline running");

        let mut draining = false;
        let mut acks_open = true;

        loop {
            if !acks_open && tasks.is_empty() {
                break;
            }

            tokio::select! {
                _ = self.shutdown.cancelled(), if !draining => {
                    draining = true;
                    self.set_state(PipelineState::Draining);
                    info!("Drain requested, finishing in-flight work");
                }

                ack = acks.recv(), if acks_open => {
                    match ack {
                        Some(ack) => {
                            if let Err(e) = self.commit(&ack).await {
                                tasks.abort_all();
                                return Err(self.fail("offsets".to_string(), e.into()));
                            }
                        }
                        None => acks_open = false,
                    }
                }

                joined = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Some(Ok((component, Ok(())))) => {
                            info!(component = %component, "Pipeline task finished");
                        }
                        Some(Ok((component, Err(cause)))) => {
                            tasks.abort_all();
                            return Err(self.fail(component, cause));
                        }
                        Some(Err(e)) => {
                            tasks.abort_all();
                            return Err(self.fail("task".to_string(), FailureCause::Task(e.to_string())));
                        }
                        None => {}
                    }
                }
            }
        }

        self.set_state(PipelineState::Stopped);
        let report = PipelineReport {
            committed: self.tracker.committed(),
            rows_written: self.writer_stats.lock().map(|s| s.flushed_rows).unwrap_or(0),
        };
        info!(
            committed = ?report.committed,
            rows_written = report.rows_written,
            "Pipeline stopped"
        );
        Ok(report)
    }

    /// Load offsets, rebuild keyed state, open readers and spawn the tasks.
    async fn start(&self) -> Result<Running, (String, FailureCause)> {
        self.offset_store
            .init_schema()
            .await
            .map_err(|e| ("offsets".to_string(), e.into()))?;

        let mut join = JoinOperator::new(JoinSpec::from_config(&self.config), Arc::clone(&self.join_state));
        let mut readers = Vec::with_capacity(self.config.sources.len());
        let mut restored = false;

        for (source_id, source_config) in &self.config.sources {
            let component = format!("reader:{}", source_id);
            let source = self
                .sources
                .get(source_id)
                .cloned()
                .ok_or_else(|| (component.clone(), FailureCause::MissingSource(source_id.clone())))?;

            let resume = self
                .tracker
                .load(source_id)
                .await
                .map_err(|e| ("offsets".to_string(), e.into()))?;

            let reader = ChangeLogReader::open(source_id, source_config, source, resume)
                .await
                .map_err(|e| (component.clone(), e.into()))?;

            if resume.is_some() {
                let snapshot = reader
                    .fetch_snapshot()
                    .await
                    .map_err(|e| (component.clone(), e.into()))?;
                join.restore(reader.table(), snapshot)
                    .map_err(|e| ("state".to_string(), e.into()))?;
                restored = true;
            }

            readers.push(reader);
        }

        if restored {
            join.check_consistency()
                .map_err(|e| ("state".to_string(), e.into()))?;
        }

        let buffer = self.config.pipeline.channel_buffer;
        let (batch_tx, batch_rx) = create_channel::<ChangeBatch>(buffer);
        let (sink_tx, sink_rx) = create_channel(buffer);
        let (ack_tx, ack_rx) = create_channel(buffer);

        let mut tasks = JoinSet::new();

        for reader in readers {
            let component = format!("reader:{}", reader.source_id());
            let output = batch_tx.clone();
            let shutdown = self.shutdown.clone();
            spawn_component(&mut tasks, component, async move {
                run_reader(reader, output, shutdown).await.map_err(FailureCause::from)
            });
        }
        drop(batch_tx);

        spawn_component(&mut tasks, "join".to_string(), async move {
            run_join(batch_rx, sink_tx, join).await.map_err(FailureCause::from)
        });

        let store = Arc::clone(&self.sink);
        let sink_config = self.config.sink.clone();
        let stats = Arc::clone(&self.writer_stats);
        spawn_component(&mut tasks, "sink".to_string(), async move {
            run_writer(sink_rx, ack_tx, store, &sink_config, stats)
                .await
                .map_err(FailureCause::from)
        });

        Ok(Running { tasks, acks: ack_rx })
    }

    /// Commit the newest acknowledged position per source.
    async fn commit(&self, ack: &SinkAck) -> Result<(), StorageError> {
        let mut latest: BTreeMap<&str, LogPosition> = BTreeMap::new();
        for progress in &ack.progress {
            let entry = latest.entry(progress.source_id.as_str()).or_insert(progress.position);
            *entry = (*entry).max(progress.position);
        }
        for (source_id, position) in latest {
            self.tracker.commit(source_id, position).await?;
        }
        Ok(())
    }

    fn fail(&self, component: String, cause: FailureCause) -> PipelineFailure {
        self.shutdown.cancel();
        self.set_state(PipelineState::Failed);

        let failure = PipelineFailure {
            component,
            committed: self.tracker.committed(),
            unflushed_rows: self.writer_stats.lock().map(|s| s.unflushed_rows()).unwrap_or(0),
            cause,
        };
        error!(
            component = %failure.component,
            committed = ?failure.committed,
            unflushed_rows = failure.unflushed_rows,
            error = %failure.cause,
            "Pipeline failed"
        );
        failure
    }

    fn set_state(&self, state: PipelineState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(from = ?previous, to = ?state, "Pipeline state changed");
        }
    }
}

/// Pump one reader's batches into the join channel until the log ends, a
/// drain is requested, or the reader fails. A batch already being sent is
/// always delivered before the drain is honoured.
async fn run_reader(
    reader: ChangeLogReader,
    output: mpsc::Sender<ChangeBatch>,
    shutdown: CancellationToken,
) -> Result<(), ReaderError> {
    let source_id = reader.source_id().to_string();
    let mut stream = reader.into_stream();

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!(source_id = %source_id, "Reader stopping for drain");
                break;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(batch)) => {
                if output.send(batch).await.is_err() {
                    warn!(source_id = %source_id, "Join channel closed, stopping reader");
                    break;
                }
            }
            Some(Err(e)) => return Err(e),
            None => {
                info!(source_id = %source_id, "Reader reached end of log");
                break;
            }
        }
    }

    Ok(())
}
