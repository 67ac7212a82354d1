use super::record::{ChangeBatch, ChangeRecord, LogPosition, Operation};
use super::traits::{ChangePage, ChangeSource, Snapshot, SourceError};
use crate::config::types::{ReadConfig, RetryPolicy, SourceConfig};
use crate::retry::{with_retry, RetryError, Retryable};
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("source '{source_id}' unavailable after {attempts} attempts: {cause}")]
    SourceUnavailable {
        source_id: String,
        attempts: usize,
        cause: SourceError,
    },

    #[error("source '{source_id}' cannot resume after {requested}: log purged through {purged_through}, a fresh snapshot is required")]
    LogGap {
        source_id: String,
        requested: LogPosition,
        purged_through: LogPosition,
    },

    #[error("source '{source_id}' error: {cause}")]
    Source {
        source_id: String,
        cause: SourceError,
    },

    #[error("source '{source_id}' returned position {got} after {cursor}")]
    OutOfOrder {
        source_id: String,
        cursor: LogPosition,
        got: LogPosition,
    },
}

impl Retryable for SourceError {
    fn is_transient(&self) -> bool {
        SourceError::is_transient(self)
    }

    fn timed_out(after: Duration) -> Self {
        SourceError::Unavailable(format!("no response within {:?}", after))
    }
}

/// Tails one source table's change log.
///
/// Starting without a resume position, the reader first emits the table's
/// snapshot as one batch of Insert records at the snapshot's high-water
/// position, then continues with log entries after it. Starting with a
/// position, it emits only entries strictly after it.
pub struct ChangeLogReader {
    source_id: String,
    table: String,
    source: Arc<dyn ChangeSource>,
    read: ReadConfig,
    retry: RetryPolicy,
    cursor: Option<LogPosition>,
}

impl ChangeLogReader {
    /// Open a reader for `source_id`, resuming strictly after `resume`
    /// (or from a snapshot when `resume` is `None`).
    ///
    /// Verifies the source is reachable and, when resuming, that the log
    /// still retains the requested position.
    pub async fn open(
        source_id: &str,
        config: &SourceConfig,
        source: Arc<dyn ChangeSource>,
        resume: Option<LogPosition>,
    ) -> Result<Self, ReaderError> {
        let reader = Self {
            source_id: source_id.to_string(),
            table: config.table_name(source_id).to_string(),
            source,
            read: config.read.clone(),
            retry: config.retry.clone(),
            cursor: resume,
        };

        if let Some(position) = resume {
            // Probe with an empty read so purged logs fail at open time.
            reader.fetch_after(position, 1).await?;
        }

        tracing::info!(
            source_id = %reader.source_id,
            table = %reader.table,
            resume = ?resume,
            "Opened change log reader"
        );
        Ok(reader)
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Position of the last record handed out, if any.
    pub fn cursor(&self) -> Option<LogPosition> {
        self.cursor
    }

    /// Read the next batch.
    ///
    /// When a read drains the table, the batch position moves up to the log
    /// high-water mark the source reported, so idle tables keep advancing.
    /// An empty batch that moves the position forward is returned right away.
    /// At the log tail, a following reader waits `poll_interval` and returns
    /// an empty heartbeat batch; a non-following reader returns `None`.
    pub async fn next_batch(&mut self) -> Result<Option<ChangeBatch>, ReaderError> {
        let Some(cursor) = self.cursor else {
            return self.read_snapshot().await.map(Some);
        };

        let limit = self.read.batch_size;
        let page = self.fetch_after(cursor, limit).await?;
        let exhausted = page.records.len() < limit;
        let records = page.records;

        if records.is_empty() {
            if page.high_water > cursor {
                self.cursor = Some(page.high_water);
                tracing::trace!(
                    source_id = %self.source_id,
                    position = %page.high_water,
                    "No changes, advancing to log high water"
                );
                return Ok(Some(self.batch(records, page.high_water)));
            }
            if !self.read.follow {
                return Ok(None);
            }
            tokio::time::sleep(self.read.poll_interval).await;
            return Ok(Some(self.batch(records, cursor)));
        }

        let mut last = cursor;
        for record in &records {
            if record.log_position <= last {
                return Err(ReaderError::OutOfOrder {
                    source_id: self.source_id.clone(),
                    cursor: last,
                    got: record.log_position,
                });
            }
            last = record.log_position;
        }

        let position = if exhausted { page.high_water.max(last) } else { last };
        self.cursor = Some(position);
        tracing::debug!(
            source_id = %self.source_id,
            count = records.len(),
            position = %position,
            "Read change batch"
        );

        Ok(Some(self.batch(records, position)))
    }

    fn batch(&self, records: Vec<ChangeRecord>, position: LogPosition) -> ChangeBatch {
        ChangeBatch {
            source_id: self.source_id.clone(),
            records,
            position,
            snapshot: false,
        }
    }

    /// Consume the reader as a stream of batches. The stream ends at the log
    /// tail for non-following readers, and after the first error.
    pub fn into_stream(self) -> BoxStream<'static, Result<ChangeBatch, ReaderError>> {
        stream::unfold(Some(self), |reader| async move {
            let mut reader = reader?;
            match reader.next_batch().await {
                Ok(Some(batch)) => Some((Ok(batch), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }

    /// Read the table's current rows without moving the cursor.
    pub async fn fetch_snapshot(&self) -> Result<Snapshot, ReaderError> {
        let source = Arc::clone(&self.source);
        let table = self.table.clone();
        with_retry(&self.retry, &self.source_id, || {
            let source = Arc::clone(&source);
            let table = table.clone();
            async move { source.snapshot(&table).await }
        })
        .await
        .map_err(|e| self.classify(e))
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn read_snapshot(&mut self) -> Result<ChangeBatch, ReaderError> {
        let snapshot = self.fetch_snapshot().await?;

        let position = snapshot.position;
        let records: Vec<ChangeRecord> = snapshot
            .rows
            .into_iter()
            .map(|(key, row)| ChangeRecord {
                source_table: self.table.clone(),
                operation: Operation::Insert,
                key,
                before: None,
                after: Some(row),
                log_position: position,
                committed_at: None,
            })
            .collect();

        tracing::info!(
            source_id = %self.source_id,
            rows = records.len(),
            position = %position,
            "Read initial snapshot"
        );

        self.cursor = Some(position);
        Ok(ChangeBatch {
            source_id: self.source_id.clone(),
            records,
            position,
            snapshot: true,
        })
    }

    async fn fetch_after(&self, after: LogPosition, limit: usize) -> Result<ChangePage, ReaderError> {
        let source = Arc::clone(&self.source);
        let table = self.table.clone();
        with_retry(&self.retry, &self.source_id, || {
            let source = Arc::clone(&source);
            let table = table.clone();
            async move { source.changes_after(&table, after, limit).await }
        })
        .await
        .map_err(|e| self.classify(e))
    }

    fn classify(&self, err: RetryError<SourceError>) -> ReaderError {
        let source_id = self.source_id.clone();
        match err {
            RetryError::Exhausted { attempts, last } => ReaderError::SourceUnavailable {
                source_id,
                attempts,
                cause: last,
            },
            RetryError::Fatal(SourceError::Purged {
                requested,
                purged_through,
                ..
            }) => ReaderError::LogGap {
                source_id,
                requested,
                purged_through,
            },
            RetryError::Fatal(cause) => ReaderError::Source { source_id, cause },
        }
    }
}
