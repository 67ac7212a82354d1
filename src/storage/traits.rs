use crate::source::record::LogPosition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A committed offset as persisted for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedOffset {
    pub source_id: String,
    pub position: LogPosition,
    pub committed_at: DateTime<Utc>,
}

/// Durable store for per-source progress.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn init_schema(&self) -> Result<(), StorageError>;

    async fn load_offset(&self, source_id: &str) -> Result<Option<CommittedOffset>, StorageError>;

    async fn load_all_offsets(&self) -> Result<Vec<CommittedOffset>, StorageError>;

    /// Persist `position` for `source_id`. The stored value never moves
    /// backwards, even if a lower position is passed.
    async fn save_offset(&self, source_id: &str, position: LogPosition) -> Result<(), StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("invalid stored offset for '{source_id}': {value}")]
    InvalidOffset { source_id: String, value: i64 },
}

impl From<duckdb::Error> for StorageError {
    fn from(e: duckdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}
