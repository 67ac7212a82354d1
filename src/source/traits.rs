use super::record::{ChangeRecord, LogPosition, Row, RowKey};
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The source cannot be reached right now; callers may retry.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The requested position is older than the retained change log.
    #[error("change log for '{table}' purged through {purged_through}, cannot resume after {requested}")]
    Purged {
        table: String,
        requested: LogPosition,
        purged_through: LogPosition,
    },

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("write rejected: {0}")]
    Write(String),

    #[error("corrupt change log entry at {position}: {detail}")]
    Corrupt { position: LogPosition, detail: String },

    /// A statement failed for a reason retrying will not fix.
    #[error("source query failed: {0}")]
    Query(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}

/// A consistent read of every current row in a table.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub rows: Vec<(RowKey, Row)>,
    /// Log high-water mark at the time of the read. Every change at or
    /// before this position is reflected in `rows`.
    pub position: LogPosition,
}

/// One read of a table's change log.
#[derive(Debug, Clone)]
pub struct ChangePage {
    pub records: Vec<ChangeRecord>,
    /// Log high-water mark observed by the same read. When fewer records
    /// than requested came back, the table has no changes after the last
    /// one up to this position.
    pub high_water: LogPosition,
}

/// A transactional store exposing a snapshot read and a resumable, ordered
/// change log keyed by position.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn snapshot(&self, table: &str) -> Result<Snapshot, SourceError>;

    /// Changes to `table` with position strictly greater than `after`, in
    /// position order, at most `limit` of them.
    async fn changes_after(
        &self,
        table: &str,
        after: LogPosition,
        limit: usize,
    ) -> Result<ChangePage, SourceError>;
}
