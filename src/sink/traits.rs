use crate::join::JoinedRow;
use crate::retry::Retryable;
use crate::source::record::Row;
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    /// Transport failure or overload; the write may be retried.
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    /// The store refused a document; retrying will not help.
    #[error("sink rejected document '{id}': {reason}")]
    Rejected { id: String, reason: String },
}

impl Retryable for SinkError {
    fn is_transient(&self) -> bool {
        matches!(self, SinkError::Unavailable(_))
    }

    fn timed_out(after: Duration) -> Self {
        SinkError::Unavailable(format!("no acknowledgement within {:?}", after))
    }
}

/// One keyed write against the document store.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkOp {
    Upsert { id: String, document: Row },
    Delete { id: String },
}

impl SinkOp {
    pub fn id(&self) -> &str {
        match self {
            SinkOp::Upsert { id, .. } | SinkOp::Delete { id } => id,
        }
    }
}

impl From<JoinedRow> for SinkOp {
    fn from(row: JoinedRow) -> Self {
        let id = row.key.as_str().to_string();
        match row.document {
            Some(document) => SinkOp::Upsert { id, document },
            None => SinkOp::Delete { id },
        }
    }
}

/// A document store addressed by document id. Upsert and delete by id are
/// idempotent, so a batch may be applied more than once.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Apply `ops` in order. Deleting a missing document succeeds.
    async fn bulk(&self, ops: &[SinkOp]) -> Result<(), SinkError>;

    async fn get(&self, id: &str) -> Result<Option<Row>, SinkError>;
}
