use super::traits::{DocumentStore, SinkError, SinkOp};
use crate::source::record::Row;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// Document store held in process memory.
///
/// Supports injecting transient failures (`fail_next`) and permanent
/// rejections (`reject_id`) for exercising the writer's failure paths.
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: RwLock<BTreeMap<String, Row>>,
    failures: AtomicUsize,
    rejected_ids: RwLock<HashSet<String>>,
    bulk_calls: AtomicUsize,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` bulk calls as unavailable.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Reject any upsert for `id`.
    pub fn reject_id(&self, id: &str) {
        if let Ok(mut ids) = self.rejected_ids.write() {
            ids.insert(id.to_string());
        }
    }

    pub fn documents(&self) -> BTreeMap<String, Row> {
        self.docs.read().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of bulk calls that reached the store, failed ones included.
    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }
}

fn poisoned() -> SinkError {
    SinkError::Unavailable("document map lock poisoned".to_string())
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn bulk(&self, ops: &[SinkOp]) -> Result<(), SinkError> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);

        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SinkError::Unavailable("injected failure".to_string()));
        }

        {
            let rejected = self.rejected_ids.read().map_err(|_| poisoned())?;
            if let Some(op) = ops
                .iter()
                .find(|op| matches!(op, SinkOp::Upsert { .. }) && rejected.contains(op.id()))
            {
                return Err(SinkError::Rejected {
                    id: op.id().to_string(),
                    reason: "mapper_parsing_exception".to_string(),
                });
            }
        }

        let mut docs = self.docs.write().map_err(|_| poisoned())?;
        for op in ops {
            match op {
                SinkOp::Upsert { id, document } => {
                    docs.insert(id.clone(), document.clone());
                }
                SinkOp::Delete { id } => {
                    docs.remove(id);
                }
            }
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Row>, SinkError> {
        let docs = self.docs.read().map_err(|_| poisoned())?;
        Ok(docs.get(id).cloned())
    }
}
