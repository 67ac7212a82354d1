use super::traits::{OffsetStore, StorageError};
use crate::source::record::LogPosition;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Committed offsets readable from outside the coordinator (status endpoint).
pub type SharedOffsets = Arc<RwLock<BTreeMap<String, LogPosition>>>;

/// Tracks the highest fully-processed position per source.
///
/// `commit` must only be called once every downstream effect of records up
/// to and including `position` is durable. Commits never move an offset
/// backwards; a lower position is ignored.
pub struct OffsetTracker {
    store: Arc<dyn OffsetStore>,
    committed: SharedOffsets,
}

impl OffsetTracker {
    pub fn new(store: Arc<dyn OffsetStore>) -> Self {
        Self {
            store,
            committed: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Last committed position for `source_id`, or `None` if the source has
    /// never committed (initial).
    pub async fn load(&self, source_id: &str) -> Result<Option<LogPosition>, StorageError> {
        let loaded = self.store.load_offset(source_id).await?;
        let position = loaded.map(|o| o.position);

        match position {
            Some(position) => {
                tracing::info!(source_id, %position, "Loaded committed offset");
                self.cache(source_id, position);
            }
            None => tracing::info!(source_id, "No committed offset, starting from snapshot"),
        }

        Ok(position)
    }

    /// Durably record `position` for `source_id`. Returns whether the
    /// committed offset advanced.
    pub async fn commit(&self, source_id: &str, position: LogPosition) -> Result<bool, StorageError> {
        if let Some(current) = self.get(source_id) {
            if position <= current {
                tracing::trace!(source_id, %position, %current, "Offset not advanced, skipping commit");
                return Ok(false);
            }
        }

        self.store.save_offset(source_id, position).await?;
        self.cache(source_id, position);
        tracing::debug!(source_id, %position, "Committed offset");
        Ok(true)
    }

    pub fn get(&self, source_id: &str) -> Option<LogPosition> {
        self.committed
            .read()
            .ok()
            .and_then(|guard| guard.get(source_id).copied())
    }

    /// Copy of all committed offsets.
    pub fn committed(&self) -> BTreeMap<String, LogPosition> {
        self.committed
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn shared(&self) -> SharedOffsets {
        Arc::clone(&self.committed)
    }

    fn cache(&self, source_id: &str, position: LogPosition) {
        if let Ok(mut guard) = self.committed.write() {
            guard.insert(source_id.to_string(), position);
        }
    }
}
