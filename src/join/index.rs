use crate::source::record::RowKey;
use std::collections::{HashMap, HashSet};

/// One-side key -> many-side keys whose foreign key currently points at it.
#[derive(Debug, Default)]
pub struct ForeignKeyIndex {
    by_target: HashMap<RowKey, HashSet<RowKey>>,
}

impl ForeignKeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&mut self, target: RowKey, many_key: RowKey) {
        self.by_target.entry(target).or_default().insert(many_key);
    }

    pub fn unlink(&mut self, target: &RowKey, many_key: &RowKey) {
        if let Some(keys) = self.by_target.get_mut(target) {
            keys.remove(many_key);
            if keys.is_empty() {
                self.by_target.remove(target);
            }
        }
    }

    /// Move `many_key` from `old` to `new`; either side may be absent.
    pub fn relink(&mut self, many_key: &RowKey, old: Option<&RowKey>, new: Option<&RowKey>) {
        if old == new {
            return;
        }
        if let Some(old) = old {
            self.unlink(old, many_key);
        }
        if let Some(new) = new {
            self.link(new.clone(), many_key.clone());
        }
    }

    /// Many-side keys referencing `target`, sorted for deterministic emission.
    pub fn referencing(&self, target: &RowKey) -> Vec<RowKey> {
        let mut keys: Vec<RowKey> = self
            .by_target
            .get(target)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn contains(&self, target: &RowKey, many_key: &RowKey) -> bool {
        self.by_target
            .get(target)
            .map_or(false, |keys| keys.contains(many_key))
    }

    /// Total number of links.
    pub fn len(&self) -> usize {
        self.by_target.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_target.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_target.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RowKey, &RowKey)> {
        self.by_target
            .iter()
            .flat_map(|(target, keys)| keys.iter().map(move |k| (target, k)))
    }
}
