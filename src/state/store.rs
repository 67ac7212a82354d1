use crate::source::record::{ChangeRecord, LogPosition, Operation, Row, RowKey};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("unknown table '{0}' in state store")]
    UnknownTable(String),

    #[error("state corruption in '{table}' at key {key}: {detail}")]
    Corruption {
        table: String,
        key: RowKey,
        detail: String,
    },
}

/// Latest known version of one source row.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedRow {
    pub key: RowKey,
    pub attributes: Row,
    pub last_log_position: LogPosition,
}

/// Outcome of applying one change record.
#[derive(Debug, Clone, Default)]
pub struct Applied {
    pub previous: Option<Arc<KeyedRow>>,
    pub current: Option<Arc<KeyedRow>>,
    /// The record was older than the stored row and was ignored.
    pub stale: bool,
}

/// Latest row per primary key, per table.
///
/// Each key is mutated by a single logical writer. Rows are replaced as a
/// whole (`Arc` swap), so a concurrent `lookup` sees either the old or the
/// new row, never a mix.
pub trait KeyedStateStore: Send + Sync {
    /// Insert creates, Update replaces (or creates), Delete removes.
    fn apply(&self, table: &str, record: &ChangeRecord) -> Result<Applied, StateError>;

    fn lookup(&self, table: &str, key: &RowKey) -> Result<Option<Arc<KeyedRow>>, StateError>;

    /// Replace a table's contents wholesale, e.g. from a source snapshot.
    fn restore(
        &self,
        table: &str,
        rows: Vec<(RowKey, Row)>,
        position: LogPosition,
    ) -> Result<(), StateError>;

    /// All rows of a table, in no particular order.
    fn scan(&self, table: &str) -> Result<Vec<Arc<KeyedRow>>, StateError>;

    fn len(&self, table: &str) -> Result<usize, StateError>;
}

type Partition = RwLock<HashMap<RowKey, Arc<KeyedRow>>>;

/// In-memory store, hash-partitioned per table.
pub struct MemoryStateStore {
    tables: HashMap<String, Vec<Partition>>,
}

impl MemoryStateStore {
    pub fn new<I, S>(tables: I, partitions: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let partitions = partitions.max(1);
        let tables = tables
            .into_iter()
            .map(|name| {
                let parts = (0..partitions).map(|_| RwLock::new(HashMap::new())).collect();
                (name.into(), parts)
            })
            .collect();
        Self { tables }
    }

    fn partitions(&self, table: &str) -> Result<&[Partition], StateError> {
        self.tables
            .get(table)
            .map(Vec::as_slice)
            .ok_or_else(|| StateError::UnknownTable(table.to_string()))
    }

    fn partition<'a>(&'a self, table: &str, key: &RowKey) -> Result<&'a Partition, StateError> {
        let parts = self.partitions(table)?;
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        Ok(&parts[(hasher.finish() as usize) % parts.len()])
    }
}

fn poisoned(table: &str, key: &RowKey) -> StateError {
    StateError::Corruption {
        table: table.to_string(),
        key: key.clone(),
        detail: "partition lock poisoned".to_string(),
    }
}

impl KeyedStateStore for MemoryStateStore {
    fn apply(&self, table: &str, record: &ChangeRecord) -> Result<Applied, StateError> {
        let partition = self.partition(table, &record.key)?;
        let mut rows = partition.write().map_err(|_| poisoned(table, &record.key))?;
        let previous = rows.get(&record.key).cloned();

        if let Some(existing) = &previous {
            if record.log_position < existing.last_log_position {
                tracing::debug!(
                    table,
                    key = %record.key,
                    position = %record.log_position,
                    stored = %existing.last_log_position,
                    "Ignoring stale change record"
                );
                return Ok(Applied {
                    current: previous.clone(),
                    previous,
                    stale: true,
                });
            }
        }

        let current = match (record.operation, &record.after) {
            (Operation::Delete, _) => {
                rows.remove(&record.key);
                None
            }
            (Operation::Insert | Operation::Update, Some(after)) => {
                let row = Arc::new(KeyedRow {
                    key: record.key.clone(),
                    attributes: after.clone(),
                    last_log_position: record.log_position,
                });
                rows.insert(record.key.clone(), Arc::clone(&row));
                Some(row)
            }
            (op, None) => {
                return Err(StateError::Corruption {
                    table: table.to_string(),
                    key: record.key.clone(),
                    detail: format!("{} record without an after image", op),
                });
            }
        };

        Ok(Applied {
            previous,
            current,
            stale: false,
        })
    }

    fn lookup(&self, table: &str, key: &RowKey) -> Result<Option<Arc<KeyedRow>>, StateError> {
        let partition = self.partition(table, key)?;
        let rows = partition.read().map_err(|_| poisoned(table, key))?;
        Ok(rows.get(key).cloned())
    }

    fn restore(
        &self,
        table: &str,
        rows: Vec<(RowKey, Row)>,
        position: LogPosition,
    ) -> Result<(), StateError> {
        for partition in self.partitions(table)? {
            partition
                .write()
                .map_err(|_| poisoned(table, &RowKey::new("")))?
                .clear();
        }

        for (key, attributes) in rows {
            let partition = self.partition(table, &key)?;
            let row = Arc::new(KeyedRow {
                key: key.clone(),
                attributes,
                last_log_position: position,
            });
            partition.write().map_err(|_| poisoned(table, &key))?.insert(key, row);
        }
        Ok(())
    }

    fn scan(&self, table: &str) -> Result<Vec<Arc<KeyedRow>>, StateError> {
        let mut out = Vec::new();
        for partition in self.partitions(table)? {
            let rows = partition.read().map_err(|_| poisoned(table, &RowKey::new("")))?;
            out.extend(rows.values().cloned());
        }
        Ok(out)
    }

    fn len(&self, table: &str) -> Result<usize, StateError> {
        let mut total = 0;
        for partition in self.partitions(table)? {
            total += partition
                .read()
                .map_err(|_| poisoned(table, &RowKey::new("")))?
                .len();
        }
        Ok(total)
    }
}
