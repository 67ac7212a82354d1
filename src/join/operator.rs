use super::index::ForeignKeyIndex;
use crate::config::types::{Config, JoinSide, OutputColumn};
use crate::source::record::{ChangeRecord, LogPosition, Operation, Row, RowKey};
use crate::source::traits::Snapshot;
use crate::state::{KeyedRow, KeyedStateStore, StateError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JoinError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("record for table '{0}' which is not part of the join")]
    UnexpectedTable(String),
}

/// Left-outer join of a many-side table against a one-side table.
#[derive(Debug, Clone)]
pub struct JoinSpec {
    pub many_table: String,
    pub one_table: String,
    pub foreign_key: Vec<String>,
    pub output: Vec<OutputColumn>,
}

impl JoinSpec {
    /// Resolve the join section against source table names.
    pub fn from_config(config: &Config) -> Self {
        let table = |source_id: &str| {
            config
                .sources
                .get(source_id)
                .map(|s| s.table_name(source_id).to_string())
                .unwrap_or_else(|| source_id.to_string())
        };
        Self {
            many_table: table(&config.join.many),
            one_table: table(&config.join.one),
            foreign_key: config.join.foreign_key.clone(),
            output: config.join.output.clone(),
        }
    }
}

/// The join result for one many-side row. `document: None` is a tombstone.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRow {
    pub key: RowKey,
    pub document: Option<Row>,
}

impl JoinedRow {
    pub fn tombstone(key: RowKey) -> Self {
        Self { key, document: None }
    }

    pub fn is_tombstone(&self) -> bool {
        self.document.is_none()
    }
}

/// Incremental left-outer join.
///
/// Every emission re-reads both sides from the state store, so the output
/// for a key depends only on current state, not on the order events arrived
/// across the two sources. A one-side delete is only reflected in joined
/// rows when a later event re-emits them.
pub struct JoinOperator {
    spec: JoinSpec,
    state: Arc<dyn KeyedStateStore>,
    index: ForeignKeyIndex,
    /// Per table, records at or before this position are already reflected
    /// in restored state; they re-emit without mutating it.
    horizons: HashMap<String, LogPosition>,
}

impl JoinOperator {
    pub fn new(spec: JoinSpec, state: Arc<dyn KeyedStateStore>) -> Self {
        Self {
            spec,
            state,
            index: ForeignKeyIndex::new(),
            horizons: HashMap::new(),
        }
    }

    pub fn spec(&self) -> &JoinSpec {
        &self.spec
    }

    pub fn state(&self) -> &Arc<dyn KeyedStateStore> {
        &self.state
    }

    /// Apply one change record and return the joined rows it produces.
    pub fn process(&mut self, record: &ChangeRecord) -> Result<Vec<JoinedRow>, JoinError> {
        if record.source_table == self.spec.many_table {
            self.process_many(record).map(|row| vec![row])
        } else if record.source_table == self.spec.one_table {
            self.process_one(record)
        } else {
            Err(JoinError::UnexpectedTable(record.source_table.clone()))
        }
    }

    fn process_many(&mut self, record: &ChangeRecord) -> Result<JoinedRow, JoinError> {
        let table = self.spec.many_table.clone();

        if !self.within_horizon(&table, record.log_position) {
            let applied = self.state.apply(&table, record)?;
            if !applied.stale {
                let old = applied.previous.as_deref().and_then(|r| self.foreign_key(r));
                let new = applied.current.as_deref().and_then(|r| self.foreign_key(r));
                self.index.relink(&record.key, old.as_ref(), new.as_ref());
            }
        }

        match self.state.lookup(&table, &record.key)? {
            Some(row) => self.join_row(&row),
            None => Ok(JoinedRow::tombstone(record.key.clone())),
        }
    }

    fn process_one(&mut self, record: &ChangeRecord) -> Result<Vec<JoinedRow>, JoinError> {
        let one_table = self.spec.one_table.clone();
        if !self.within_horizon(&one_table, record.log_position) {
            self.state.apply(&one_table, record)?;
        }

        // A one-side delete does not re-emit. Referencing rows keep their old
        // one-side attributes until their own next change.
        if record.operation == Operation::Delete {
            tracing::trace!(key = %record.key, "One-side delete applied without re-emission");
            return Ok(Vec::new());
        }

        let referencing = self.index.referencing(&record.key);
        let mut out = Vec::with_capacity(referencing.len());
        for many_key in referencing {
            let row = self
                .state
                .lookup(&self.spec.many_table, &many_key)?
                .ok_or_else(|| StateError::Corruption {
                    table: self.spec.many_table.clone(),
                    key: many_key.clone(),
                    detail: format!("indexed under {} but missing from state", record.key),
                })?;

            if self.foreign_key(&row).as_ref() != Some(&record.key) {
                return Err(StateError::Corruption {
                    table: self.spec.many_table.clone(),
                    key: many_key,
                    detail: format!("indexed under {} but row references another key", record.key),
                }
                .into());
            }

            out.push(self.join_row(&row)?);
        }

        tracing::trace!(
            key = %record.key,
            reemitted = out.len(),
            "Re-emitted joined rows for one-side change"
        );
        Ok(out)
    }

    /// Load a table's state from a snapshot without emitting anything.
    pub fn restore(&mut self, table: &str, snapshot: Snapshot) -> Result<(), JoinError> {
        if table != self.spec.many_table && table != self.spec.one_table {
            return Err(JoinError::UnexpectedTable(table.to_string()));
        }

        let position = snapshot.position;
        let rows = snapshot.rows.len();
        self.state.restore(table, snapshot.rows, position)?;

        if table == self.spec.many_table {
            self.index.clear();
            for row in self.state.scan(table)? {
                if let Some(target) = self.foreign_key(&row) {
                    self.index.link(target, row.key.clone());
                }
            }
        }

        self.horizons.insert(table.to_string(), position);
        tracing::info!(table, rows, %position, "Restored join state from snapshot");
        Ok(())
    }

    /// Verify the auxiliary index agrees with the many-side state.
    pub fn check_consistency(&self) -> Result<(), JoinError> {
        let many = &self.spec.many_table;
        let rows = self.state.scan(many)?;
        let mut expected_links = 0;

        for row in &rows {
            if let Some(target) = self.foreign_key(row) {
                expected_links += 1;
                if !self.index.contains(&target, &row.key) {
                    return Err(StateError::Corruption {
                        table: many.clone(),
                        key: row.key.clone(),
                        detail: format!("references {} but is missing from the index", target),
                    }
                    .into());
                }
            }
        }

        if expected_links != self.index.len() {
            let stray = self
                .index
                .iter()
                .find(|(target, key)| {
                    !rows
                        .iter()
                        .any(|r| &r.key == *key && self.foreign_key(r).as_ref() == Some(*target))
                })
                .map(|(_, key)| key.clone())
                .unwrap_or_else(|| RowKey::new(""));
            return Err(StateError::Corruption {
                table: many.clone(),
                key: stray,
                detail: format!(
                    "index holds {} links, state has {} referencing rows",
                    self.index.len(),
                    expected_links
                ),
            }
            .into());
        }
        Ok(())
    }

    fn within_horizon(&self, table: &str, position: LogPosition) -> bool {
        self.horizons.get(table).map_or(false, |h| position <= *h)
    }

    fn foreign_key(&self, row: &KeyedRow) -> Option<RowKey> {
        RowKey::from_columns(&row.attributes, &self.spec.foreign_key)
    }

    fn join_row(&self, many: &KeyedRow) -> Result<JoinedRow, JoinError> {
        let one = match self.foreign_key(many) {
            Some(target) => self.state.lookup(&self.spec.one_table, &target)?,
            None => None,
        };

        let mut document = Row::new();
        for column in &self.spec.output {
            let value = match column.from {
                JoinSide::Many => many.attributes.get(&column.column).cloned(),
                JoinSide::One => one.as_ref().and_then(|r| r.attributes.get(&column.column).cloned()),
            };
            document.insert(column.name.clone(), value.unwrap_or(Value::Null));
        }

        Ok(JoinedRow {
            key: many.key.clone(),
            document: Some(document),
        })
    }
}
