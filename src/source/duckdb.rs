use super::record::{ChangeRecord, LogPosition, Operation, Row, RowKey};
use super::traits::{ChangePage, ChangeSource, Snapshot, SourceError};
use crate::storage::duckdb::open_connection;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::{Connection, Transaction};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// One row-level write applied through [`DuckDbSource::write`].
#[derive(Debug, Clone)]
pub enum SourceWrite {
    Insert { table: String, row: Row },
    /// Replaces the stored row; `row` must carry the key columns.
    Update { table: String, row: Row },
    Delete { table: String, key: RowKey },
}

impl SourceWrite {
    fn table(&self) -> &str {
        match self {
            SourceWrite::Insert { table, .. }
            | SourceWrite::Update { table, .. }
            | SourceWrite::Delete { table, .. } => table,
        }
    }
}

/// Embedded transactional source backed by DuckDB.
///
/// Current rows live in `source_rows`; every committed write also appends to
/// `change_log` at a fresh position. Positions are global across tables and
/// never reused, even after the log is purged.
pub struct DuckDbSource {
    conn: Arc<Mutex<Connection>>,
    tables: RwLock<HashMap<String, Vec<String>>>,
}

impl From<duckdb::Error> for SourceError {
    fn from(e: duckdb::Error) -> Self {
        let message = e.to_string();
        if is_transient_failure(&message) {
            SourceError::Unavailable(message)
        } else {
            SourceError::Query(message)
        }
    }
}

/// I/O, lock contention and interrupts may clear up; parser, catalog,
/// constraint and conversion errors fail the same way every time.
fn is_transient_failure(message: &str) -> bool {
    ["IO Error", "Could not set lock", "Interrupt", "Connection Error"]
        .iter()
        .any(|marker| message.contains(marker))
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, SourceError> {
    conn.lock()
        .map_err(|_| SourceError::Unavailable("source connection mutex poisoned".to_string()))
}

fn join_error(e: tokio::task::JoinError) -> SourceError {
    SourceError::Unavailable(format!("Task join error: {}", e))
}

impl DuckDbSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| SourceError::Unavailable(e.to_string()))?;
        }
        let conn = open_connection(path.as_ref())
            .map_err(|e| SourceError::Unavailable(format!("opening {}: {}", path.as_ref().display(), e)))?;
        Self::with_connection(conn)
    }

    /// Create an in-memory source (for testing)
    pub fn in_memory() -> Result<Self, SourceError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, SourceError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS source_rows (
                table_name VARCHAR NOT NULL,
                row_key VARCHAR NOT NULL,
                row_data VARCHAR NOT NULL,
                PRIMARY KEY (table_name, row_key)
            );
            CREATE TABLE IF NOT EXISTS change_log (
                position BIGINT PRIMARY KEY,
                table_name VARCHAR NOT NULL,
                operation VARCHAR NOT NULL,
                row_key VARCHAR NOT NULL,
                before_image VARCHAR,
                after_image VARCHAR,
                committed_at BIGINT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_change_log_table ON change_log(table_name, position);
            CREATE TABLE IF NOT EXISTS log_state (
                id INTEGER PRIMARY KEY DEFAULT 1,
                last_position BIGINT NOT NULL,
                purged_through BIGINT NOT NULL,
                CHECK (id = 1)
            );
            INSERT INTO log_state (id, last_position, purged_through)
                VALUES (1, 0, 0) ON CONFLICT DO NOTHING;",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            tables: RwLock::new(HashMap::new()),
        })
    }

    /// Declare a table and its primary key columns so it can be written to.
    pub fn register_table(&self, table: &str, primary_key: &[String]) {
        if let Ok(mut tables) = self.tables.write() {
            tables.insert(table.to_string(), primary_key.to_vec());
        }
    }

    fn primary_key(&self, table: &str) -> Result<Vec<String>, SourceError> {
        self.tables
            .read()
            .ok()
            .and_then(|tables| tables.get(table).cloned())
            .ok_or_else(|| SourceError::UnknownTable(table.to_string()))
    }

    /// Apply `writes` in a single transaction. Returns the position of the
    /// last change-log entry written.
    pub async fn write(&self, writes: Vec<SourceWrite>) -> Result<LogPosition, SourceError> {
        let mut keyed = Vec::with_capacity(writes.len());
        for write in writes {
            let key_columns = self.primary_key(write.table())?;
            keyed.push((write, key_columns));
        }

        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn)?;
            let tx = conn.transaction()?;

            let (mut position, _) = read_log_state(&tx)?;
            let committed_at = Utc::now().timestamp_micros();

            for (write, key_columns) in keyed {
                position = position.next();
                apply_write(&tx, write, &key_columns, position, committed_at)?;
            }

            tx.execute(
                "UPDATE log_state SET last_position = ? WHERE id = 1",
                duckdb::params![position.0 as i64],
            )?;
            tx.commit()?;
            Ok(position)
        })
        .await
        .map_err(join_error)?
    }

    /// Drop retained change-log entries at or before `position`.
    pub async fn purge_through(&self, position: LogPosition) -> Result<(), SourceError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn)?;
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM change_log WHERE position <= ?",
                duckdb::params![position.0 as i64],
            )?;
            tx.execute(
                "UPDATE log_state SET purged_through = greatest(purged_through, ?) WHERE id = 1",
                duckdb::params![position.0 as i64],
            )?;
            tx.commit()?;
            tracing::info!(%position, "Purged change log");
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    /// Next free integer id for `column` in `table` (max + 1, or 1 if empty).
    pub async fn next_id(&self, table: &str, column: &str) -> Result<i64, SourceError> {
        let snapshot = self.snapshot(table).await?;
        let max = snapshot
            .rows
            .iter()
            .filter_map(|(_, row)| row.get(column).and_then(|v| v.as_i64()))
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    /// Current row for `key`, if any.
    pub async fn get_row(&self, table: &str, key: &RowKey) -> Result<Option<Row>, SourceError> {
        let conn = self.conn.clone();
        let table = table.to_string();
        let key = key.clone();
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            current_row(&conn, &table, &key)
        })
        .await
        .map_err(join_error)?
    }
}

fn read_log_state(conn: &Connection) -> Result<(LogPosition, LogPosition), SourceError> {
    let mut stmt = conn.prepare("SELECT last_position, purged_through FROM log_state WHERE id = 1")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => {
            let last: i64 = row.get(0)?;
            let purged: i64 = row.get(1)?;
            Ok((LogPosition(last.max(0) as u64), LogPosition(purged.max(0) as u64)))
        }
        None => Err(SourceError::Query("log_state row missing".to_string())),
    }
}

fn current_row(conn: &Connection, table: &str, key: &RowKey) -> Result<Option<Row>, SourceError> {
    let mut stmt = conn.prepare("SELECT row_data FROM source_rows WHERE table_name = ? AND row_key = ?")?;
    let mut rows = stmt.query(duckdb::params![table, key.as_str()])?;
    match rows.next()? {
        Some(row) => {
            let text: String = row.get(0)?;
            let parsed = serde_json::from_str(&text)
                .map_err(|e| SourceError::Write(format!("stored row {} is not valid JSON: {}", key, e)))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn encode_row(row: &Row) -> Result<String, SourceError> {
    serde_json::to_string(row).map_err(|e| SourceError::Write(e.to_string()))
}

fn apply_write(
    tx: &Transaction<'_>,
    write: SourceWrite,
    key_columns: &[String],
    position: LogPosition,
    committed_at: i64,
) -> Result<(), SourceError> {
    let (table, operation, key, before, after) = match write {
        SourceWrite::Insert { table, row } => {
            let key = RowKey::from_columns(&row, key_columns)
                .ok_or_else(|| SourceError::Write(format!("insert into {} is missing key columns {:?}", table, key_columns)))?;
            if current_row(tx, &table, &key)?.is_some() {
                return Err(SourceError::Write(format!("duplicate key {} in {}", key, table)));
            }
            tx.execute(
                "INSERT INTO source_rows (table_name, row_key, row_data) VALUES (?, ?, ?)",
                duckdb::params![table, key.as_str(), encode_row(&row)?],
            )?;
            (table, Operation::Insert, key, None, Some(row))
        }
        SourceWrite::Update { table, row } => {
            let key = RowKey::from_columns(&row, key_columns)
                .ok_or_else(|| SourceError::Write(format!("update of {} is missing key columns {:?}", table, key_columns)))?;
            let before = current_row(tx, &table, &key)?
                .ok_or_else(|| SourceError::Write(format!("update of missing key {} in {}", key, table)))?;
            tx.execute(
                "UPDATE source_rows SET row_data = ? WHERE table_name = ? AND row_key = ?",
                duckdb::params![encode_row(&row)?, table, key.as_str()],
            )?;
            (table, Operation::Update, key, Some(before), Some(row))
        }
        SourceWrite::Delete { table, key } => {
            let before = current_row(tx, &table, &key)?
                .ok_or_else(|| SourceError::Write(format!("delete of missing key {} in {}", key, table)))?;
            tx.execute(
                "DELETE FROM source_rows WHERE table_name = ? AND row_key = ?",
                duckdb::params![table, key.as_str()],
            )?;
            (table, Operation::Delete, key, Some(before), None)
        }
    };

    let before = before.as_ref().map(encode_row).transpose()?;
    let after = after.as_ref().map(encode_row).transpose()?;
    tx.execute(
        "INSERT INTO change_log (position, table_name, operation, row_key, before_image, after_image, committed_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        duckdb::params![
            position.0 as i64,
            table,
            operation.as_str(),
            key.as_str(),
            before,
            after,
            committed_at,
        ],
    )?;
    Ok(())
}

fn decode_image(position: LogPosition, text: Option<String>) -> Result<Option<Row>, SourceError> {
    text.map(|t| {
        serde_json::from_str(&t).map_err(|e| SourceError::Corrupt {
            position,
            detail: format!("row image is not valid JSON: {}", e),
        })
    })
    .transpose()
}

#[async_trait]
impl ChangeSource for DuckDbSource {
    async fn snapshot(&self, table: &str) -> Result<Snapshot, SourceError> {
        let conn = self.conn.clone();
        let table = table.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let (position, _) = read_log_state(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT row_key, row_data FROM source_rows WHERE table_name = ? ORDER BY row_key",
            )?;
            let rows = stmt.query_map(duckdb::params![table], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (key, data) = row?;
                let parsed: Row = serde_json::from_str(&data).map_err(|e| SourceError::Corrupt {
                    position,
                    detail: format!("snapshot row {} is not valid JSON: {}", key, e),
                })?;
                out.push((RowKey::new(key), parsed));
            }

            Ok(Snapshot { rows: out, position })
        })
        .await
        .map_err(join_error)?
    }

    async fn changes_after(
        &self,
        table: &str,
        after: LogPosition,
        limit: usize,
    ) -> Result<ChangePage, SourceError> {
        let conn = self.conn.clone();
        let table = table.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let (high_water, purged_through) = read_log_state(&conn)?;
            if after < purged_through {
                return Err(SourceError::Purged {
                    table,
                    requested: after,
                    purged_through,
                });
            }

            let mut stmt = conn.prepare(
                "SELECT position, operation, row_key, before_image, after_image, committed_at
                 FROM change_log
                 WHERE table_name = ? AND position > ?
                 ORDER BY position
                 LIMIT ?",
            )?;
            let rows = stmt.query_map(
                duckdb::params![table, after.0 as i64, limit as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )?;

            let mut records = Vec::new();
            for row in rows {
                let (position, operation, key, before, after_image, committed) = row?;
                let position = LogPosition(position.max(0) as u64);
                let operation = Operation::parse(&operation).ok_or_else(|| SourceError::Corrupt {
                    position,
                    detail: format!("unknown operation '{}'", operation),
                })?;
                records.push(ChangeRecord {
                    source_table: table.clone(),
                    operation,
                    key: RowKey::new(key),
                    before: decode_image(position, before)?,
                    after: decode_image(position, after_image)?,
                    log_position: position,
                    committed_at: DateTime::<Utc>::from_timestamp_micros(committed),
                });
            }
            Ok(ChangePage { records, high_water })
        })
        .await
        .map_err(join_error)?
    }
}
