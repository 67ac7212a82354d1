use super::traits::{CommittedOffset, OffsetStore, StorageError};
use crate::source::record::LogPosition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Check if a process with the given PID is still running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use std::process::Command;
        Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        // Assume the holder is alive; never delete a live lock.
        let _ = pid;
        true
    }
}

/// Extract PID from DuckDB lock error message, e.g. "... (PID 12345) ..."
fn extract_pid_from_lock_error(error_msg: &str) -> Option<u32> {
    let start = error_msg.find("(PID ")? + 5;
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

fn remove_lock_files(db_path: &Path) -> std::io::Result<()> {
    for suffix in ["wal", "lock"] {
        let path = PathBuf::from(format!("{}.{}", db_path.display(), suffix));
        if path.exists() {
            std::fs::remove_file(&path)?;
            tracing::info!(path = %path.display(), "Removed stale DuckDB file");
        }
    }
    Ok(())
}

/// Open a DuckDB database file, clearing a stale lock left behind by a
/// process that no longer exists.
pub(crate) fn open_connection(path: &Path) -> Result<Connection, duckdb::Error> {
    let err = match Connection::open(path) {
        Ok(conn) => return Ok(conn),
        Err(e) => e,
    };

    let error_msg = err.to_string();
    if !error_msg.contains("Could not set lock") {
        return Err(err);
    }

    tracing::warn!(path = %path.display(), "Database lock detected: {}", error_msg);
    let Some(pid) = extract_pid_from_lock_error(&error_msg) else {
        return Err(err);
    };

    if is_process_running(pid) {
        tracing::error!(pid, "Lock holder is still running, cannot acquire lock");
        return Err(err);
    }

    tracing::warn!(pid, "Lock holder is gone, removing stale lock files");
    if let Err(io_err) = remove_lock_files(path) {
        tracing::error!(error = %io_err, "Failed to remove lock files");
        return Err(err);
    }

    Connection::open(path)
}

pub(crate) fn lock_connection(
    conn: &Mutex<Connection>,
) -> Result<MutexGuard<'_, Connection>, StorageError> {
    conn.lock()
        .map_err(|_| StorageError::Database("connection mutex poisoned".to_string()))
}

/// DuckDB implementation of the offset store
pub struct DuckDbStorage {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Database(format!("creating {}: {}", parent.display(), e)))?;
            }
        }
        let conn = open_connection(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory DuckDB storage instance (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn row_to_offset(source_id: String, position: i64, committed_micros: i64) -> Result<CommittedOffset, StorageError> {
    if position < 0 {
        return Err(StorageError::InvalidOffset {
            source_id,
            value: position,
        });
    }
    let committed_at = DateTime::<Utc>::from_timestamp_micros(committed_micros).ok_or_else(|| {
        StorageError::Database(format!("invalid commit timestamp {}", committed_micros))
    })?;
    Ok(CommittedOffset {
        source_id,
        position: LogPosition(position as u64),
        committed_at,
    })
}

#[async_trait]
impl OffsetStore for DuckDbStorage {
    async fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = lock_connection(&conn)?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS source_offsets (
                    source_id VARCHAR PRIMARY KEY,
                    position BIGINT NOT NULL,
                    committed_at BIGINT NOT NULL
                )",
                [],
            )?;
            Ok::<(), StorageError>(())
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }

    async fn load_offset(&self, source_id: &str) -> Result<Option<CommittedOffset>, StorageError> {
        let conn = self.conn.clone();
        let source_id = source_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = lock_connection(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT position, committed_at FROM source_offsets WHERE source_id = ?",
            )?;
            let mut rows = stmt.query(duckdb::params![source_id])?;

            if let Some(row) = rows.next()? {
                let position: i64 = row.get(0)?;
                let committed: i64 = row.get(1)?;
                Ok(Some(row_to_offset(source_id, position, committed)?))
            } else {
                Ok(None)
            }
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }

    async fn load_all_offsets(&self) -> Result<Vec<CommittedOffset>, StorageError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = lock_connection(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT source_id, position, committed_at FROM source_offsets ORDER BY source_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;

            let mut offsets = Vec::new();
            for row in rows {
                let (source_id, position, committed) = row?;
                offsets.push(row_to_offset(source_id, position, committed)?);
            }
            Ok(offsets)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }

    async fn save_offset(&self, source_id: &str, position: LogPosition) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        let source_id = source_id.to_string();
        let now = Utc::now().timestamp_micros();

        tokio::task::spawn_blocking(move || {
            let conn = lock_connection(&conn)?;
            conn.execute(
                "INSERT INTO source_offsets (source_id, position, committed_at)
                 VALUES (?, ?, ?)
                 ON CONFLICT (source_id) DO UPDATE SET
                    position = greatest(source_offsets.position, excluded.position),
                    committed_at = excluded.committed_at",
                duckdb::params![source_id, position.0 as i64, now],
            )?;
            Ok::<(), StorageError>(())
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }
}
