pub mod duckdb;
pub mod reader;
pub mod record;
pub mod traits;

pub use self::duckdb::{DuckDbSource, SourceWrite};
pub use reader::{ChangeLogReader, ReaderError};
pub use record::{ChangeBatch, ChangeRecord, LogPosition, Operation, Row, RowKey};
pub use traits::{ChangePage, ChangeSource, Snapshot, SourceError};

use crate::config::types::{Config, ConnectionConfig};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

/// Open the source collaborator for every configured source.
///
/// Sources sharing a database path share one connection, and each source's
/// table is registered with its primary key.
pub fn open_sources(config: &Config) -> Result<BTreeMap<String, Arc<DuckDbSource>>, SourceError> {
    let mut databases: HashMap<PathBuf, Arc<DuckDbSource>> = HashMap::new();
    let mut sources = BTreeMap::new();

    for (source_id, source_config) in &config.sources {
        let ConnectionConfig::Duckdb { path } = &source_config.connection;
        let database = match databases.get(path) {
            Some(db) => Arc::clone(db),
            None => {
                tracing::info!(source_id = %source_id, path = %path.display(), "Opening source database");
                let db = Arc::new(DuckDbSource::new(path)?);
                databases.insert(path.clone(), Arc::clone(&db));
                db
            }
        };
        database.register_table(source_config.table_name(source_id), &source_config.primary_key);
        sources.insert(source_id.clone(), database);
    }

    Ok(sources)
}
