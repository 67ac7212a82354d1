use crate::config::parse::{load_config, ConfigError};
use crate::config::types::{Config, SinkTarget};
use crate::pipeline::{Pipeline, PipelineFailure, PipelineReport};
use crate::sink::{create_document_store, DocumentStore, MemoryDocumentStore, SinkError};
use crate::source::{open_sources, ChangeSource, DuckDbSource, SourceError};
use crate::storage::duckdb::DuckDbStorage;
use crate::storage::traits::StorageError;
use crate::web::run_server;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Pipeline(#[from] PipelineFailure),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A pipeline wired to its collaborators, ready to run.
pub struct Assembled {
    pub pipeline: Pipeline,
    pub sources: BTreeMap<String, Arc<DuckDbSource>>,
    pub sink: Arc<dyn DocumentStore>,
}

/// Open sources, offset storage and the sink described by `config`.
pub fn assemble(config: Config) -> Result<Assembled, RunError> {
    let sink = create_document_store(&config.sink)?;
    assemble_with_sink(config, sink)
}

/// Like [`assemble`], writing to `sink` instead of the configured store.
pub fn assemble_with_sink(config: Config, sink: Arc<dyn DocumentStore>) -> Result<Assembled, RunError> {
    let sources = open_sources(&config)?;

    info!(path = %config.checkpoint.path.display(), "Opening offset storage");
    let offsets = Arc::new(DuckDbStorage::new(&config.checkpoint.path)?);

    let change_sources: BTreeMap<String, Arc<dyn ChangeSource>> = sources
        .iter()
        .map(|(id, source)| (id.clone(), Arc::clone(source) as Arc<dyn ChangeSource>))
        .collect();

    let pipeline = Pipeline::new(config, change_sources, offsets, Arc::clone(&sink));
    Ok(Assembled {
        pipeline,
        sources,
        sink,
    })
}

pub async fn run(config_path: Option<PathBuf>, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            eprintln!("  ~/.config/weft/config.yml");
            eprintln!("  /etc/weft/config.yml");
            eprintln!("\nUse --config <path> to specify a config file, or run 'weft config init' to generate one.");
            std::process::exit(1);
        }
    };

    let report = run_pipeline(&config_path, dry_run).await?;
    println!("Pipeline stopped, {} row(s) written", report.rows_written);
    for (source_id, position) in &report.committed {
        println!("  {}: committed through {}", source_id, position);
    }
    Ok(())
}

async fn run_pipeline(config_path: &Path, dry_run: bool) -> Result<PipelineReport, RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let mut config = load_config(config_path)?;

    let dry_run_store = dry_run.then(|| Arc::new(MemoryDocumentStore::new()));
    let web_config = config.web.clone();

    let Assembled { pipeline, .. } = match &dry_run_store {
        Some(store) => {
            info!("Dry run: joined documents are kept in memory");
            config.sink.target = SinkTarget::Memory;
            assemble_with_sink(config, Arc::clone(store) as Arc<dyn DocumentStore>)?
        }
        None => assemble(config)?,
    };
    let handle = pipeline.handle();

    let web_handle = web_config.map(|web| {
        let web_pipeline = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = run_server(web_pipeline, web).await {
                error!(error = %e, "Web server error");
            }
        })
    });

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_handle.shutdown();
        }
    });

    info!("Pipeline started, press Ctrl+C to drain and stop");
    let result = pipeline.run().await;

    if let Some(web_handle) = web_handle {
        web_handle.await?;
        info!("Web server stopped");
    }

    let report = result?;
    if let Some(store) = dry_run_store {
        let documents = store.documents();
        for (id, document) in &documents {
            debug!(id = %id, document = %serde_json::Value::Object(document.clone()), "Dry-run document");
        }
        info!(documents = documents.len(), "Dry run finished");
    }
    Ok(report)
}
