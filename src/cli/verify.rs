use super::run::{assemble, Assembled};
use crate::config::parse::load_config;
use crate::config::types::{Config, JoinSide};
use crate::pipeline::PipelineState;
use crate::sink::{DocumentStore, SinkError};
use crate::source::{DuckDbSource, LogPosition, Row, SourceError, SourceWrite};
use rand::seq::IndexedRandom;
use rand::Rng;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const PRODUCTS: [&str; 5] = ["Monitor", "Keyboard", "Mouse", "Desk", "Chair"];

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("join sources '{many}' and '{one}' must share one database to insert transactionally")]
    SeparateDatabases { many: String, one: String },

    #[error("source '{0}' must have a single-column primary key")]
    CompositeKey(String),

    #[error("join.output has no column taken from the one side's 'name' column")]
    NoNameColumn,

    #[error("source write failed: {0}")]
    Source(#[from] SourceError),

    #[error("no document '{id}' with {field} = {value} after {waited:?}")]
    Timeout {
        id: String,
        field: String,
        value: String,
        waited: Duration,
    },

    #[error("pipeline stopped before the document arrived ({0:?})")]
    PipelineStopped(PipelineState),
}

/// The rows written by one verification round.
#[derive(Debug, Clone)]
pub struct Inserted {
    pub parent_id: i64,
    pub child_id: i64,
    pub name: String,
    pub product: String,
    pub amount: f64,
    pub position: LogPosition,
}

/// Inserts a parent row and a dependent row in one source transaction, then
/// polls the sink until the child's document carries the parent's name.
pub struct Verifier {
    source: Arc<DuckDbSource>,
    sink: Arc<dyn DocumentStore>,
    many_table: String,
    one_table: String,
    many_key: String,
    one_key: String,
    foreign_key: String,
    name_field: String,
    poll_interval: Duration,
}

fn single_key(source_id: &str, config: &Config) -> Result<String, VerifyError> {
    match config.sources.get(source_id).map(|s| s.primary_key.as_slice()) {
        Some([column]) => Ok(column.clone()),
        _ => Err(VerifyError::CompositeKey(source_id.to_string())),
    }
}

impl Verifier {
    pub fn new(
        config: &Config,
        sources: &std::collections::BTreeMap<String, Arc<DuckDbSource>>,
        sink: Arc<dyn DocumentStore>,
    ) -> Result<Self, VerifyError> {
        let join = &config.join;
        let separate = || VerifyError::SeparateDatabases {
            many: join.many.clone(),
            one: join.one.clone(),
        };

        let (many_source, one_source) = match (sources.get(&join.many), sources.get(&join.one)) {
            (Some(many), Some(one)) => (many, one),
            _ => return Err(separate()),
        };
        if !Arc::ptr_eq(many_source, one_source) {
            return Err(separate());
        }

        let foreign_key = match join.foreign_key.as_slice() {
            [column] => column.clone(),
            _ => return Err(VerifyError::CompositeKey(join.many.clone())),
        };

        let name_field = join
            .output
            .iter()
            .find(|c| c.from == JoinSide::One && c.column == "name")
            .map(|c| c.name.clone())
            .ok_or(VerifyError::NoNameColumn)?;

        let table = |id: &str| config.sources.get(id).map_or(id, |s| s.table_name(id)).to_string();

        Ok(Self {
            source: Arc::clone(many_source),
            sink,
            many_table: table(&join.many),
            one_table: table(&join.one),
            many_key: single_key(&join.many, config)?,
            one_key: single_key(&join.one, config)?,
            foreign_key,
            name_field,
            poll_interval: Duration::from_millis(250),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn name_field(&self) -> &str {
        &self.name_field
    }

    /// Insert one parent and one child row in a single transaction.
    pub async fn insert_pair(&self) -> Result<Inserted, VerifyError> {
        let (name, product, amount) = {
            let mut rng = rand::rng();
            let name = format!("User_{}", rng.random_range(100..=999));
            let product = PRODUCTS.choose(&mut rng).copied().unwrap_or(PRODUCTS[0]).to_string();
            let amount = (rng.random_range(20.0..500.0_f64) * 100.0).round() / 100.0;
            (name, product, amount)
        };
        let email = format!("{}@example.com", name.to_lowercase());

        let parent_id = self.source.next_id(&self.one_table, &self.one_key).await?;
        let child_id = self.source.next_id(&self.many_table, &self.many_key).await?;

        let mut parent = Row::new();
        parent.insert(self.one_key.clone(), json!(parent_id));
        parent.insert("name".to_string(), json!(name));
        parent.insert("email".to_string(), json!(email));

        let mut child = Row::new();
        child.insert(self.many_key.clone(), json!(child_id));
        child.insert(self.foreign_key.clone(), json!(parent_id));
        child.insert("product".to_string(), json!(product));
        child.insert("amount".to_string(), json!(amount));

        let position = self
            .source
            .write(vec![
                SourceWrite::Insert {
                    table: self.one_table.clone(),
                    row: parent,
                },
                SourceWrite::Insert {
                    table: self.many_table.clone(),
                    row: child,
                },
            ])
            .await?;

        info!(
            name = %name,
            email = %email,
            product = %product,
            amount,
            position = %position,
            "Inserted verification rows"
        );

        Ok(Inserted {
            parent_id,
            child_id,
            name,
            product,
            amount,
            position,
        })
    }

    /// Poll the sink until the document for `inserted`'s child row exists
    /// and carries the inserted name.
    pub async fn wait_for_document(&self, inserted: &Inserted, timeout: Duration) -> Result<Row, VerifyError> {
        let started = Instant::now();
        let id = inserted.child_id.to_string();
        let expected = Value::String(inserted.name.clone());

        loop {
            match self.sink.get(&id).await {
                Ok(Some(document)) if document.get(&self.name_field) == Some(&expected) => return Ok(document),
                Ok(Some(_)) => debug!(id = %id, "Document present without the inserted name yet"),
                Ok(None) => {}
                Err(SinkError::Unavailable(e)) => warn!(error = %e, "Sink not reachable yet"),
                Err(e) => warn!(error = %e, "Sink query failed"),
            }

            if started.elapsed() >= timeout {
                return Err(VerifyError::Timeout {
                    id,
                    field: self.name_field.clone(),
                    value: inserted.name.clone(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

pub async fn verify(config_path: Option<PathBuf>, timeout: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;
    let mut config = load_config(&path)?;

    // The readers must keep following the log to see the inserted rows.
    for source in config.sources.values_mut() {
        source.read.follow = true;
    }

    let Assembled {
        pipeline,
        sources,
        sink,
    } = assemble(config.clone())?;
    let verifier = Verifier::new(&config, &sources, sink)?;
    let handle = pipeline.handle();
    let task = tokio::spawn(pipeline.run());

    let outcome = match handle.wait_for(PipelineState::Running).await {
        PipelineState::Running => match verifier.insert_pair().await {
            Ok(inserted) => {
                println!(
                    "Inserted {} (id {}) who bought a {} for {:.2}",
                    inserted.name, inserted.parent_id, inserted.product, inserted.amount
                );
                println!("Waiting up to {:?} for the joined document...", timeout);
                verifier
                    .wait_for_document(&inserted, timeout)
                    .await
                    .map(|document| (inserted, document))
            }
            Err(e) => Err(e),
        },
        other => Err(VerifyError::PipelineStopped(other)),
    };

    handle.shutdown();
    let run_result = task.await?;

    match outcome {
        Ok((inserted, document)) => {
            println!(
                "✓ Verified: document for '{}' found in the sink: {}",
                inserted.name,
                Value::Object(document)
            );
            run_result?;
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Verification failed: {}", e);
            if let Err(failure) = run_result {
                eprintln!("  {}", failure);
            }
            std::process::exit(1);
        }
    }
}
