use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub sources: BTreeMap<String, SourceConfig>,
    pub join: JoinConfig,
    #[serde(default)]
    pub state: StateConfig,
    pub sink: SinkConfig,
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub web: Option<WebConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Table name in the source database. Defaults to the source id.
    #[serde(default)]
    pub table: Option<String>,
    pub primary_key: Vec<String>,
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub read: ReadConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl SourceConfig {
    pub fn table_name<'a>(&'a self, source_id: &'a str) -> &'a str {
        self.table.as_deref().unwrap_or(source_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    Duckdb { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadConfig {
    /// Keep polling the log tail after catching up.
    #[serde(default = "default_follow")]
    pub follow: bool,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_read_batch_size")]
    pub batch_size: usize,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            follow: default_follow(),
            poll_interval: default_poll_interval(),
            batch_size: default_read_batch_size(),
        }
    }
}

fn default_follow() -> bool {
    true
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_read_batch_size() -> usize {
    500
}

/// Bounded retry budget with exponential backoff. Each attempt is limited
/// by `timeout`; a timed-out attempt counts against the budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            timeout: default_timeout(),
        }
    }
}

fn default_max_attempts() -> usize {
    5
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinConfig {
    /// Source id of the "many" side (e.g. orders).
    pub many: String,
    /// Source id of the "one" side (e.g. customers).
    pub one: String,
    /// Columns on the many side referencing the one side's primary key.
    pub foreign_key: Vec<String>,
    pub output: Vec<OutputColumn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputColumn {
    pub name: String,
    pub from: JoinSide,
    pub column: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinSide {
    Many,
    One,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_partitions")]
    pub partitions: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
        }
    }
}

fn default_partitions() -> usize {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(flatten)]
    pub target: SinkTarget,
    #[serde(default = "default_sink_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_sink_batch_size() -> usize {
    500
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkTarget {
    Elasticsearch {
        url: String,
        index: String,
        /// Ask the store to make each bulk write visible to search before acknowledging.
        #[serde(default)]
        refresh: bool,
    },
    /// Keep documents in process memory (dry runs and tests).
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_buffer: default_channel_buffer(),
        }
    }
}

fn default_channel_buffer() -> usize {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub listen: String,
}
