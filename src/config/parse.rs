use super::types::*;
use crate::config::{env_var_pattern, expand_env_vars, expand_tilde};
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    use std::io::Read;

    let mut file = File::open(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut yaml_string = String::new();
    file.read_to_string(&mut yaml_string).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Parse and validate a config document.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;
    expand_paths(&mut config);
    validate_config(&config)?;
    Ok(config)
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let mut unexpanded_vars: Vec<String> = env_var_pattern()
        .captures_iter(yaml_string)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    let error_msg = if unexpanded_vars.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            unexpanded_vars[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables (e.g., export ES_URL=http://localhost:9200)\n\
             2. Replace the variables in the config file with actual values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

/// Expands tilde (~) in all PathBuf fields in the config.
fn expand_paths(config: &mut Config) {
    for source in config.sources.values_mut() {
        let ConnectionConfig::Duckdb { path } = &mut source.connection;
        *path = expand_tilde(path);
    }

    config.checkpoint.path = expand_tilde(&config.checkpoint.path);
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.sources.is_empty() {
        errors.push("config must define at least one source under 'sources'".to_string());
    }

    for (source_id, source) in &config.sources {
        validate_source(source_id, source, config, &mut errors);
    }

    validate_join(config, &mut errors);
    validate_sink(&config.sink, &mut errors);

    if config.state.partitions == 0 {
        errors.push("state.partitions must be at least 1".to_string());
    }

    if config.pipeline.channel_buffer == 0 {
        errors.push("pipeline.channel_buffer must be at least 1".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_source(source_id: &str, source: &SourceConfig, config: &Config, errors: &mut Vec<String>) {
    if source.primary_key.is_empty() {
        errors.push(format!("source '{}': primary_key must name at least one column", source_id));
    }

    let mut seen = HashSet::new();
    for column in &source.primary_key {
        if !seen.insert(column) {
            errors.push(format!("source '{}': duplicate primary key column '{}'", source_id, column));
        }
    }

    if source.read.batch_size == 0 {
        errors.push(format!("source '{}': read.batch_size must be at least 1", source_id));
    }

    validate_retry(&format!("source '{}'", source_id), &source.retry, errors);

    let ConnectionConfig::Duckdb { path } = &source.connection;
    if path == &config.checkpoint.path {
        errors.push(format!(
            "source '{}': connection path '{}' is also the checkpoint path",
            source_id,
            path.display()
        ));
    }

    if source_id != config.join.many && source_id != config.join.one {
        errors.push(format!(
            "source '{}' is not part of the join (expected '{}' or '{}')",
            source_id, config.join.many, config.join.one
        ));
    }
}

fn validate_join(config: &Config, errors: &mut Vec<String>) {
    let join = &config.join;

    if join.many == join.one {
        errors.push(format!("join.many and join.one must differ (both are '{}')", join.many));
    } else if let (Some(many), Some(one)) = (config.sources.get(&join.many), config.sources.get(&join.one)) {
        let table = many.table_name(&join.many);
        if table == one.table_name(&join.one) {
            errors.push(format!(
                "join.many ('{}') and join.one ('{}') read the same table '{}'",
                join.many, join.one, table
            ));
        }
    }

    for (side, source_id) in [("many", &join.many), ("one", &join.one)] {
        if !config.sources.contains_key(source_id) {
            errors.push(format!("join.{}: unknown source '{}'", side, source_id));
        }
    }

    if join.foreign_key.is_empty() {
        errors.push("join.foreign_key must name at least one column".to_string());
    } else if let Some(one) = config.sources.get(&join.one) {
        if one.primary_key.len() != join.foreign_key.len() {
            errors.push(format!(
                "join.foreign_key has {} column(s) but source '{}' has a {}-column primary key",
                join.foreign_key.len(),
                join.one,
                one.primary_key.len()
            ));
        }
    }

    if join.output.is_empty() {
        errors.push("join.output must map at least one column".to_string());
    }

    let mut names = HashSet::new();
    for (i, column) in join.output.iter().enumerate() {
        if column.name.is_empty() {
            errors.push(format!("join.output[{}]: name cannot be empty", i));
        } else if !names.insert(&column.name) {
            errors.push(format!("join.output[{}]: duplicate output column '{}'", i, column.name));
        }
        if column.column.is_empty() {
            errors.push(format!("join.output[{}]: column cannot be empty", i));
        }
    }
}

fn validate_sink(sink: &SinkConfig, errors: &mut Vec<String>) {
    if let SinkTarget::Elasticsearch { url, index, .. } = &sink.target {
        if url.is_empty() {
            errors.push("sink.url cannot be empty".to_string());
        } else if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(format!("sink.url '{}' must start with http:// or https://", url));
        }
        if index.is_empty() {
            errors.push("sink.index cannot be empty".to_string());
        }
    }

    if sink.batch_size == 0 {
        errors.push("sink.batch_size must be at least 1".to_string());
    }
    if sink.flush_interval.is_zero() {
        errors.push("sink.flush_interval must be greater than zero".to_string());
    }

    validate_retry("sink", &sink.retry, errors);
}

fn validate_retry(context: &str, retry: &RetryPolicy, errors: &mut Vec<String>) {
    if retry.max_attempts == 0 {
        errors.push(format!("{}: retry.max_attempts must be at least 1", context));
    }
    if retry.initial_backoff > retry.max_backoff {
        errors.push(format!(
            "{}: retry.initial_backoff ({:?}) exceeds retry.max_backoff ({:?})",
            context, retry.initial_backoff, retry.max_backoff
        ));
    }
    if retry.timeout.is_zero() {
        errors.push(format!("{}: retry.timeout must be greater than zero", context));
    }
}
