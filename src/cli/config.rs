use crate::config::generate::generate_starter_config;
use crate::config::types::SinkTarget;
use crate::config::user_config_path;
use std::fs;
use std::path::PathBuf;

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    write_config(&generate_starter_config(), stdout)
}

fn write_config(config_content: &str, stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    // Prefer ~/.config/weft/config.yml, fall back to /etc/weft/config.yml
    let config_path = match user_config_path() {
        Some(user_config) => match user_config.parent().map(fs::create_dir_all) {
            Some(Err(_)) => {
                eprintln!("Warning: Could not create directory for {}", user_config.display());
                eprintln!("Falling back to /etc/weft/config.yml");
                PathBuf::from("/etc/weft/config.yml")
            }
            _ => user_config,
        },
        None => PathBuf::from("/etc/weft/config.yml"),
    };

    if config_path.exists() {
        eprintln!(
            "Error: Config file already exists at {}",
            config_path.display()
        );
        eprintln!("Remove it first or use --stdout to print the config");
        std::process::exit(1);
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(&config_path, config_content)?;

    println!("Config file written to {}", config_path.display());
    Ok(())
}

pub fn validate(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;

    println!("Validating config file: {}", path.display());

    match crate::config::load_config(&path) {
        Ok(config) => {
            println!("✓ Config is valid");
            for (source_id, source) in &config.sources {
                println!(
                    "  source {}: table {}, key {:?}",
                    source_id,
                    source.table_name(source_id),
                    source.primary_key
                );
            }
            println!(
                "  join: {} -> {} on {:?}, {} output column(s)",
                config.join.many,
                config.join.one,
                config.join.foreign_key,
                config.join.output.len()
            );
            match &config.sink.target {
                SinkTarget::Elasticsearch { url, index, .. } => {
                    println!("  sink: elasticsearch {} index {}", url, index)
                }
                SinkTarget::Memory => println!("  sink: memory"),
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Config validation failed:\n{}", e);
            std::process::exit(1);
        }
    }
}
