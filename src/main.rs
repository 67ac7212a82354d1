use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Change-data-capture join pipeline", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until Ctrl+C or until every source reaches the end of its log
    Run {
        /// Keep joined documents in memory instead of writing to the sink
        #[arg(long)]
        dry_run: bool,
    },
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Insert a test parent/child pair and wait for the joined document
    Verify {
        #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,
    },
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weft=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = weft::config::resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::Run { dry_run }) => {
            weft::cli::run::run(config_path, dry_run).await?;
        }
        None => {
            weft::cli::run::run(config_path, false).await?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => {
                weft::cli::config::init(stdout)?;
            }
            ConfigAction::Validate => {
                weft::cli::config::validate(config_path)?;
            }
        },
        Some(Commands::Verify { timeout }) => {
            weft::cli::verify::verify(config_path, timeout).await?;
        }
    }

    Ok(())
}
