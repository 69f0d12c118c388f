use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use streamwarden::config::EngineConfig;
use streamwarden::RunOptions;

#[derive(Parser)]
#[command(
    name = "streamwarden",
    about = "Streaming anomaly detection over time-bucketed records",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process newline-delimited JSON records and write results to stdout
    Run {
        /// Configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Input file; reads stdin when absent or `-`
        #[arg(long)]
        input: Option<PathBuf>,

        /// SQLite database holding model snapshots
        #[arg(long)]
        state_db: Option<PathBuf>,

        /// Restore the newest snapshot before processing
        #[arg(long)]
        restore: bool,

        /// Check and count records without modelling them
        #[arg(long)]
        dry_run: bool,

        /// JSON log output for machine parsing
        #[arg(long)]
        json_logs: bool,
    },

    /// List stored snapshots
    Snapshots {
        /// Configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// SQLite database holding model snapshots
        #[arg(long)]
        state_db: Option<PathBuf>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Print the default configuration
    DefaultConfig,
}

/// Logs go to stderr; stdout carries results.
fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>, state_db: Option<PathBuf>) -> Result<EngineConfig> {
    let mut config = EngineConfig::load_or_default(path.map(PathBuf::as_path))?;
    if let Some(db) = state_db {
        config.persistence.state_db = db;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            input,
            state_db,
            restore,
            dry_run,
            json_logs,
        } => {
            let config = load_config(config.as_ref(), state_db)?;
            init_tracing(&config.logging.level, json_logs || config.logging.json);
            tracing::info!(
                detectors = config.detectors.len(),
                bucket_secs = config.bucket.length_secs,
                state_db = %config.persistence.state_db.display(),
                "Starting streamwarden job"
            );
            let stats = streamwarden::run(
                config,
                RunOptions {
                    input,
                    restore,
                    dry_run,
                },
            )
            .await?;
            tracing::info!(
                records = stats.records_handled,
                buckets = stats.buckets_finalised,
                "Job finished"
            );
        }
        Commands::Snapshots {
            config,
            state_db,
            json,
        } => {
            let config = load_config(config.as_ref(), state_db)?;
            init_tracing(&config.logging.level, config.logging.json);
            let snapshots = streamwarden::list_snapshots(&config)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshots)?);
            } else if snapshots.is_empty() {
                println!("No snapshots found.");
            } else {
                println!(
                    "{:<36} | {:<8} | {:<10} | {:<8} | Description",
                    "Id", "Reason", "Created", "Entities"
                );
                println!("{:-<36}-|-{:-<8}-|-{:-<10}-|-{:-<8}-|-{:-<30}", "", "", "", "", "");
                for s in snapshots {
                    println!(
                        "{:<36} | {:<8} | {:<10} | {:<8} | {}",
                        s.id, s.reason, s.created_at, s.entities, s.description
                    );
                }
            }
        }
        Commands::DefaultConfig => {
            print!("{}", EngineConfig::default().to_toml()?);
        }
    }

    Ok(())
}
