//! progress-store: inspect and maintain a progress data directory
//!
//! Opens the filesystem adapters under the configured data directory and
//! runs one maintenance command against them.
//!
//! ## Configuration
//! - PROGRESS_STORE_CONFIG: YAML config file (default: progress-store.yaml)
//! - PROGRESS_STORE_DATA_DIR: data directory override
//! - PROGRESS_STORE_LOG: log filter (default: info)

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use progress_store::config::StoreConfig;
use progress_store::storage::init_storage;
use progress_store::utils::bootstrap::init_tracing;
use progress_store::{LocalTabChannel, ProgressSnapshot, ProgressStore, SaveOptions};

#[derive(Debug, Parser)]
#[command(name = "progress-store")]
#[command(about = "Inspect and maintain stored quiz progress")]
struct Args {
    /// Data directory, overriding config and environment.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the current snapshot as JSON.
    Show,
    /// Print storage usage and health as JSON.
    Quota,
    /// Prune historical snapshots older than the retention window.
    Cleanup {
        /// Retention in days (default: configured retention).
        days: Option<u32>,
    },
    /// Save a snapshot read from a JSON file, bypassing dedup.
    Import { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    let mut config = StoreConfig::load()?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    let (fast, durable) = init_storage(&config)?;
    let channel = Arc::new(LocalTabChannel::new(config.channel_capacity));
    let retention_days = config.retention_days;
    let store = ProgressStore::open(fast, durable, channel, config).await?;

    match args.command {
        Command::Show => {
            let snapshot = store.load().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Quota => {
            store.check_storage_quota().await?;
            let health = store.health().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Command::Cleanup { days } => {
            let removed = store.cleanup(days.unwrap_or(retention_days)).await?;
            println!("removed {} snapshot(s)", removed);
        }
        Command::Import { file } => {
            let bytes = tokio::fs::read(&file).await?;
            let value: serde_json::Value = serde_json::from_slice(&bytes)?;
            let snapshot: ProgressSnapshot = progress_store::migrate::Migrator::default()
                .migrate_value(value)?;
            let result = store
                .save(snapshot, SaveOptions::forced(format!("import {}", file.display())))
                .await;
            if let Some(e) = result.error {
                return Err(e.into());
            }
            info!(revision = ?result.revision, "Snapshot imported");
            println!("imported revision {}", result.revision.unwrap_or_default());
        }
    }

    store.close().await?;
    Ok(())
}
