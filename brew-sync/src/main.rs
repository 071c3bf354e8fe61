//! Brew Sync - Command-line entry point
//!
//! Manual surface over the sync core: test a provider connection, push or
//! pull the data blob, list and restore server-side backups.

use anyhow::{bail, Context, Result};
use brew_sync::engine::SyncDirection;
use brew_sync::service::SyncService;
use brew_sync::utils;
use brew_sync::vault::{FileKv, FileVault};
use brew_sync::{Provider, SyncSettings};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the sync settings file
    #[arg(short, long, value_name = "FILE", default_value = "brew-sync.toml")]
    config: PathBuf,

    /// Path to the application data blob
    #[arg(short, long, value_name = "FILE", default_value = "brew-guide-data.json")]
    data: PathBuf,

    /// Directory for local sync state (device id, metadata copies)
    #[arg(short, long, value_name = "DIR", default_value = ".brew-sync")]
    state_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Direction {
    Upload,
    Download,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Test the configured provider's connection and mark it verified
    Test,
    /// Run one sync in an explicit direction
    Sync {
        #[arg(long, value_enum)]
        direction: Direction,
    },
    /// List server-side backups
    Backups,
    /// Replace the local dataset with a server-side backup
    Restore {
        /// Backup key, e.g. backups/backup-2026-08-27T10-00-00-000Z.json
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    utils::logger::init(&args.log_level)?;

    let settings = if args.config.exists() {
        SyncSettings::from_file(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        SyncSettings::default()
    };

    let vault = Arc::new(FileVault::new(args.data.clone()));
    let kv = Arc::new(FileKv::open(args.state_dir.join("state.json"))?);
    let service = SyncService::new(vault, kv);

    match args.command {
        Command::Test => {
            let provider = settings.active;
            if provider == Provider::None {
                bail!("no provider selected in {}", args.config.display());
            }
            let ok = service.test_connection(&settings, provider).await?;
            if !ok {
                bail!("connection test for {provider} failed");
            }
            println!("connection to {provider} ok");

            let mut settings = settings;
            match provider {
                Provider::S3 => {
                    if let Some(c) = settings.s3.as_mut() {
                        c.verified = true;
                    }
                }
                Provider::Webdav => {
                    if let Some(c) = settings.webdav.as_mut() {
                        c.verified = true;
                    }
                }
                Provider::Supabase => {
                    if let Some(c) = settings.supabase.as_mut() {
                        c.verified = true;
                    }
                }
                Provider::None => {}
            }
            settings.to_file(&args.config)?;
        }
        Command::Sync { direction } => {
            let direction = match direction {
                Direction::Upload => SyncDirection::Upload,
                Direction::Download => SyncDirection::Download,
            };
            let result = service.sync(&settings, direction).await;
            for line in &result.debug_logs {
                tracing::debug!("{}", line);
            }
            if !result.success {
                bail!("{}", result.message);
            }
            println!(
                "{} ({} uploaded, {} downloaded)",
                result.message, result.uploaded_files, result.downloaded_files
            );
        }
        Command::Backups => {
            let backups = service
                .list_backups(&settings)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            if backups.is_empty() {
                println!("no backups on server");
            }
            for entry in backups {
                println!("{}  {}", entry.timestamp.to_rfc3339(), entry.key);
            }
        }
        Command::Restore { key } => {
            if service.restore_from_backup(&settings, &key).await {
                println!("restored local dataset from {key}");
            } else {
                bail!("restoring {key} failed");
            }
        }
    }

    Ok(())
}
