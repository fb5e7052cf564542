//! docdb-backup - Main entry point
//!
//! Consistency checks, exports and restores of a docdb store snapshot.

mod commands;
mod config;
mod shutdown;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::Config;
use shutdown::ShutdownCoordinator;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Store snapshot (overrides config)
    #[arg(short, long, value_name = "FILE")]
    store: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the store for structural damage
    Check {
        /// Validate every node of every XML document
        #[arg(long)]
        deep: bool,

        /// Read documents straight from storage
        #[arg(long)]
        direct_access: bool,

        /// Write the error report as JSON
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
    },

    /// Write a backup of the store
    Export {
        /// Backup directory (overrides config)
        target: Option<PathBuf>,

        /// Only write what changed since the last backup
        #[arg(short, long)]
        incremental: bool,

        /// Write a directory tree instead of a zip file
        #[arg(long)]
        directory: bool,

        /// Store identical binary payloads once
        #[arg(long)]
        deduplicate_blobs: bool,

        /// Skip the consistency check before the export
        #[arg(long)]
        no_check: bool,
    },

    /// Restore a backup (and the increments it builds on) into the store
    Restore {
        /// Backup directory or zip file
        location: PathBuf,

        /// Account to authenticate as (overrides config)
        #[arg(short, long)]
        user: Option<String>,

        /// Password of that account (overrides config)
        #[arg(short, long)]
        password: Option<String>,

        /// Set a new admin password before restoring
        #[arg(long)]
        new_admin_password: Option<String>,

        /// Replace installed application packages even when newer
        #[arg(long)]
        overwrite_apps: bool,
    },

    /// List the backups in a directory
    List {
        /// Backup directory (overrides config)
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    if let Some(store) = args.store {
        config.store.snapshot = store;
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting docdb-backup v{}", env!("CARGO_PKG_VERSION"));

    let coordinator = Arc::new(ShutdownCoordinator::new());
    let cancel = coordinator.token();
    let signals = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.wait_for_signal().await })
    };

    let result = match args.command {
        Command::Check {
            deep,
            direct_access,
            report,
        } => {
            config.check.deep |= deep;
            config.check.direct_access |= direct_access;
            if report.is_some() {
                config.check.report = report;
            }
            tokio::task::spawn_blocking(move || commands::check(&config, cancel)).await?
        }
        Command::Export {
            target,
            incremental,
            directory,
            deduplicate_blobs,
            no_check,
        } => {
            let target = target.unwrap_or_else(|| config.export.directory.clone());
            let mut options = config.export.options.clone();
            options.incremental |= incremental;
            options.deduplicate_blobs |= deduplicate_blobs;
            if directory {
                options.zip = false;
            }
            if no_check {
                config.export.check_first = false;
            }
            tokio::task::spawn_blocking(move || {
                commands::export(&config, &target, &options, cancel).map(|_| ())
            })
            .await?
        }
        Command::Restore {
            location,
            user,
            password,
            new_admin_password,
            overwrite_apps,
        } => {
            let mut restore = config.restore.clone();
            if let Some(user) = user {
                restore.user = user;
            }
            if let Some(password) = password {
                restore.password = password;
            }
            restore.overwrite_apps |= overwrite_apps;
            tokio::task::spawn_blocking(move || {
                commands::restore(&config, &restore, &location, new_admin_password.as_deref(), cancel)
            })
            .await?
        }
        Command::List { dir } => {
            let dir = dir.unwrap_or_else(|| config.export.directory.clone());
            commands::list(&dir)
        }
    };

    signals.abort();
    if let Err(e) = &result {
        tracing::error!("{:#}", e);
    }
    result
}
