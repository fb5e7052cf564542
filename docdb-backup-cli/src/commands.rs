//! The jobs behind each subcommand. They run on a blocking thread and
//! observe the shutdown token between items.

use crate::config::{CheckConfig, Config, RestoreConfig};
use crate::utils::format_duration;
use anyhow::{bail, Context, Result};
use docdb_backup::descriptor::BackupDirectory;
use docdb_backup::storage::Credentials;
use docdb_backup::{
    ConsistencyCheck, ErrorKind, ErrorReport, ExportOptions, LoggingProgress, LoggingRestoreListener, MemoryStore, Restore,
    SystemExport,
};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn load_store(snapshot: &Path) -> Result<MemoryStore> {
    MemoryStore::load(snapshot).with_context(|| format!("Failed to load store {}", snapshot.display()))
}

fn run_check(store: &MemoryStore, check: &CheckConfig, cancel: &CancellationToken) -> Result<Vec<ErrorReport>> {
    let mut progress = LoggingProgress::new();
    let errors = ConsistencyCheck::new(store, check.direct_access, check.deep)
        .with_cancel(cancel.clone())
        .check_all(&mut progress)?;

    if let Some(report) = &check.report {
        let json = serde_json::to_string_pretty(&errors)?;
        std::fs::write(report, json).with_context(|| format!("Failed to write report {}", report.display()))?;
        info!("Error report written to {}", report.display());
    }
    Ok(errors)
}

/// Number of reports per error kind, in the order kinds were first seen.
fn summarize(errors: &[ErrorReport]) -> Vec<(ErrorKind, usize)> {
    let mut counts: Vec<(ErrorKind, usize)> = Vec::new();
    for error in errors {
        match counts.iter_mut().find(|(kind, _)| *kind == error.kind()) {
            Some((_, count)) => *count += 1,
            None => counts.push((error.kind(), 1)),
        }
    }
    counts
}

/// Run a consistency check; fails when the store has errors.
pub fn check(config: &Config, cancel: CancellationToken) -> Result<()> {
    let start = Instant::now();
    let store = load_store(&config.store.snapshot)?;
    let errors = run_check(&store, &config.check, &cancel)?;

    for error in &errors {
        println!("{}", error);
    }
    for (kind, count) in summarize(&errors) {
        println!("{:>6} x {}: {}", count, kind, kind.description());
    }
    println!(
        "Checked {} collections and {} documents in {}",
        store.collection_paths().len(),
        store.document_total(),
        format_duration(start.elapsed())
    );
    if !errors.is_empty() {
        bail!("{} consistency error(s) found", errors.len());
    }
    println!("No errors.");
    Ok(())
}

/// Export the store into `target`, returning the new backup's path.
pub fn export(
    config: &Config,
    target: &Path,
    options: &ExportOptions,
    cancel: CancellationToken,
) -> Result<PathBuf> {
    let start = Instant::now();
    let store = load_store(&config.store.snapshot)?;

    let known_errors = if config.export.check_first {
        let errors = run_check(&store, &config.check, &cancel)?;
        if !errors.is_empty() {
            warn!("{} consistency error(s) found, damaged data will be left out", errors.len());
        }
        errors
    } else {
        Vec::new()
    };

    let mut progress = LoggingProgress::new();
    let path = SystemExport::new(&store, &mut progress)
        .with_cancel(cancel)
        .with_direct_access(config.check.direct_access)
        .export(target, options, &known_errors)?;

    println!(
        "Exported {} collections and {} documents to {} in {}",
        progress.collections,
        progress.documents,
        path.display(),
        format_duration(start.elapsed())
    );
    if progress.errors > 0 {
        println!("{} problem(s) reported during export, see log", progress.errors);
    }
    Ok(path)
}

/// Restore a backup into the store and save the snapshot.
pub fn restore(
    config: &Config,
    restore: &RestoreConfig,
    location: &Path,
    new_admin_password: Option<&str>,
    cancel: CancellationToken,
) -> Result<()> {
    let snapshot = &config.store.snapshot;
    let mut store = if snapshot.exists() {
        load_store(snapshot)?
    } else {
        info!("No store at {}, restoring into a new one", snapshot.display());
        MemoryStore::new()
    };

    let mut listener = LoggingRestoreListener::new();
    let credentials = Credentials::new(restore.user.as_str(), restore.password.as_str());
    let result = Restore::new(&mut store).with_cancel(cancel).restore(
        &credentials,
        new_admin_password,
        location,
        &mut listener,
        restore.overwrite_apps,
    );

    // a partial restore is still worth keeping
    if listener.restored > 0 || result.is_ok() {
        store
            .save(snapshot)
            .with_context(|| format!("Failed to save store {}", snapshot.display()))?;
    }
    result?;

    println!(
        "Restored {} of {} resources ({} skipped) in {}",
        listener.restored,
        listener.total,
        listener.skipped,
        listener.elapsed().map(format_duration).unwrap_or_default()
    );
    if listener.has_problems() {
        for warning in &listener.warnings {
            println!("warning: {}", warning);
        }
        for error in &listener.errors {
            println!("error: {}", error);
        }
        bail!(
            "Restore finished with {} warning(s) and {} error(s)",
            listener.warnings.len(),
            listener.errors.len()
        );
    }
    println!("Restore complete.");
    Ok(())
}

/// Print the backups found in `dir`, oldest first.
pub fn list(dir: &Path) -> Result<()> {
    let backups = BackupDirectory::new(dir).list()?;
    if backups.is_empty() {
        println!("No backups in {}", dir.display());
        return Ok(());
    }
    for backup in backups {
        let properties = backup.properties()?;
        let date = properties
            .as_ref()
            .map(|p| p.date.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let kind = match properties.as_ref().and_then(|p| p.previous()) {
            Some(previous) => format!("incremental on {}", previous),
            None => "full".to_string(),
        };
        println!(
            "{:<32} {:<20} {:>8} resources  {}",
            backup.name(),
            date,
            backup.number_of_resources(),
            kind
        );
    }
    Ok(())
}
