//! Restore progress reporting.

use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Receives restore events. Called synchronously on the restoring thread.
pub trait RestoreListener {
    /// Restore is about to start; `total_resources` counts every resource
    /// of the backup chain.
    fn started(&mut self, total_resources: usize);

    fn processing_descriptor(&mut self, path: &str);

    fn created_collection(&mut self, path: &str);

    fn restored_resource(&mut self, name: &str);

    /// `count` resources were left out for `reason`.
    fn skip_resources(&mut self, reason: &str, count: usize);

    fn info(&mut self, message: &str);

    fn warn(&mut self, message: &str);

    fn error(&mut self, message: &str);

    fn finished(&mut self);
}

/// Logs restore events through `tracing` and keeps counts for a final
/// verdict.
#[derive(Debug, Default)]
pub struct LoggingRestoreListener {
    /// Resources in the backup chain
    pub total: usize,
    pub restored: usize,
    pub skipped: usize,
    pub collections: usize,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    start_time: Option<Instant>,
    elapsed: Option<Duration>,
}

impl LoggingRestoreListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share of the chain's resources already restored or skipped.
    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        ((self.restored + self.skipped) as f64 / self.total as f64 * 100.0).min(100.0)
    }

    /// Wall time of the restore, once finished.
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    pub fn has_problems(&self) -> bool {
        !self.warnings.is_empty() || !self.errors.is_empty()
    }
}

impl RestoreListener for LoggingRestoreListener {
    fn started(&mut self, total_resources: usize) {
        self.total = total_resources;
        self.start_time = Some(Instant::now());
        info!("Starting restore of {} resources", total_resources);
    }

    fn processing_descriptor(&mut self, path: &str) {
        info!("Processing backup descriptor {}", path);
    }

    fn created_collection(&mut self, path: &str) {
        self.collections += 1;
        debug!("Collection {}", path);
    }

    fn restored_resource(&mut self, name: &str) {
        self.restored += 1;
        debug!(
            "Restored {} ({}/{}, {:.1}%)",
            name,
            self.restored,
            self.total,
            self.percent_complete()
        );
    }

    fn skip_resources(&mut self, reason: &str, count: usize) {
        self.skipped += count;
        info!("{} ({} resources)", reason, count);
    }

    fn info(&mut self, message: &str) {
        info!("{}", message);
    }

    fn warn(&mut self, message: &str) {
        warn!("{}", message);
        self.warnings.push(message.to_string());
    }

    fn error(&mut self, message: &str) {
        error!("{}", message);
        self.errors.push(message.to_string());
    }

    fn finished(&mut self) {
        self.elapsed = self.start_time.map(|start| start.elapsed());
        info!(
            "Restore finished: {} resources restored, {} skipped, {} warnings, {} errors",
            self.restored,
            self.skipped,
            self.warnings.len(),
            self.errors.len()
        );
    }
}
