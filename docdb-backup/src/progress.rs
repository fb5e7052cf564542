//! Progress and status callbacks for long-running operations.
//!
//! Callbacks are invoked synchronously on the thread running the operation.

use tracing::{error, info};

/// Status callback for the consistency check and the exporter.
pub trait ProgressCallback {
    fn start_collection(&mut self, path: &str);

    /// `current` is 1-based; `count` is the total number of documents in
    /// the unit of work.
    fn start_document(&mut self, name: &str, current: usize, count: usize);

    fn error(&mut self, message: &str, cause: Option<&str>);
}

/// Logs every event through `tracing` and counts errors.
#[derive(Debug, Default)]
pub struct LoggingProgress {
    pub collections: usize,
    pub documents: usize,
    pub errors: usize,
}

impl LoggingProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressCallback for LoggingProgress {
    fn start_collection(&mut self, path: &str) {
        self.collections += 1;
        info!("Collection {}", path);
    }

    fn start_document(&mut self, name: &str, current: usize, count: usize) {
        self.documents += 1;
        tracing::debug!("Document {} ({}/{})", name, current, count);
    }

    fn error(&mut self, message: &str, cause: Option<&str>) {
        self.errors += 1;
        match cause {
            Some(cause) => error!("{}: {}", message, cause),
            None => error!("{}", message),
        }
    }
}
