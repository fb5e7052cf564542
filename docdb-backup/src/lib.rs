//! docdb backup library
//!
//! Consistency checking, export and restore for the docdb hierarchical
//! document store. The storage engine is reached through the traits in
//! [`storage`]; [`storage::MemoryStore`] is the bundled reference engine.

pub mod archive;
pub mod consistency;
pub mod descriptor;
pub mod export;
pub mod manifest;
pub mod progress;
pub mod restore;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use consistency::{ConsistencyCheck, ErrorKind, ErrorReport};
pub use descriptor::{open_backup, BackupDescriptor, BackupDirectory, BackupProperties};
pub use export::{ExportOptions, SystemExport};
pub use progress::{LoggingProgress, ProgressCallback};
pub use restore::{LoggingRestoreListener, Restore, RestoreListener};
pub use storage::{Broker, BrokerMut, MemoryStore};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
