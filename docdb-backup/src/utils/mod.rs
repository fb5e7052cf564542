//! Utility modules for the backup library.

pub mod encode;
pub mod errors;

pub use errors::{BackupError, Result};
