//! Error types for the backup library.

use crate::storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed manifest {path}: {message}")]
    Manifest { path: String, message: String },

    #[error("Detected archive exit attack: {0}")]
    PathEscape(String),

    #[error("Required part of incremental backup not found: {0}")]
    MissingIncrement(String),

    #[error("Invalid backup properties: {0}")]
    Properties(String),

    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("Operation terminated")]
    Terminated,
}

impl BackupError {
    pub fn manifest(path: impl Into<String>, message: impl Into<String>) -> Self {
        BackupError::Manifest {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, BackupError::Terminated)
    }
}

impl From<quick_xml::events::attributes::AttrError> for BackupError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        BackupError::Xml(quick_xml::Error::from(err))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
