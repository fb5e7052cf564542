//! Configuration for the docdb-backup command line tool.
//!
//! Loaded from a TOML file; every section and key is optional and falls
//! back to the defaults below. Command line flags override the file.

use docdb_backup::ExportOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub export: ExportConfig,
    pub check: CheckConfig,
    pub restore: RestoreConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON snapshot of the store
    #[serde(default = "default_snapshot")]
    pub snapshot: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExportConfig {
    /// Directory receiving the backups
    #[serde(default = "default_backup_dir")]
    pub directory: PathBuf,

    /// Run a consistency check first and leave out damaged documents
    #[serde(default = "default_true")]
    pub check_first: bool,

    #[serde(flatten)]
    pub options: ExportOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CheckConfig {
    /// Walk every node instead of only loading the document element
    pub deep: bool,

    /// Enumerate documents straight from storage, skipping XML validation
    pub direct_access: bool,

    /// Where to write the error report as JSON
    pub report: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RestoreConfig {
    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Replace installed application packages even when they are newer
    #[serde(default)]
    pub overwrite_apps: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_snapshot() -> PathBuf {
    PathBuf::from("docdb-store.json")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_true() -> bool {
    true
}

fn default_user() -> String {
    "admin".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot: default_snapshot(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            directory: default_backup_dir(),
            check_first: default_true(),
            options: ExportOptions::default(),
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            user: default_user(),
            password: String::new(),
            overwrite_apps: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
