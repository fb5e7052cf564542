//! The `backup.properties` sidecar stored at the root of every backup.

use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackupProperties {
    /// File name of the previous backup in the chain, empty for a full backup
    #[serde(default)]
    pub previous: String,
    pub number_in_sequence: u32,
    #[serde(with = "yes_no")]
    pub incremental: bool,
    pub date: DateTime<Utc>,
}

impl BackupProperties {
    pub fn full(date: DateTime<Utc>) -> Self {
        Self {
            previous: String::new(),
            number_in_sequence: 1,
            incremental: false,
            date,
        }
    }

    pub fn incremental(previous: impl Into<String>, number_in_sequence: u32, date: DateTime<Utc>) -> Self {
        Self {
            previous: previous.into(),
            number_in_sequence,
            incremental: true,
            date,
        }
    }

    /// The previous backup this one depends on, if any.
    pub fn previous(&self) -> Option<&str> {
        if self.incremental && !self.previous.is_empty() {
            Some(&self.previous)
        } else {
            None
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| BackupError::Properties(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| BackupError::Properties(e.to_string()))
    }
}

mod yes_no {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(flag: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(crate::manifest::yes_no(*flag))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(crate::manifest::parse_flag(&raw))
    }
}
