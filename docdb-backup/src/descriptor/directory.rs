//! A directory holding a series of backups.
//!
//! Backups are named `full` or `inc` followed by a `YYYYMMDD-HHMM` stamp, an
//! optional `_N` suffix when the stamp is already taken, and `.zip` for zip
//! backups.

use super::{open_backup, BackupDescriptor};
use crate::utils::errors::Result;
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const FULL_PREFIX: &str = "full";
const INCREMENTAL_PREFIX: &str = "inc";
const ZIP_EXTENSION: &str = ".zip";

#[derive(Debug, Clone)]
pub struct BackupDirectory {
    dir: PathBuf,
}

/// Check a file name against the backup naming scheme.
fn is_backup_name(name: &str) -> bool {
    let name = name.strip_suffix(ZIP_EXTENSION).unwrap_or(name);
    let stamp = match name
        .strip_prefix(FULL_PREFIX)
        .or_else(|| name.strip_prefix(INCREMENTAL_PREFIX))
    {
        Some(stamp) => stamp,
        None => return false,
    };
    let (stamp, suffix) = match stamp.split_once('_') {
        Some((stamp, suffix)) => (stamp, Some(suffix)),
        None => (stamp, None),
    };
    let bytes = stamp.as_bytes();
    let stamp_ok = bytes.len() == 13
        && bytes[8] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 8 || b.is_ascii_digit());
    let suffix_ok = suffix.map_or(true, |s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()));
    stamp_ok && suffix_ok
}

impl BackupDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Pick a fresh path for a new backup stamped with the local time.
    pub fn create_backup_path(&self, incremental: bool, zip: bool) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let prefix = if incremental { INCREMENTAL_PREFIX } else { FULL_PREFIX };
        let stamp = format!("{}{}", prefix, Local::now().format("%Y%m%d-%H%M"));
        let extension = if zip { ZIP_EXTENSION } else { "" };

        let mut candidate = self.dir.join(format!("{}{}", stamp, extension));
        let mut counter = 1;
        while candidate.exists() {
            candidate = self.dir.join(format!("{}_{}{}", stamp, counter, extension));
            counter += 1;
        }
        debug!("New backup path: {}", candidate.display());
        Ok(candidate)
    }

    /// All readable backups, oldest first.
    pub fn list(&self) -> Result<Vec<Box<dyn BackupDescriptor>>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_backup_name(&name) {
                continue;
            }
            match open_backup(&entry.path()) {
                Ok(descriptor) => backups.push((name, descriptor)),
                Err(e) => warn!("Skipping unreadable backup {}: {}", entry.path().display(), e),
            }
        }
        // same-minute backups only differ by suffix, so the name breaks ties
        backups.sort_by(|(a_name, a), (b_name, b)| a.date().cmp(&b.date()).then_with(|| a_name.cmp(b_name)));
        Ok(backups.into_iter().map(|(_, descriptor)| descriptor).collect())
    }

    /// The most recent backup, if any.
    pub fn last_backup(&self) -> Result<Option<Box<dyn BackupDescriptor>>> {
        Ok(self.list()?.pop())
    }
}
