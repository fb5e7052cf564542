//! Read access to a written backup.
//!
//! A [`BackupDescriptor`] points at one collection manifest inside a backup,
//! which is either a directory tree or a zip file. Both variants navigate the
//! same way; descriptors are cheap to create and never mutate the backup.

mod directory;
mod filesystem;
mod properties;
mod zip_file;

use crate::manifest::{CONTENTS_FILE, PROPERTIES_FILE};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

pub use directory::BackupDirectory;
pub use filesystem::FileSystemBackupDescriptor;
pub use properties::BackupProperties;
pub use zip_file::ZipBackupDescriptor;

pub trait BackupDescriptor: fmt::Debug + Send {
    /// File name of the backup this descriptor belongs to.
    fn name(&self) -> String;

    /// Human readable location of this descriptor's collection, unique
    /// within a restore run.
    fn symbolic_path(&self) -> String;

    fn symbolic_member_path(&self, name: &str) -> String {
        format!("{}/{}", self.symbolic_path(), name)
    }

    /// Descriptor of a child collection by its escaped file name.
    /// `Ok(None)` if the child has no manifest.
    fn child(&self, name: &str) -> Result<Option<Box<dyn BackupDescriptor>>>;

    /// Descriptor of a collection several levels down, `a/b/c` style.
    fn descendant(&self, relative: &str) -> Result<Option<Box<dyn BackupDescriptor>>> {
        let mut segments = relative.split('/').filter(|s| !s.is_empty());
        let first = match segments.next() {
            Some(first) => first,
            None => return Ok(None),
        };
        let mut current = match self.child(first)? {
            Some(child) => child,
            None => return Ok(None),
        };
        for segment in segments {
            current = match current.child(segment)? {
                Some(child) => child,
                None => return Ok(None),
            };
        }
        Ok(Some(current))
    }

    /// The manifest of this collection.
    fn contents(&self) -> Result<Box<dyn Read>>;

    /// A file stored next to the manifest. `Ok(None)` if absent.
    fn member(&self, name: &str) -> Result<Option<Box<dyn Read>>>;

    /// A deduplicated binary payload. `Ok(None)` if absent.
    fn blob(&self, id: &str) -> Result<Option<Box<dyn Read>>>;

    /// The backup's properties sidecar. `Ok(None)` if the backup has none.
    fn properties(&self) -> Result<Option<BackupProperties>>;

    /// Directory holding the backup; previous increments are looked up here.
    fn parent_location(&self) -> PathBuf;

    /// Number of resources in this collection and everything below it.
    fn number_of_resources(&self) -> usize;

    fn date(&self) -> Option<DateTime<Utc>> {
        self.properties().ok().flatten().map(|p| p.date)
    }
}

/// Open the top-level descriptor of a backup.
///
/// `location` may be a zip file, a `__contents__.xml` file, or a backup
/// directory containing `db/__contents__.xml`.
pub fn open_backup(location: &Path) -> Result<Box<dyn BackupDescriptor>> {
    if location.is_dir() {
        let manifest_dir = location.join("db");
        if manifest_dir.join(CONTENTS_FILE).is_file() {
            return Ok(Box::new(FileSystemBackupDescriptor::new(location, &manifest_dir)?));
        }
        return Err(BackupError::NotFound(format!(
            "{} does not contain db/{}",
            location.display(),
            CONTENTS_FILE
        )));
    }

    if !location.is_file() {
        return Err(BackupError::NotFound(location.display().to_string()));
    }

    if location.file_name().and_then(|n| n.to_str()) == Some(CONTENTS_FILE) {
        let manifest_dir = location
            .parent()
            .ok_or_else(|| BackupError::NotFound(location.display().to_string()))?;
        let root = backup_root_of(manifest_dir);
        return Ok(Box::new(FileSystemBackupDescriptor::new(&root, manifest_dir)?));
    }

    Ok(Box::new(ZipBackupDescriptor::open(location)?))
}

/// Nearest ancestor of a manifest directory holding the properties file,
/// falling back to the manifest directory's parent.
fn backup_root_of(manifest_dir: &Path) -> PathBuf {
    manifest_dir
        .ancestors()
        .find(|dir| dir.join(PROPERTIES_FILE).is_file())
        .or_else(|| manifest_dir.parent())
        .unwrap_or(manifest_dir)
        .to_path_buf()
}
