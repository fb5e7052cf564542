use super::{BackupDescriptor, BackupProperties};
use crate::manifest::{count_resources, BLOB_DIRECTORY, CONTENTS_FILE, PROPERTIES_FILE};
use crate::utils::errors::{BackupError, Result};
use ::zip::result::ZipError;
use ::zip::ZipArchive;
use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, warn};

/// An open archive shared by all descriptors derived from it.
#[derive(Clone)]
struct SharedArchive {
    path: PathBuf,
    archive: Arc<Mutex<ZipArchive<File>>>,
    names: Arc<BTreeSet<String>>,
}

impl SharedArchive {
    /// Read a whole entry. `Ok(None)` if the archive has no such entry.
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let mut archive = self
            .archive
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entry = match archive.by_name(name) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        Ok(Some(data))
    }
}

/// Descriptor of a collection inside a zip backup.
pub struct ZipBackupDescriptor {
    shared: SharedArchive,
    /// Backup root inside the archive, empty when it is the archive root
    base: String,
    /// Directory of this collection's manifest inside the archive
    prefix: String,
    resources: OnceLock<usize>,
}

impl fmt::Debug for ZipBackupDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZipBackupDescriptor")
            .field("archive", &self.shared.path)
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// Resolve `.` and `..` segments of an archive path. Fails if the path is
/// absolute or climbs above the archive root.
fn normalize(path: &str) -> Result<String> {
    if path.starts_with('/') || path.contains('\\') || path.contains(':') {
        return Err(BackupError::PathEscape(path.to_string()));
    }
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(BackupError::PathEscape(path.to_string()));
                }
            }
            other => segments.push(other),
        }
    }
    Ok(segments.join("/"))
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Join `name` onto `dir` and make sure the result stays below `dir`.
fn resolve_within(dir: &str, name: &str) -> Result<String> {
    let resolved = normalize(&join(dir, name))?;
    let inside = if dir.is_empty() {
        !resolved.is_empty()
    } else {
        resolved.len() > dir.len() && resolved.starts_with(dir) && resolved.as_bytes()[dir.len()] == b'/'
    };
    if !inside {
        return Err(BackupError::PathEscape(join(dir, name)));
    }
    Ok(resolved)
}

impl ZipBackupDescriptor {
    /// Open a zip backup. The top-most manifest in the archive becomes the
    /// descriptor's collection.
    pub fn open(path: &Path) -> Result<Self> {
        let archive = ZipArchive::new(File::open(path)?)?;
        let names: BTreeSet<String> = archive.file_names().map(str::to_string).collect();

        let top = names
            .iter()
            .filter(|name| name.as_str() == CONTENTS_FILE || name.ends_with(&format!("/{}", CONTENTS_FILE)))
            .min_by_key(|name| (name.matches('/').count(), name.len()))
            .ok_or_else(|| {
                BackupError::NotFound(format!("{} contains no {}", path.display(), CONTENTS_FILE))
            })?;

        let raw_prefix = top
            .strip_suffix(CONTENTS_FILE)
            .unwrap_or_default()
            .trim_end_matches('/');
        let prefix = normalize(raw_prefix)?;
        let base = match prefix.rfind('/') {
            Some(pos) => prefix[..pos].to_string(),
            None => String::new(),
        };
        debug!(
            "Opened backup archive {} (collection prefix '{}')",
            path.display(),
            prefix
        );

        Ok(Self {
            shared: SharedArchive {
                path: path.to_path_buf(),
                archive: Arc::new(Mutex::new(archive)),
                names: Arc::new(names),
            },
            base,
            prefix,
            resources: OnceLock::new(),
        })
    }

    fn read_boxed(&self, name: &str) -> Result<Option<Box<dyn Read>>> {
        Ok(self
            .shared
            .read(name)?
            .map(|data| Box::new(Cursor::new(data)) as Box<dyn Read>))
    }

    fn count_all(&self) -> usize {
        let own = join(&self.prefix, CONTENTS_FILE);
        let nested_prefix = join(&self.prefix, "");
        let manifests: Vec<&String> = self
            .shared
            .names
            .iter()
            .filter(|name| {
                **name == own
                    || (name.starts_with(&nested_prefix) && name.ends_with(&format!("/{}", CONTENTS_FILE)))
            })
            .collect();

        manifests
            .into_iter()
            .map(|name| {
                self.shared
                    .read(name)
                    .and_then(|data| match data {
                        Some(data) => count_resources(Cursor::new(data), name),
                        None => Ok(0),
                    })
                    .unwrap_or_else(|e| {
                        warn!("Failed to count resources in {}: {}", name, e);
                        0
                    })
            })
            .sum()
    }
}

impl BackupDescriptor for ZipBackupDescriptor {
    fn name(&self) -> String {
        self.shared
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn symbolic_path(&self) -> String {
        join(&self.shared.path.display().to_string(), &self.prefix)
    }

    fn child(&self, name: &str) -> Result<Option<Box<dyn BackupDescriptor>>> {
        let prefix = resolve_within(&self.prefix, name)?;
        if !self.shared.names.contains(&join(&prefix, CONTENTS_FILE)) {
            return Ok(None);
        }
        Ok(Some(Box::new(ZipBackupDescriptor {
            shared: self.shared.clone(),
            base: self.base.clone(),
            prefix,
            resources: OnceLock::new(),
        })))
    }

    fn contents(&self) -> Result<Box<dyn Read>> {
        let name = join(&self.prefix, CONTENTS_FILE);
        self.read_boxed(&name)?
            .ok_or_else(|| BackupError::NotFound(format!("{}/{}", self.shared.path.display(), name)))
    }

    fn member(&self, name: &str) -> Result<Option<Box<dyn Read>>> {
        let name = resolve_within(&self.prefix, name)?;
        self.read_boxed(&name)
    }

    fn blob(&self, id: &str) -> Result<Option<Box<dyn Read>>> {
        let name = resolve_within(&join(&self.base, BLOB_DIRECTORY), id)?;
        self.read_boxed(&name)
    }

    fn properties(&self) -> Result<Option<BackupProperties>> {
        match self.shared.read(&join(&self.base, PROPERTIES_FILE))? {
            Some(data) => BackupProperties::parse(&String::from_utf8_lossy(&data)).map(Some),
            None => Ok(None),
        }
    }

    fn parent_location(&self) -> PathBuf {
        self.shared
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn number_of_resources(&self) -> usize {
        *self.resources.get_or_init(|| self.count_all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::zip::write::SimpleFileOptions;
    use ::zip::ZipWriter;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let mut writer = ZipWriter::new(File::create(path).unwrap());
        for (name, content) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("a/./b/../c").unwrap(), "a/c");
        assert_eq!(normalize("").unwrap(), "");
        assert!(matches!(normalize("../etc"), Err(BackupError::PathEscape(_))));
        assert!(matches!(normalize("a/../../etc"), Err(BackupError::PathEscape(_))));
        assert!(matches!(normalize("/etc"), Err(BackupError::PathEscape(_))));
        assert!(matches!(normalize("C:/windows"), Err(BackupError::PathEscape(_))));
    }

    #[test]
    fn test_rejects_manifest_outside_archive_root() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("evil.zip");
        write_zip(&path, &[("../../outside/__contents__.xml", "<collection/>")]);
        let err = ZipBackupDescriptor::open(&path).unwrap_err();
        assert!(matches!(err, BackupError::PathEscape(_)), "unexpected error: {}", err);
    }

    #[test]
    fn test_rejects_child_and_member_escapes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("backup.zip");
        write_zip(
            &path,
            &[
                ("backup/db/__contents__.xml", "<collection/>"),
                ("backup/secret", "x"),
                ("backup/blob/ab", "blob"),
            ],
        );
        let descriptor = ZipBackupDescriptor::open(&path).unwrap();
        assert_eq!(descriptor.prefix, "backup/db");
        assert_eq!(descriptor.base, "backup");

        assert!(matches!(descriptor.child(".."), Err(BackupError::PathEscape(_))));
        assert!(matches!(descriptor.member("../secret"), Err(BackupError::PathEscape(_))));
        assert!(matches!(descriptor.blob("../../secret"), Err(BackupError::PathEscape(_))));
        assert!(descriptor.blob("ab").unwrap().is_some());
    }

    #[test]
    fn test_archive_without_manifest_is_not_a_backup() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("other.zip");
        write_zip(&path, &[("readme.txt", "hello")]);
        assert!(matches!(
            ZipBackupDescriptor::open(&path),
            Err(BackupError::NotFound(_))
        ));
    }
}
