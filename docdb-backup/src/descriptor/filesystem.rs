use super::{BackupDescriptor, BackupProperties};
use crate::manifest::{count_resources, BLOB_DIRECTORY, CONTENTS_FILE, PROPERTIES_FILE};
use crate::utils::errors::{BackupError, Result};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use tracing::warn;
use walkdir::WalkDir;

/// Descriptor of a collection in a directory backup.
#[derive(Debug)]
pub struct FileSystemBackupDescriptor {
    /// Backup root holding `backup.properties` and `blob/`
    root: PathBuf,
    /// Directory of this collection's manifest
    dir: PathBuf,
    resources: OnceLock<usize>,
}

impl FileSystemBackupDescriptor {
    pub fn new(root: &Path, dir: &Path) -> Result<Self> {
        let manifest = dir.join(CONTENTS_FILE);
        if !manifest.is_file() {
            return Err(BackupError::NotFound(manifest.display().to_string()));
        }
        Ok(Self {
            root: root.to_path_buf(),
            dir: dir.to_path_buf(),
            resources: OnceLock::new(),
        })
    }

    fn open_if_exists(path: &Path) -> Result<Option<Box<dyn Read>>> {
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(Box::new(BufReader::new(File::open(path)?))))
    }

    fn count_all(&self) -> usize {
        WalkDir::new(&self.dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() && entry.file_name() == CONTENTS_FILE)
            .map(|entry| {
                let path = entry.path();
                File::open(path)
                    .map_err(BackupError::from)
                    .and_then(|file| count_resources(BufReader::new(file), &path.display().to_string()))
                    .unwrap_or_else(|e| {
                        warn!("Failed to count resources in {}: {}", path.display(), e);
                        0
                    })
            })
            .sum()
    }
}

/// A member name must stay inside its directory.
fn check_member_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(BackupError::PathEscape(name.to_string())),
    }
}

impl BackupDescriptor for FileSystemBackupDescriptor {
    fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn symbolic_path(&self) -> String {
        self.dir.display().to_string()
    }

    fn child(&self, name: &str) -> Result<Option<Box<dyn BackupDescriptor>>> {
        check_member_name(name)?;
        let dir = self.dir.join(name);
        if !dir.join(CONTENTS_FILE).is_file() {
            return Ok(None);
        }
        Ok(Some(Box::new(FileSystemBackupDescriptor::new(&self.root, &dir)?)))
    }

    fn contents(&self) -> Result<Box<dyn Read>> {
        let file = File::open(self.dir.join(CONTENTS_FILE))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn member(&self, name: &str) -> Result<Option<Box<dyn Read>>> {
        check_member_name(name)?;
        Self::open_if_exists(&self.dir.join(name))
    }

    fn blob(&self, id: &str) -> Result<Option<Box<dyn Read>>> {
        check_member_name(id)?;
        Self::open_if_exists(&self.root.join(BLOB_DIRECTORY).join(id))
    }

    fn properties(&self) -> Result<Option<BackupProperties>> {
        let path = self.root.join(PROPERTIES_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        BackupProperties::parse(&fs::read_to_string(path)?).map(Some)
    }

    fn parent_location(&self) -> PathBuf {
        self.root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn number_of_resources(&self) -> usize {
        *self.resources.get_or_init(|| self.count_all())
    }
}
