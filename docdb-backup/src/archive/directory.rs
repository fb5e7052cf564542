use super::{blob_path, no_open_entry, ArchiveSink};
use crate::descriptor::BackupProperties;
use crate::manifest::PROPERTIES_FILE;
use crate::utils::errors::Result;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Writes a backup as a plain directory tree.
pub struct DirectorySink {
    root: PathBuf,
    collections: Vec<PathBuf>,
    entry: Option<BufWriter<File>>,
}

impl DirectorySink {
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        debug!("Writing backup directory {}", root.display());
        Ok(Self {
            root: root.to_path_buf(),
            collections: Vec::new(),
            entry: None,
        })
    }

    fn current(&self) -> &Path {
        self.collections.last().map(PathBuf::as_path).unwrap_or(&self.root)
    }

    fn open_entry(&mut self, path: PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.entry = Some(BufWriter::new(File::create(path)?));
        Ok(())
    }
}

impl ArchiveSink for DirectorySink {
    fn new_collection(&mut self, name: &str) -> Result<()> {
        let path = self.current().join(name);
        fs::create_dir_all(&path)?;
        self.collections.push(path);
        Ok(())
    }

    fn close_collection(&mut self) -> Result<()> {
        self.collections.pop();
        Ok(())
    }

    fn new_entry(&mut self, name: &str) -> Result<()> {
        let path = self.current().join(name);
        self.open_entry(path)
    }

    fn new_blob_entry(&mut self, id: &str) -> Result<()> {
        let path = self.root.join(blob_path(id));
        self.open_entry(path)
    }

    fn write_entry(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.entry.as_mut() {
            Some(entry) => entry.write(buf),
            None => Err(no_open_entry()),
        }
    }

    fn close_entry(&mut self) -> Result<()> {
        if let Some(mut entry) = self.entry.take() {
            entry.flush()?;
        }
        Ok(())
    }

    fn set_properties(&mut self, properties: &BackupProperties) -> Result<()> {
        fs::write(self.root.join(PROPERTIES_FILE), properties.to_toml()?)?;
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.root
    }

    fn finish(mut self: Box<Self>) -> Result<PathBuf> {
        self.close_entry()?;
        Ok(self.root)
    }

    fn abort(mut self: Box<Self>) -> Result<()> {
        self.close_entry()?;
        debug!("Leaving partial backup directory {}", self.root.display());
        Ok(())
    }
}
