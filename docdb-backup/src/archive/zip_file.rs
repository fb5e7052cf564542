use super::{blob_path, no_open_entry, ArchiveSink};
use crate::descriptor::BackupProperties;
use crate::manifest::PROPERTIES_FILE;
use crate::utils::errors::Result;
use ::zip::write::SimpleFileOptions;
use ::zip::{CompressionMethod, ZipWriter};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// How zip entries are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZipCompression {
    Stored,
    /// zstd with an optional level (library default when `None`)
    Zstd(Option<i32>),
}

impl ZipCompression {
    fn options(&self) -> SimpleFileOptions {
        match self {
            ZipCompression::Stored => {
                SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
            }
            ZipCompression::Zstd(level) => SimpleFileOptions::default()
                .compression_method(CompressionMethod::Zstd)
                .compression_level(level.map(i64::from)),
        }
    }
}

/// Writes a backup into a single zip file.
pub struct ZipSink {
    path: PathBuf,
    writer: ZipWriter<File>,
    options: SimpleFileOptions,
    /// Prefixes of the open collections, innermost last
    prefixes: Vec<String>,
    directories: HashSet<String>,
    entry_open: bool,
}

impl ZipSink {
    pub fn create(path: &Path, compression: ZipCompression) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        debug!("Writing backup archive {} ({:?})", path.display(), compression);
        Ok(Self {
            path: path.to_path_buf(),
            writer: ZipWriter::new(file),
            options: compression.options(),
            prefixes: Vec::new(),
            directories: HashSet::new(),
            entry_open: false,
        })
    }

    fn member_name(&self, name: &str) -> String {
        match self.prefixes.last() {
            Some(prefix) => format!("{}/{}", prefix, name),
            None => name.to_string(),
        }
    }

    fn start(&mut self, name: String) -> Result<()> {
        self.writer.start_file(name, self.options)?;
        self.entry_open = true;
        Ok(())
    }
}

impl ArchiveSink for ZipSink {
    fn new_collection(&mut self, name: &str) -> Result<()> {
        let prefix = self.member_name(name.trim_matches('/'));
        if self.directories.insert(prefix.clone()) {
            self.writer.add_directory(format!("{}/", prefix), self.options)?;
        }
        self.prefixes.push(prefix);
        Ok(())
    }

    fn close_collection(&mut self) -> Result<()> {
        self.prefixes.pop();
        Ok(())
    }

    fn new_entry(&mut self, name: &str) -> Result<()> {
        let name = self.member_name(name);
        self.start(name)
    }

    fn new_blob_entry(&mut self, id: &str) -> Result<()> {
        self.start(blob_path(id))
    }

    fn write_entry(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.entry_open {
            return Err(no_open_entry());
        }
        self.writer.write(buf)
    }

    fn close_entry(&mut self) -> Result<()> {
        self.entry_open = false;
        Ok(())
    }

    fn set_properties(&mut self, properties: &BackupProperties) -> Result<()> {
        let content = properties.to_toml()?;
        self.writer
            .start_file(PROPERTIES_FILE, SimpleFileOptions::default())?;
        self.writer.write_all(content.as_bytes())?;
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn finish(self: Box<Self>) -> Result<PathBuf> {
        let ZipSink { path, writer, .. } = *self;
        writer.finish()?;
        info!("Closed backup archive {}", path.display());
        Ok(path)
    }

    fn abort(self: Box<Self>) -> Result<()> {
        let ZipSink { path, writer, .. } = *self;
        drop(writer);
        fs::remove_file(&path)?;
        info!("Removed partial backup archive {}", path.display());
        Ok(())
    }
}
