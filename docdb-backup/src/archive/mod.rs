//! Archive writers for backups.
//!
//! A backup is written through an [`ArchiveWriter`], either into a directory
//! tree or into a single zip file. Writing is scoped: a [`CollectionScope`]
//! mutably borrows the writer and an [`EntryWriter`] mutably borrows its
//! scope, so entries never nest and a collection cannot be closed while one
//! of its entries is still open. Scopes and entries dropped without an
//! explicit `close()` are closed on drop with errors ignored.

mod directory;
mod zip_file;

use crate::descriptor::BackupProperties;
use crate::manifest::{BLOB_DIRECTORY, CONTENTS_FILE};
use crate::utils::errors::Result;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub use directory::DirectorySink;
pub use zip_file::{ZipCompression, ZipSink};

/// Low-level archive backend. Callers go through [`ArchiveWriter`], which
/// enforces the nesting discipline.
pub trait ArchiveSink {
    /// Open a collection below the current one. `name` is an escaped path
    /// and may span several levels.
    fn new_collection(&mut self, name: &str) -> Result<()>;

    fn close_collection(&mut self) -> Result<()>;

    /// Start an entry in the current collection.
    fn new_entry(&mut self, name: &str) -> Result<()>;

    /// Start an entry in the blob store at the archive root.
    fn new_blob_entry(&mut self, id: &str) -> Result<()>;

    fn write_entry(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn close_entry(&mut self) -> Result<()>;

    /// Write the properties sidecar at the archive root.
    fn set_properties(&mut self, properties: &BackupProperties) -> Result<()>;

    /// Location of the archive on disk
    fn path(&self) -> &Path;

    fn finish(self: Box<Self>) -> Result<PathBuf>;

    /// Give up on a partially written archive.
    fn abort(self: Box<Self>) -> Result<()>;
}

pub struct ArchiveWriter {
    sink: Box<dyn ArchiveSink>,
}

impl ArchiveWriter {
    /// Write a backup as a directory tree rooted at `path`.
    pub fn directory(path: &Path) -> Result<Self> {
        Ok(Self {
            sink: Box::new(DirectorySink::create(path)?),
        })
    }

    /// Write a backup as a single zip file.
    pub fn zip(path: &Path, compression: ZipCompression) -> Result<Self> {
        Ok(Self {
            sink: Box::new(ZipSink::create(path, compression)?),
        })
    }

    pub fn path(&self) -> &Path {
        self.sink.path()
    }

    /// Open a collection scope. `name` is relative to the archive root.
    pub fn collection(&mut self, name: &str) -> Result<CollectionScope<'_>> {
        self.sink.new_collection(name)?;
        Ok(CollectionScope {
            sink: &mut *self.sink,
            closed: false,
        })
    }

    pub fn set_properties(&mut self, properties: &BackupProperties) -> Result<()> {
        self.sink.set_properties(properties)
    }

    pub fn finish(self) -> Result<PathBuf> {
        self.sink.finish()
    }

    /// Discard the archive. A zip file is deleted; a directory tree is left
    /// in place since whatever was written can still be restored from.
    pub fn abort(self) -> Result<()> {
        self.sink.abort()
    }
}

/// An open collection of an archive.
pub struct CollectionScope<'w> {
    sink: &'w mut dyn ArchiveSink,
    closed: bool,
}

impl<'w> CollectionScope<'w> {
    /// The manifest of this collection.
    pub fn contents(&mut self) -> Result<EntryWriter<'_>> {
        self.entry(CONTENTS_FILE)
    }

    pub fn entry(&mut self, name: &str) -> Result<EntryWriter<'_>> {
        self.sink.new_entry(name)?;
        Ok(EntryWriter {
            sink: &mut *self.sink,
            closed: false,
        })
    }

    pub fn blob_entry(&mut self, id: &str) -> Result<EntryWriter<'_>> {
        self.sink.new_blob_entry(id)?;
        Ok(EntryWriter {
            sink: &mut *self.sink,
            closed: false,
        })
    }

    pub fn sub_collection(&mut self, name: &str) -> Result<CollectionScope<'_>> {
        self.sink.new_collection(name)?;
        Ok(CollectionScope {
            sink: &mut *self.sink,
            closed: false,
        })
    }

    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.sink.close_collection()
    }
}

impl Drop for CollectionScope<'_> {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.sink.close_collection();
        }
    }
}

/// An open archive entry.
pub struct EntryWriter<'s> {
    sink: &'s mut dyn ArchiveSink,
    closed: bool,
}

impl EntryWriter<'_> {
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.sink.close_entry()
    }
}

impl Write for EntryWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.write_entry(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EntryWriter<'_> {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.sink.close_entry();
        }
    }
}

pub(crate) fn blob_path(id: &str) -> String {
    format!("{}/{}", BLOB_DIRECTORY, id)
}

fn no_open_entry() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "no archive entry is open")
}
