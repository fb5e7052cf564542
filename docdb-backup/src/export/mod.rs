//! Export of the whole store into a backup.
//!
//! The exporter works from the failsafe collection scan instead of walking
//! the hierarchy, so a collection whose ancestor is damaged is still written
//! at its absolute path. Every readable document the walk did not write,
//! whether its collection record is gone or its collection failed to
//! export, is swept into the lost-and-found collection.

mod serializer;

use crate::archive::{ArchiveWriter, CollectionScope, ZipCompression};
use crate::consistency::ErrorReport;
use crate::descriptor::{BackupDescriptor, BackupDirectory, BackupProperties};
use crate::manifest::{
    CollectionEntry, DeletedKind, ManifestEvent, ManifestReader, ManifestWriter, ResourceEntry,
    BLOB_STORE_VERSION, CONTENTS_FILE, FORMAT_VERSION,
};
use crate::progress::ProgressCallback;
use crate::storage::{
    is_within, Broker, CollectionId, CollectionRecord, DocumentId, DocumentRecord, Permission,
    ResourceKind, ADMIN_ACCOUNT, DBA_GROUP, LOST_AND_FOUND_COLLECTION, LOST_AND_FOUND_NAME,
    ROOT_COLLECTION, TEMP_COLLECTION,
};
use crate::utils::encode::{encode, resource_filename};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LOST_AND_FOUND_MODE: u32 = 0o771;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ExportOptions {
    /// Write an increment on top of the latest backup in the target
    pub incremental: bool,
    /// Increments in a chain before the next backup is a full one
    pub max_increments: u32,
    /// Write a single zip file instead of a directory tree
    pub zip: bool,
    /// Compress zip entries
    pub compress: bool,
    pub compression_level: Option<i32>,
    /// Store each distinct binary payload once under `blob/`
    pub deduplicate_blobs: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            incremental: false,
            max_increments: 5,
            zip: true,
            compress: true,
            compression_level: None,
            deduplicate_blobs: false,
        }
    }
}

impl ExportOptions {
    fn compression(&self) -> ZipCompression {
        if self.compress {
            ZipCompression::Zstd(self.compression_level)
        } else {
            ZipCompression::Stored
        }
    }
}

/// Exports the store into a backup directory.
pub struct SystemExport<'a> {
    broker: &'a dyn Broker,
    progress: &'a mut dyn ProgressCallback,
    cancel: CancellationToken,
    direct_access: bool,
}

/// What a finished export wrote.
#[derive(Debug, Default, Clone, Copy)]
struct ExportStats {
    collections: usize,
    documents: usize,
    skipped: usize,
    orphans: usize,
    blobs: usize,
}

/// Previous backup of an incremental chain.
struct Previous {
    descriptor: Box<dyn BackupDescriptor>,
    date: DateTime<Utc>,
}

impl<'a> SystemExport<'a> {
    pub fn new(broker: &'a dyn Broker, progress: &'a mut dyn ProgressCallback) -> Self {
        Self {
            broker,
            progress,
            cancel: CancellationToken::new(),
            direct_access: false,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Find orphaned documents by reading data pages instead of the index.
    pub fn with_direct_access(mut self, direct_access: bool) -> Self {
        self.direct_access = direct_access;
        self
    }

    /// Write a backup into `target` and return its path.
    ///
    /// `known_errors` is the result of a consistency check; documents and
    /// collections it reports as damaged are left out.
    pub fn export(
        &mut self,
        target: &Path,
        options: &ExportOptions,
        known_errors: &[ErrorReport],
    ) -> Result<PathBuf> {
        let backups = BackupDirectory::new(target);
        let (properties, previous) = self.plan(&backups, options)?;
        let path = backups.create_backup_path(properties.incremental, options.zip)?;
        info!(
            "Starting {} backup {} (sequence {})",
            if properties.incremental { "incremental" } else { "full" },
            path.display(),
            properties.number_in_sequence
        );

        let mut writer = if options.zip {
            ArchiveWriter::zip(&path, options.compression())?
        } else {
            ArchiveWriter::directory(&path)?
        };

        let mut run = ExportRun {
            broker: self.broker,
            progress: &mut *self.progress,
            cancel: &self.cancel,
            known_errors,
            previous: previous.as_ref(),
            deduplicate_blobs: options.deduplicate_blobs,
            blobs: HashSet::new(),
            exported: HashSet::new(),
            stats: ExportStats::default(),
        };
        let result = run
            .write_tree(&mut writer, self.direct_access)
            .and_then(|_| writer.set_properties(&properties));
        let stats = run.stats;

        match result {
            Ok(()) => {
                let path = writer.finish()?;
                info!(
                    "Backup {} written: {} collections, {} documents ({} unchanged, {} orphaned), {} blobs",
                    path.display(),
                    stats.collections,
                    stats.documents,
                    stats.skipped,
                    stats.orphans,
                    stats.blobs
                );
                Ok(path)
            }
            Err(e) if e.is_terminated() => {
                warn!("Export terminated, discarding {}", path.display());
                writer.abort()?;
                Err(e)
            }
            Err(e) => {
                // keep whatever was written; a partial backup can still be restored from
                if let Err(close_err) = writer.finish() {
                    warn!("Failed to close backup {}: {}", path.display(), close_err);
                }
                Err(e)
            }
        }
    }

    /// Decide between a full backup and the next increment.
    fn plan(
        &self,
        backups: &BackupDirectory,
        options: &ExportOptions,
    ) -> Result<(BackupProperties, Option<Previous>)> {
        let now = Utc::now();
        if !options.incremental {
            return Ok((BackupProperties::full(now), None));
        }
        let last = match backups.last_backup()? {
            Some(last) => last,
            None => {
                info!("No previous backup in {}, writing a full backup", backups.path().display());
                return Ok((BackupProperties::full(now), None));
            }
        };
        let last_properties = match last.properties()? {
            Some(properties) => properties,
            None => {
                warn!("Backup {} has no properties, writing a full backup", last.name());
                return Ok((BackupProperties::full(now), None));
            }
        };
        if last_properties.number_in_sequence >= options.max_increments {
            info!(
                "Backup chain reached {} increments, starting a new full backup",
                last_properties.number_in_sequence
            );
            return Ok((BackupProperties::full(now), None));
        }
        let properties = BackupProperties::incremental(
            last.name(),
            last_properties.number_in_sequence + 1,
            now,
        );
        let previous = Previous {
            date: last_properties.date,
            descriptor: last,
        };
        Ok((properties, Some(previous)))
    }
}

/// State of one export run.
struct ExportRun<'r> {
    broker: &'r dyn Broker,
    progress: &'r mut dyn ProgressCallback,
    cancel: &'r CancellationToken,
    known_errors: &'r [ErrorReport],
    previous: Option<&'r Previous>,
    deduplicate_blobs: bool,
    /// Blob ids already written to this archive
    blobs: HashSet<String>,
    /// Documents the walk has written or deliberately left out
    exported: HashSet<DocumentId>,
    stats: ExportStats,
}

/// Archive directory of a collection, relative to the archive root.
fn archive_path(collection: &str) -> String {
    collection
        .trim_start_matches('/')
        .split('/')
        .map(encode)
        .collect::<Vec<_>>()
        .join("/")
}

/// Hashes everything written to it.
struct HashingWriter(Sha256);

impl Write for HashingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'r> ExportRun<'r> {
    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(BackupError::Terminated);
        }
        Ok(())
    }

    fn version(&self) -> u32 {
        if self.deduplicate_blobs {
            BLOB_STORE_VERSION
        } else {
            FORMAT_VERSION
        }
    }

    fn is_damaged_document(&self, id: DocumentId) -> bool {
        self.known_errors.iter().any(|e| e.is_damaged_document(id))
    }

    fn is_damaged_collection(&self, path: &str) -> bool {
        self.known_errors.iter().any(|e| e.is_damaged_collection(path))
    }

    /// Export every collection, then sweep whatever the walk did not reach
    /// into lost+found. The root collection is written last so that its
    /// manifest can link a lost+found collection created by the sweep.
    fn write_tree(&mut self, writer: &mut ArchiveWriter, direct_access: bool) -> Result<()> {
        let mut collections = Vec::new();
        for scanned in self.broker.scan_collections() {
            match scanned {
                Ok(collection) => collections.push(collection),
                Err(corrupt) => self.progress.error(
                    &format!("Failed to read collection record {}", corrupt.path),
                    Some(&corrupt.message),
                ),
            }
        }
        debug!("{} collections to export", collections.len());

        let mut root = None;
        let mut lost_and_found = None;
        for collection in &collections {
            self.check_cancelled()?;
            if collection.path == ROOT_COLLECTION {
                root = Some(collection);
                continue;
            }
            if collection.path == LOST_AND_FOUND_COLLECTION {
                lost_and_found = Some(collection);
                continue;
            }
            if is_within(&collection.path, TEMP_COLLECTION) {
                continue;
            }
            let result = self.export_collection(writer, collection);
            self.record_collection(result, &collection.path)?;
        }

        match root {
            Some(root) => {
                let result = self.export_root(writer, root, &collections, lost_and_found, direct_access);
                self.record_collection(result, &root.path)
            }
            None => {
                // nothing to link it from, but the documents are still written
                let orphans = self.unexported_documents(&collections, lost_and_found, direct_access);
                let collection = match lost_and_found_record(lost_and_found, !orphans.is_empty()) {
                    Some(collection) => collection,
                    None => return Ok(()),
                };
                self.check_cancelled()?;
                let result = match writer.collection(&archive_path(&collection.path)) {
                    Ok(scope) => self.export_lost_and_found(scope, &collection, orphans),
                    Err(e) => Err(e),
                };
                self.record_collection(result, &collection.path)
            }
        }
    }

    /// Count a written collection or report why it failed. Only
    /// cancellation ends the export.
    fn record_collection(&mut self, result: Result<()>, path: &str) -> Result<()> {
        match result {
            Ok(()) => self.stats.collections += 1,
            Err(e) if e.is_terminated() => return Err(e),
            Err(e) => self
                .progress
                .error(&format!("Failed to export collection {}", path), Some(&e.to_string())),
        }
        Ok(())
    }

    /// Document records the walk did not write, skipping damaged documents,
    /// the temporary collection and the documents of a live lost+found.
    fn unexported_documents(
        &self,
        collections: &[CollectionRecord],
        lost_and_found: Option<&CollectionRecord>,
        direct_access: bool,
    ) -> Vec<DocumentRecord> {
        let temp_ids: HashSet<CollectionId> = collections
            .iter()
            .filter(|c| is_within(&c.path, TEMP_COLLECTION))
            .map(|c| c.id)
            .collect();
        let lost_and_found_id = lost_and_found.map(|c| c.id);
        let orphans: Vec<DocumentRecord> = self
            .broker
            .scan_documents(direct_access)
            .filter_map(|scanned| scanned.ok())
            .filter(|doc| {
                !self.exported.contains(&doc.id)
                    && !self.is_damaged_document(doc.id)
                    && !temp_ids.contains(&doc.collection_id)
                    && Some(doc.collection_id) != lost_and_found_id
            })
            .collect();
        debug!("{} documents left for lost+found", orphans.len());
        orphans
    }

    /// Write one collection: content entries first, then its manifest.
    fn export_collection(&mut self, writer: &mut ArchiveWriter, collection: &CollectionRecord) -> Result<()> {
        self.progress.start_collection(&collection.path);
        let mut scope = writer.collection(&archive_path(&collection.path))?;
        let mut manifest = self.start_manifest(collection)?;
        let documents = self.write_documents(&mut scope, &mut manifest, collection, Vec::new())?;
        self.finish_collection(scope, manifest, collection, documents.as_deref(), false)
    }

    /// Write the root collection. Lost+found is written inside its scope,
    /// after the root's own documents and before the root manifest.
    fn export_root(
        &mut self,
        writer: &mut ArchiveWriter,
        root: &CollectionRecord,
        collections: &[CollectionRecord],
        lost_and_found: Option<&CollectionRecord>,
        direct_access: bool,
    ) -> Result<()> {
        self.progress.start_collection(&root.path);
        let mut scope = writer.collection(&archive_path(&root.path))?;
        let mut manifest = self.start_manifest(root)?;
        let documents = self.write_documents(&mut scope, &mut manifest, root, Vec::new())?;

        let orphans = self.unexported_documents(collections, lost_and_found, direct_access);
        let mut link = false;
        if let Some(collection) = lost_and_found_record(lost_and_found, !orphans.is_empty()) {
            self.check_cancelled()?;
            let result = match scope.sub_collection(&encode(LOST_AND_FOUND_NAME)) {
                Ok(sub_scope) => self.export_lost_and_found(sub_scope, &collection, orphans),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    self.stats.collections += 1;
                    link = !root.children.iter().any(|c| c == LOST_AND_FOUND_NAME);
                }
                Err(e) if e.is_terminated() => return Err(e),
                Err(e) => self
                    .progress
                    .error("Failed to export orphaned documents", Some(&e.to_string())),
            }
        }
        self.finish_collection(scope, manifest, root, documents.as_deref(), link)
    }

    /// Write lost+found with the orphans added after its own documents.
    fn export_lost_and_found(
        &mut self,
        mut scope: CollectionScope<'_>,
        collection: &CollectionRecord,
        orphans: Vec<DocumentRecord>,
    ) -> Result<()> {
        self.progress.start_collection(&collection.path);
        let mut manifest = self.start_manifest(collection)?;
        let documents = self.write_documents(&mut scope, &mut manifest, collection, orphans)?;
        self.finish_collection(scope, manifest, collection, documents.as_deref(), false)
    }

    fn start_manifest(&self, collection: &CollectionRecord) -> Result<ManifestWriter<Vec<u8>>> {
        let mut manifest = ManifestWriter::new(Vec::new())?;
        manifest.start_collection(&CollectionEntry {
            name: collection.path.clone(),
            permission: collection.permission.clone(),
            created: collection.created,
            deduplicate_blobs: self.deduplicate_blobs,
            version: self.version(),
        })?;
        Ok(manifest)
    }

    /// Write the collection's own documents followed by `orphans`, renamed
    /// where their name is taken. Returns the collection's own documents,
    /// `None` if they could not be listed.
    fn write_documents(
        &mut self,
        scope: &mut CollectionScope<'_>,
        manifest: &mut ManifestWriter<Vec<u8>>,
        collection: &CollectionRecord,
        orphans: Vec<DocumentRecord>,
    ) -> Result<Option<Vec<DocumentRecord>>> {
        let listed = match self.broker.documents(collection) {
            Ok(documents) => Some(documents),
            Err(e) => {
                // the sweep picks these up through the document scan
                self.progress.error(
                    &format!("Failed to list documents of {}", collection.path),
                    Some(&e.to_string()),
                );
                None
            }
        };
        let documents = listed.as_deref().unwrap_or_default();

        let count = documents.len() + orphans.len();
        let mut taken: HashSet<String> = HashSet::new();
        for (index, doc) in documents.iter().enumerate() {
            self.check_cancelled()?;
            if self.is_damaged_document(doc.id) || doc.name == CONTENTS_FILE || doc.name == LOST_AND_FOUND_NAME {
                self.exported.insert(doc.id);
                continue;
            }
            taken.insert(doc.name.clone());
            self.progress.start_document(&doc.name, index + 1, count);
            let filename = resource_filename(&doc.name, index);
            self.export_document(scope, manifest, doc, &doc.name, &filename, true)?;
        }

        for (offset, doc) in orphans.iter().enumerate() {
            self.check_cancelled()?;
            let name = unique_name(&doc.name, &taken);
            taken.insert(name.clone());
            self.progress.error(&format!("Found an orphaned document: {}", doc.name), None);
            let index = documents.len() + offset;
            self.progress.start_document(&name, index + 1, count);
            let filename = resource_filename(&name, index);
            if self.export_document(scope, manifest, doc, &name, &filename, false)? {
                self.stats.orphans += 1;
            }
        }
        Ok(listed)
    }

    /// Add subcollection links and deleted markers, then write the manifest.
    fn finish_collection(
        &mut self,
        mut scope: CollectionScope<'_>,
        mut manifest: ManifestWriter<Vec<u8>>,
        collection: &CollectionRecord,
        documents: Option<&[DocumentRecord]>,
        link_lost_and_found: bool,
    ) -> Result<()> {
        for child in &collection.children {
            let child_path = collection.child_path(child);
            if is_within(&child_path, TEMP_COLLECTION) || self.is_damaged_collection(&child_path) {
                continue;
            }
            manifest.subcollection(child, &encode(child))?;
        }
        if link_lost_and_found {
            manifest.subcollection(LOST_AND_FOUND_NAME, &encode(LOST_AND_FOUND_NAME))?;
        }

        // without a listing every previous member would look deleted
        if let (Some(previous), Some(documents)) = (self.previous, documents) {
            if let Err(e) = self.write_deleted(previous, collection, documents, &mut manifest) {
                warn!("Could not compare {} with the previous backup: {}", collection.path, e);
            }
        }

        let bytes = manifest.finish()?;
        let mut contents = scope.contents()?;
        contents.write_all(&bytes)?;
        contents.close()?;
        scope.close()
    }

    /// Write a document's content and manifest entry under `name`.
    /// Returns `Ok(false)` if the content could not be read; the failure is
    /// reported and the document left out.
    fn export_document(
        &mut self,
        scope: &mut CollectionScope<'_>,
        manifest: &mut ManifestWriter<Vec<u8>>,
        doc: &DocumentRecord,
        name: &str,
        filename: &str,
        incremental_skip: bool,
    ) -> Result<bool> {
        self.exported.insert(doc.id);
        let skip = incremental_skip
            && self
                .previous
                .map_or(false, |p| doc.metadata.modified <= p.date);

        let mut blob_id = None;
        if skip {
            self.stats.skipped += 1;
        } else {
            let written = match doc.kind {
                ResourceKind::Binary if self.deduplicate_blobs => {
                    self.write_blob(scope, doc).map(|id| blob_id = Some(id))
                }
                ResourceKind::Binary => self.write_binary(scope, doc, filename),
                ResourceKind::Xml => self.write_xml(scope, doc, filename),
            };
            if let Err(e) = written {
                self.progress
                    .error(&format!("Failed to export document {}", name), Some(&e.to_string()));
                return Ok(false);
            }
        }

        manifest.resource(&ResourceEntry {
            kind: doc.kind,
            name: name.to_string(),
            skip,
            permission: doc.permission.clone(),
            created: doc.metadata.created,
            modified: doc.metadata.modified,
            filename: filename.to_string(),
            mime_type: doc.metadata.mime_type.clone(),
            doctype: doc.metadata.doctype.clone(),
            blob_id,
        })?;
        self.stats.documents += 1;
        Ok(true)
    }

    fn write_xml(&self, scope: &mut CollectionScope<'_>, doc: &DocumentRecord, filename: &str) -> Result<()> {
        let entry = scope.entry(filename)?;
        serializer::serialize_document(self.broker, doc, entry)?.close()
    }

    fn write_binary(&self, scope: &mut CollectionScope<'_>, doc: &DocumentRecord, filename: &str) -> Result<()> {
        let mut entry = scope.entry(filename)?;
        self.broker.read_binary(doc, &mut entry)?;
        entry.close()
    }

    /// Write a binary document into the blob store once per distinct id.
    fn write_blob(&mut self, scope: &mut CollectionScope<'_>, doc: &DocumentRecord) -> Result<String> {
        let id = match &doc.blob_id {
            Some(id) => id.clone(),
            None => {
                let mut hasher = HashingWriter(Sha256::new());
                self.broker.read_binary(doc, &mut hasher)?;
                hex::encode(hasher.0.finalize())
            }
        };
        if self.blobs.contains(&id) {
            return Ok(id);
        }
        let mut entry = scope.blob_entry(&id)?;
        self.broker.read_binary(doc, &mut entry)?;
        entry.close()?;
        self.blobs.insert(id.clone());
        self.stats.blobs += 1;
        Ok(id)
    }

    /// Add `deleted` markers for members of the previous backup's manifest
    /// that no longer exist.
    fn write_deleted(
        &self,
        previous: &Previous,
        collection: &CollectionRecord,
        documents: &[DocumentRecord],
        manifest: &mut ManifestWriter<Vec<u8>>,
    ) -> Result<()> {
        let relative = archive_path(&collection.path);
        let below_root = relative
            .strip_prefix(&archive_path(ROOT_COLLECTION))
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(&relative);
        let contents = if below_root.is_empty() {
            previous.descriptor.contents()?
        } else {
            match previous.descriptor.descendant(below_root)? {
                Some(descriptor) => descriptor.contents()?,
                None => return Ok(()),
            }
        };

        let reader = ManifestReader::new(BufReader::new(contents), previous.descriptor.symbolic_member_path(&relative));
        for event in reader {
            match event? {
                ManifestEvent::Subcollection(attrs) => {
                    if let Some(name) = attrs.get("name") {
                        if !collection.children.iter().any(|c| c == name) {
                            manifest.deleted(name, DeletedKind::Collection)?;
                        }
                    }
                }
                ManifestEvent::Resource(attrs) => {
                    if let Some(name) = attrs.get("name") {
                        if !documents.iter().any(|d| d.name == name) {
                            manifest.deleted(name, DeletedKind::Resource)?;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// The live lost+found collection, or a new one when there are orphans
/// and the store has none.
fn lost_and_found_record(live: Option<&CollectionRecord>, has_orphans: bool) -> Option<CollectionRecord> {
    match live {
        Some(live) => Some(live.clone()),
        None if has_orphans => Some(CollectionRecord {
            id: CollectionId(u32::MAX),
            path: LOST_AND_FOUND_COLLECTION.to_string(),
            created: Utc::now(),
            permission: Permission::new(ADMIN_ACCOUNT, DBA_GROUP, LOST_AND_FOUND_MODE),
            children: Vec::new(),
        }),
        None => None,
    }
}

/// `name`, or `name.1`, `name.2`, ... if it is already taken.
fn unique_name(name: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(name) {
        return name.to_string();
    }
    (1..)
        .map(|i| format!("{}.{}", name, i))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consistency::ErrorKind;
    use crate::descriptor::open_backup;
    use crate::progress::testing::RecordingProgress;
    use crate::storage::{
        CollectionScan, Credentials, DocumentScan, InstalledPackage, MemoryStore, NodeId, NodeStream,
        StorageAddress, StorageError,
    };
    use std::io::Read;
    use tempfile::TempDir;

    /// Delegates to a store, failing the document listing of one
    /// collection and the content of one document.
    #[derive(Default)]
    struct FaultyBroker<'s> {
        store: Option<&'s MemoryStore>,
        unlisted: Option<&'static str>,
        unreadable: Option<&'static str>,
    }

    impl<'s> FaultyBroker<'s> {
        fn over(store: &'s MemoryStore) -> Self {
            Self {
                store: Some(store),
                ..Self::default()
            }
        }

        fn store(&self) -> &'s MemoryStore {
            self.store.unwrap()
        }

        fn check_readable(&self, doc: &DocumentRecord) -> crate::storage::StorageResult<()> {
            if self.unreadable == Some(doc.name.as_str()) {
                return Err(StorageError::Corrupt(format!("page of {} is damaged", doc.name)));
            }
            Ok(())
        }
    }

    impl Broker for FaultyBroker<'_> {
        fn collection(&self, path: &str) -> crate::storage::StorageResult<Option<CollectionRecord>> {
            self.store().collection(path)
        }

        fn documents(&self, collection: &CollectionRecord) -> crate::storage::StorageResult<Vec<DocumentRecord>> {
            if self.unlisted == Some(collection.path.as_str()) {
                return Err(StorageError::Corrupt(format!("index of {} is damaged", collection.path)));
            }
            self.store().documents(collection)
        }

        fn scan_collections(&self) -> CollectionScan<'_> {
            self.store().scan_collections()
        }

        fn scan_documents(&self, direct_access: bool) -> DocumentScan<'_> {
            self.store().scan_documents(direct_access)
        }

        fn node_stream(&self, doc: &DocumentRecord) -> crate::storage::StorageResult<NodeStream<'_>> {
            self.check_readable(doc)?;
            self.store().node_stream(doc)
        }

        fn root_element(&self, doc: &DocumentRecord) -> crate::storage::StorageResult<Option<NodeId>> {
            self.store().root_element(doc)
        }

        fn node_address(
            &self,
            doc: DocumentId,
            node: &NodeId,
        ) -> crate::storage::StorageResult<Option<StorageAddress>> {
            self.store().node_address(doc, node)
        }

        fn index_depth(&self) -> usize {
            self.store().index_depth()
        }

        fn read_binary(&self, doc: &DocumentRecord, out: &mut dyn Write) -> crate::storage::StorageResult<u64> {
            self.check_readable(doc)?;
            self.store().read_binary(doc, out)
        }

        fn account_exists(&self, name: &str) -> bool {
            self.store().account_exists(name)
        }

        fn group_exists(&self, name: &str) -> bool {
            self.store().group_exists(name)
        }

        fn installed_packages(&self) -> Vec<InstalledPackage> {
            self.store().installed_packages()
        }

        fn authenticate(&self, credentials: &Credentials) -> crate::storage::StorageResult<()> {
            self.store().authenticate(credentials)
        }
    }

    fn directory_options() -> ExportOptions {
        ExportOptions {
            zip: false,
            ..ExportOptions::default()
        }
    }

    fn sample_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.create_collection("/db/data/nested").unwrap();
        store.create_collection("/db/system/temp").unwrap();
        store.put_xml("/db/data", "a.xml", "<root><item/></root>").unwrap();
        store.put_xml("/db/data/nested", "what?.xml", "<q/>").unwrap();
        store.put_binary("/db/data", "c.bin", b"binary", "application/octet-stream").unwrap();
        store.put_xml("/db/system/temp", "scratch.xml", "<tmp/>").unwrap();
        store
    }

    fn read_member(descriptor: &dyn BackupDescriptor, name: &str) -> String {
        let mut out = String::new();
        descriptor.member(name).unwrap().unwrap().read_to_string(&mut out).unwrap();
        out
    }

    fn manifest_of(descriptor: &dyn BackupDescriptor) -> String {
        let mut out = String::new();
        descriptor.contents().unwrap().read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn test_archive_path_escapes_segments() {
        assert_eq!(archive_path("/db"), "db");
        assert_eq!(archive_path("/db/a:b/c"), "db/a&3A;b/c");
    }

    #[test]
    fn test_unique_name() {
        let taken: HashSet<String> = ["a.xml", "a.xml.1"].iter().map(|s| s.to_string()).collect();
        assert_eq!(unique_name("b.xml", &taken), "b.xml");
        assert_eq!(unique_name("a.xml", &taken), "a.xml.2");
    }

    #[test]
    fn test_full_directory_export() -> Result<()> {
        let temp = TempDir::new()?;
        let store = sample_store();
        let mut progress = RecordingProgress::default();
        let options = ExportOptions {
            zip: false,
            ..ExportOptions::default()
        };

        let path = SystemExport::new(&store, &mut progress).export(temp.path(), &options, &[])?;
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("full"));
        assert!(progress.errors.is_empty(), "{:?}", progress.errors);
        assert!(!progress.collections.iter().any(|c| c.starts_with(TEMP_COLLECTION)));

        let top = open_backup(&path)?;
        let root = manifest_of(top.as_ref());
        assert!(root.contains(r#"<subcollection name="data" filename="data"/>"#), "{}", root);
        assert!(root.contains(r#"<subcollection name="system" filename="system"/>"#), "{}", root);

        let data = top.child("data")?.unwrap();
        assert!(read_member(data.as_ref(), "a.xml").ends_with("<root><item/></root>"));
        assert_eq!(read_member(data.as_ref(), "c.bin"), "binary");

        let nested = top.descendant("data/nested")?.unwrap();
        assert!(manifest_of(nested.as_ref()).contains(r#"name="what?.xml""#));
        assert!(nested.member("what&3F;.xml")?.is_some());

        let system = top.child("system")?.unwrap();
        assert!(!manifest_of(system.as_ref()).contains("temp"));
        assert!(top.descendant("system/temp")?.is_none());
        assert_eq!(top.number_of_resources(), 3);
        Ok(())
    }

    #[test]
    fn test_damaged_documents_are_left_out() -> Result<()> {
        let temp = TempDir::new()?;
        let store = sample_store();
        let damaged = store.document("/db/data", "a.xml").unwrap();
        let known = vec![ErrorReport::resource(
            ErrorKind::ResourceAccessFailed,
            "unreadable",
            Some(damaged.id),
        )];
        let mut progress = RecordingProgress::default();
        let options = ExportOptions {
            zip: false,
            ..ExportOptions::default()
        };
        let path = SystemExport::new(&store, &mut progress).export(temp.path(), &options, &known)?;

        let data = open_backup(&path)?.child("data")?.unwrap();
        assert!(!manifest_of(data.as_ref()).contains("a.xml"));
        assert!(data.member("a.xml")?.is_none());
        Ok(())
    }

    #[test]
    fn test_deduplicated_blobs_are_written_once() -> Result<()> {
        let temp = TempDir::new()?;
        let mut store = MemoryStore::new();
        store.put_binary("/db", "one.bin", b"same", "application/octet-stream").unwrap();
        store.put_binary("/db", "two.bin", b"same", "application/octet-stream").unwrap();
        let mut progress = RecordingProgress::default();
        let options = ExportOptions {
            zip: false,
            deduplicate_blobs: true,
            ..ExportOptions::default()
        };
        let path = SystemExport::new(&store, &mut progress).export(temp.path(), &options, &[])?;

        let blobs: Vec<_> = std::fs::read_dir(path.join("blob"))?.collect();
        assert_eq!(blobs.len(), 1);
        let root = manifest_of(open_backup(&path)?.as_ref());
        assert!(root.contains(r#"deduplicate-blobs="yes""#), "{}", root);
        assert!(root.contains(r#"version="2""#), "{}", root);
        assert_eq!(root.matches("blob-id=").count(), 2);
        Ok(())
    }

    #[test]
    fn test_orphans_go_to_lost_and_found() -> Result<()> {
        let temp = TempDir::new()?;
        let mut store = MemoryStore::new();
        store.create_collection("/db/a").unwrap();
        store.create_collection("/db/b").unwrap();
        store.put_xml("/db/a", "doc.xml", "<a/>").unwrap();
        store.put_xml("/db/b", "doc.xml", "<b/>").unwrap();
        store.delete_collection_record("/db/a").unwrap();
        store.delete_collection_record("/db/b").unwrap();

        let mut progress = RecordingProgress::default();
        let options = ExportOptions {
            zip: false,
            ..ExportOptions::default()
        };
        let path = SystemExport::new(&store, &mut progress).export(temp.path(), &options, &[])?;
        assert_eq!(
            progress
                .errors
                .iter()
                .filter(|e| e.starts_with("Found an orphaned document"))
                .count(),
            2
        );

        let top = open_backup(&path)?;
        assert!(manifest_of(top.as_ref()).contains(LOST_AND_FOUND_NAME));
        let lost = top.child(LOST_AND_FOUND_NAME)?.unwrap();
        let manifest = manifest_of(lost.as_ref());
        assert!(manifest.contains(r#"name="doc.xml""#), "{}", manifest);
        assert!(manifest.contains(r#"name="doc.xml.1""#), "{}", manifest);
        assert!(manifest.contains(r#"mode="771""#), "{}", manifest);
        Ok(())
    }

    #[test]
    fn test_unlisted_documents_reach_lost_and_found() -> Result<()> {
        let temp = TempDir::new()?;
        let store = sample_store();
        let broker = FaultyBroker {
            unlisted: Some("/db/data"),
            ..FaultyBroker::over(&store)
        };
        let mut progress = RecordingProgress::default();
        let path = SystemExport::new(&broker, &mut progress).export(temp.path(), &directory_options(), &[])?;

        assert!(progress.errors.contains(&"Failed to list documents of /db/data".to_string()));
        assert!(progress.errors.contains(&"Found an orphaned document: a.xml".to_string()));
        assert!(progress.errors.contains(&"Found an orphaned document: c.bin".to_string()));

        let top = open_backup(&path)?;
        let root = manifest_of(top.as_ref());
        assert!(root.contains(LOST_AND_FOUND_NAME), "{}", root);
        let data = top.child("data")?.unwrap();
        assert!(!manifest_of(data.as_ref()).contains("a.xml"));

        let lost = top.child(LOST_AND_FOUND_NAME)?.unwrap();
        let manifest = manifest_of(lost.as_ref());
        assert!(manifest.contains(r#"name="a.xml""#), "{}", manifest);
        assert!(manifest.contains(r#"name="c.bin""#), "{}", manifest);
        assert!(!manifest.contains("scratch.xml"), "{}", manifest);
        assert_eq!(read_member(lost.as_ref(), "c.bin"), "binary");
        assert_eq!(top.number_of_resources(), 3);
        Ok(())
    }

    #[test]
    fn test_failed_collection_documents_reach_lost_and_found() -> Result<()> {
        let temp = TempDir::new()?;
        let mut store = MemoryStore::new();
        store.create_collection("/db/data/nested").unwrap();
        store.put_xml("/db/data/nested", "inner.xml", "<inner/>").unwrap();
        // the document's file takes the place of the child collection's directory
        store.put_binary("/db/data", "nested", b"blocker", "application/octet-stream").unwrap();

        let mut progress = RecordingProgress::default();
        let path = SystemExport::new(&store, &mut progress).export(temp.path(), &directory_options(), &[])?;
        assert!(
            progress.errors.contains(&"Failed to export collection /db/data/nested".to_string()),
            "{:?}",
            progress.errors
        );
        assert!(progress.errors.contains(&"Found an orphaned document: inner.xml".to_string()));

        let top = open_backup(&path)?;
        let lost = top.child(LOST_AND_FOUND_NAME)?.unwrap();
        assert!(read_member(lost.as_ref(), "inner.xml").ends_with("<inner/>"));
        Ok(())
    }

    #[test]
    fn test_unreadable_content_is_reported_and_left_out() -> Result<()> {
        let temp = TempDir::new()?;
        let store = sample_store();
        let broker = FaultyBroker {
            unreadable: Some("a.xml"),
            ..FaultyBroker::over(&store)
        };
        let mut progress = RecordingProgress::default();
        let path = SystemExport::new(&broker, &mut progress).export(temp.path(), &directory_options(), &[])?;

        assert_eq!(progress.errors, vec!["Failed to export document a.xml".to_string()]);
        let top = open_backup(&path)?;
        let data = top.child("data")?.unwrap();
        let manifest = manifest_of(data.as_ref());
        assert!(!manifest.contains("a.xml"), "{}", manifest);
        assert!(manifest.contains(r#"name="c.bin""#), "{}", manifest);
        assert!(top.child(LOST_AND_FOUND_NAME)?.is_none());
        Ok(())
    }

    #[test]
    fn test_unlisted_collection_writes_no_deleted_markers() -> Result<()> {
        let temp = TempDir::new()?;
        let store = sample_store();
        let mut progress = RecordingProgress::default();
        SystemExport::new(&store, &mut progress).export(temp.path(), &directory_options(), &[])?;

        let broker = FaultyBroker {
            unlisted: Some("/db/data"),
            ..FaultyBroker::over(&store)
        };
        let options = ExportOptions {
            incremental: true,
            ..directory_options()
        };
        let path = SystemExport::new(&broker, &mut progress).export(temp.path(), &options, &[])?;

        let data = open_backup(&path)?.child("data")?.unwrap();
        let manifest = manifest_of(data.as_ref());
        assert!(!manifest.contains("<deleted"), "{}", manifest);
        Ok(())
    }

    #[test]
    fn test_cancelled_zip_export_is_removed() -> Result<()> {
        let temp = TempDir::new()?;
        let store = sample_store();
        let mut progress = RecordingProgress::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = SystemExport::new(&store, &mut progress)
            .with_cancel(cancel)
            .export(temp.path(), &ExportOptions::default(), &[]);
        assert!(matches!(result, Err(BackupError::Terminated)));
        assert_eq!(std::fs::read_dir(temp.path())?.count(), 0);
        Ok(())
    }
}
