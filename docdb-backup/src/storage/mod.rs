//! Storage engine collaborator interfaces.
//!
//! The backup components never touch pages or B-trees directly. They see the
//! store through [`Broker`] (read side: failsafe enumeration, node streams,
//! the node address index, security lookups) and [`BrokerMut`] (write side,
//! used by restore). Lock scope follows the borrow: a `&dyn Broker` is a
//! read view, a `&mut dyn BrokerMut` is exclusive.

pub mod memory;
pub mod model;
pub mod node;
mod parser;

use std::io::{Read, Write};
use thiserror::Error;

pub use memory::MemoryStore;
pub use model::*;
pub use node::{NodeData, NodeEvent, NodeId, NodeKind, StorageAddress};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Failed to parse document: {0}")]
    Parse(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Stream of persisted node events of one document, in document order.
pub type NodeStream<'a> = Box<dyn Iterator<Item = StorageResult<NodeEvent>> + 'a>;

/// Failsafe enumeration of collection records, in path order.
pub type CollectionScan<'a> = Box<dyn Iterator<Item = Result<CollectionRecord, CorruptCollection>> + 'a>;

/// Failsafe enumeration of document records, in document id order.
pub type DocumentScan<'a> = Box<dyn Iterator<Item = Result<DocumentRecord, CorruptDocument>> + 'a>;

/// Read access to the storage engine.
pub trait Broker {
    /// Load a collection by absolute path. `Ok(None)` if there is no record.
    fn collection(&self, path: &str) -> StorageResult<Option<CollectionRecord>>;

    /// Documents of a collection in enumeration order.
    fn documents(&self, collection: &CollectionRecord) -> StorageResult<Vec<DocumentRecord>>;

    /// Every collection record, bypassing the hierarchy. Records that cannot
    /// be decoded are reported instead of ending the scan.
    fn scan_collections(&self) -> CollectionScan<'_>;

    /// Every document record, bypassing the hierarchy. With `direct_access`
    /// the records are read from the data pages instead of the index.
    fn scan_documents(&self, direct_access: bool) -> DocumentScan<'_>;

    /// Persisted node stream of an XML document.
    fn node_stream(&self, doc: &DocumentRecord) -> StorageResult<NodeStream<'_>>;

    /// Load the document element. `Ok(None)` if it cannot be located.
    fn root_element(&self, doc: &DocumentRecord) -> StorageResult<Option<NodeId>>;

    /// Look a node up in the address index.
    fn node_address(&self, doc: DocumentId, node: &NodeId) -> StorageResult<Option<StorageAddress>>;

    /// Elements at this tree level or above are kept in the address index.
    fn index_depth(&self) -> usize;

    /// Copy the content of a binary document. Returns the bytes written.
    fn read_binary(&self, doc: &DocumentRecord, out: &mut dyn Write) -> StorageResult<u64>;

    fn account_exists(&self, name: &str) -> bool;

    fn group_exists(&self, name: &str) -> bool;

    fn installed_packages(&self) -> Vec<InstalledPackage>;

    fn authenticate(&self, credentials: &Credentials) -> StorageResult<()>;
}

/// Write access to the storage engine.
pub trait BrokerMut: Broker {
    /// Return the collection at `path`, creating it and any missing ancestors.
    fn get_or_create_collection(
        &mut self,
        path: &str,
        created: chrono::DateTime<chrono::Utc>,
    ) -> StorageResult<CollectionRecord>;

    /// Store (or replace) a document.
    fn store_document(
        &mut self,
        collection: &str,
        name: &str,
        content: &mut dyn Read,
        document: NewDocument,
    ) -> StorageResult<DocumentRecord>;

    fn set_collection_permission(&mut self, path: &str, permission: Permission) -> StorageResult<()>;

    fn set_document_permission(
        &mut self,
        collection: &str,
        name: &str,
        permission: Permission,
    ) -> StorageResult<()>;

    /// Remove a collection and everything below it. `Ok(false)` if absent.
    fn remove_collection(&mut self, path: &str) -> StorageResult<bool>;

    /// Remove a document. `Ok(false)` if absent.
    fn remove_document(&mut self, collection: &str, name: &str) -> StorageResult<bool>;

    fn triggers_enabled(&self) -> bool;

    fn set_triggers_enabled(&mut self, enabled: bool);

    fn set_password(&mut self, account: &str, password: &str) -> StorageResult<()>;
}
