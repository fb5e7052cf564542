//! In-memory reference storage engine.
//!
//! Keeps collections, documents and their persisted node records in ordered
//! maps and can be saved to / loaded from a JSON snapshot. The `corrupt_*`,
//! `detach_*` and `delete_*` methods damage records in the same ways a real
//! page store can be damaged, so the consistency check and the failsafe
//! export paths can be exercised.

use super::model::*;
use super::node::{NodeData, NodeEvent, NodeId, NodeKind, StorageAddress};
use super::parser::parse_document;
use super::{
    Broker, BrokerMut, CollectionScan, DocumentScan, NodeStream, StorageError, StorageResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info};

const DEFAULT_INDEX_DEPTH: usize = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCollection {
    id: CollectionId,
    created: DateTime<Utc>,
    permission: Permission,
    children: Vec<String>,
    #[serde(default)]
    unreadable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StoredContent {
    Xml {
        nodes: Vec<NodeEvent>,
        index: BTreeMap<NodeId, StorageAddress>,
    },
    Binary {
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDocument {
    id: DocumentId,
    collection_id: CollectionId,
    name: String,
    permission: Permission,
    metadata: DocumentMetadata,
    first_node: StorageAddress,
    blob_id: Option<String>,
    content: StoredContent,
    #[serde(default)]
    unreadable: bool,
    #[serde(default)]
    root_detached: bool,
}

impl StoredDocument {
    fn kind(&self) -> ResourceKind {
        match self.content {
            StoredContent::Xml { .. } => ResourceKind::Xml,
            StoredContent::Binary { .. } => ResourceKind::Binary,
        }
    }

    fn size(&self) -> u64 {
        match &self.content {
            StoredContent::Xml { nodes, .. } => nodes.len() as u64,
            StoredContent::Binary { data } => data.len() as u64,
        }
    }

    fn record(&self) -> DocumentRecord {
        DocumentRecord {
            id: self.id,
            collection_id: self.collection_id,
            name: self.name.clone(),
            kind: self.kind(),
            permission: self.permission.clone(),
            metadata: self.metadata.clone(),
            first_node: self.first_node,
            blob_id: self.blob_id.clone(),
            size: self.size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Account {
    password_digest: String,
    groups: Vec<String>,
}

/// In-memory [`Broker`] / [`BrokerMut`] implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStore {
    collections: BTreeMap<String, StoredCollection>,
    documents: BTreeMap<DocumentId, StoredDocument>,
    accounts: BTreeMap<String, Account>,
    groups: BTreeSet<String>,
    #[serde(default)]
    packages: Vec<InstalledPackage>,
    next_collection_id: u32,
    next_document_id: u32,
    next_page: u32,
    index_depth: usize,
    triggers_enabled: bool,
}

fn digest(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store holding only the root collection and the built-in
    /// accounts (`SYSTEM`, `admin` with an empty password, `guest`).
    pub fn new() -> Self {
        let mut store = Self {
            collections: BTreeMap::new(),
            documents: BTreeMap::new(),
            accounts: BTreeMap::new(),
            groups: BTreeSet::new(),
            packages: Vec::new(),
            next_collection_id: 0,
            next_document_id: 0,
            next_page: 1,
            index_depth: DEFAULT_INDEX_DEPTH,
            triggers_enabled: true,
        };
        store.groups.insert(DBA_GROUP.to_string());
        store.groups.insert(GUEST_GROUP.to_string());
        store.add_account(SYSTEM_ACCOUNT, "", &[DBA_GROUP]);
        store.add_account(ADMIN_ACCOUNT, "", &[DBA_GROUP]);
        store.add_account(GUEST_ACCOUNT, "guest", &[GUEST_GROUP]);
        store.insert_collection(ROOT_COLLECTION, Utc::now());
        store
    }

    /// Load a store from a JSON snapshot.
    pub fn load(path: &Path) -> StorageResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let store: MemoryStore = serde_json::from_str(&content)
            .map_err(|e| StorageError::Snapshot(format!("{}: {}", path.display(), e)))?;
        info!(
            "Loaded store snapshot {} ({} collections, {} documents)",
            path.display(),
            store.collections.len(),
            store.documents.len()
        );
        Ok(store)
    }

    /// Write the store to a JSON snapshot.
    pub fn save(&self, path: &Path) -> StorageResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| StorageError::Snapshot(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn set_index_depth(&mut self, depth: usize) {
        self.index_depth = depth;
    }

    pub fn add_account(&mut self, name: &str, password: &str, groups: &[&str]) {
        for group in groups {
            self.groups.insert(group.to_string());
        }
        self.accounts.insert(
            name.to_string(),
            Account {
                password_digest: digest(password.as_bytes()),
                groups: groups.iter().map(|g| g.to_string()).collect(),
            },
        );
    }

    pub fn remove_account(&mut self, name: &str) -> bool {
        self.accounts.remove(name).is_some()
    }

    pub fn add_group(&mut self, name: &str) {
        self.groups.insert(name.to_string());
    }

    pub fn install_package(&mut self, path: &str, version: &str) {
        self.packages.retain(|p| p.path != path);
        self.packages.push(InstalledPackage {
            path: path.to_string(),
            version: version.to_string(),
        });
    }

    /// Create a collection (and missing ancestors) stamped with the current time.
    pub fn create_collection(&mut self, path: &str) -> StorageResult<CollectionRecord> {
        self.get_or_create_collection(path, Utc::now())
    }

    /// Store an XML document from a string.
    pub fn put_xml(&mut self, collection: &str, name: &str, xml: &str) -> StorageResult<DocumentRecord> {
        self.store_document(collection, name, &mut xml.as_bytes(), NewDocument::xml())
    }

    /// Store a binary document.
    pub fn put_binary(
        &mut self,
        collection: &str,
        name: &str,
        data: &[u8],
        mime_type: &str,
    ) -> StorageResult<DocumentRecord> {
        self.store_document(collection, name, &mut &data[..], NewDocument::binary(mime_type))
    }

    /// Look a document up by collection path and name.
    pub fn document(&self, collection: &str, name: &str) -> Option<DocumentRecord> {
        self.find_document(collection, name)
            .map(|id| self.documents[&id].record())
    }

    /// Raw content of a binary document.
    pub fn binary_content(&self, collection: &str, name: &str) -> Option<Vec<u8>> {
        let id = self.find_document(collection, name)?;
        match &self.documents[&id].content {
            StoredContent::Binary { data } => Some(data.clone()),
            StoredContent::Xml { .. } => None,
        }
    }

    pub fn set_modified(&mut self, collection: &str, name: &str, modified: DateTime<Utc>) -> StorageResult<()> {
        let doc = self.document_mut(collection, name)?;
        doc.metadata.modified = modified;
        Ok(())
    }

    pub fn collection_paths(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    pub fn document_total(&self) -> usize {
        self.documents.len()
    }

    // ---- damage injection ----

    /// Overwrite the child count stored in an element header.
    pub fn corrupt_child_count(
        &mut self,
        collection: &str,
        name: &str,
        node: &NodeId,
        child_count: usize,
    ) -> StorageResult<()> {
        let event = self.start_event_mut(collection, name, node)?;
        if let NodeData::StartElement { child_count: stored, .. } = &mut event.data {
            *stored = child_count;
        }
        Ok(())
    }

    /// Overwrite the attribute count stored in an element header.
    pub fn corrupt_attribute_count(
        &mut self,
        collection: &str,
        name: &str,
        node: &NodeId,
        attribute_count: usize,
    ) -> StorageResult<()> {
        let event = self.start_event_mut(collection, name, node)?;
        if let NodeData::StartElement { attribute_count: stored, .. } = &mut event.data {
            *stored = attribute_count;
        }
        Ok(())
    }

    /// Overwrite the node type stored in an element header.
    pub fn corrupt_node_type(
        &mut self,
        collection: &str,
        name: &str,
        node: &NodeId,
        kind: NodeKind,
    ) -> StorageResult<()> {
        let event = self.start_event_mut(collection, name, node)?;
        event.stored_kind = kind;
        Ok(())
    }

    /// Overwrite the node id of the `position`-th stored event.
    pub fn corrupt_node_id(
        &mut self,
        collection: &str,
        name: &str,
        position: usize,
        node: NodeId,
    ) -> StorageResult<()> {
        let doc = self.document_mut(collection, name)?;
        match &mut doc.content {
            StoredContent::Xml { nodes, .. } => {
                let event = nodes
                    .get_mut(position)
                    .ok_or_else(|| StorageError::Corrupt(format!("no node at position {}", position)))?;
                event.node_id = node;
                Ok(())
            }
            StoredContent::Binary { .. } => Err(StorageError::Corrupt(format!("{} is not XML", name))),
        }
    }

    /// Point an address index entry somewhere else.
    pub fn corrupt_index_entry(
        &mut self,
        collection: &str,
        name: &str,
        node: &NodeId,
        address: StorageAddress,
    ) -> StorageResult<()> {
        let doc = self.document_mut(collection, name)?;
        match &mut doc.content {
            StoredContent::Xml { index, .. } => {
                index.insert(node.clone(), address);
                Ok(())
            }
            StoredContent::Binary { .. } => Err(StorageError::Corrupt(format!("{} is not XML", name))),
        }
    }

    /// Make the document element of a document unreachable.
    pub fn detach_root_element(&mut self, collection: &str, name: &str) -> StorageResult<()> {
        self.document_mut(collection, name)?.root_detached = true;
        Ok(())
    }

    /// Make a document record undecodable.
    pub fn corrupt_document_record(&mut self, collection: &str, name: &str) -> StorageResult<()> {
        self.document_mut(collection, name)?.unreadable = true;
        Ok(())
    }

    /// Make a collection record undecodable.
    pub fn corrupt_collection_record(&mut self, path: &str) -> StorageResult<()> {
        let stored = self
            .collections
            .get_mut(path)
            .ok_or_else(|| StorageError::CollectionNotFound(path.to_string()))?;
        stored.unreadable = true;
        Ok(())
    }

    /// Drop a collection record while keeping its documents and the parent's
    /// child entry, leaving the documents orphaned.
    pub fn delete_collection_record(&mut self, path: &str) -> StorageResult<()> {
        self.collections
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StorageError::CollectionNotFound(path.to_string()))
    }

    // ---- internals ----

    fn insert_collection(&mut self, path: &str, created: DateTime<Utc>) -> CollectionRecord {
        let id = CollectionId(self.next_collection_id);
        self.next_collection_id += 1;
        let stored = StoredCollection {
            id,
            created,
            permission: Permission::new(ADMIN_ACCOUNT, DBA_GROUP, 0o755),
            children: Vec::new(),
            unreadable: false,
        };
        self.collections.insert(path.to_string(), stored.clone());
        to_record(path, &stored)
    }

    fn find_document(&self, collection: &str, name: &str) -> Option<DocumentId> {
        let collection_id = self.collections.get(collection)?.id;
        self.documents
            .values()
            .find(|d| d.collection_id == collection_id && d.name == name)
            .map(|d| d.id)
    }

    fn document_mut(&mut self, collection: &str, name: &str) -> StorageResult<&mut StoredDocument> {
        let id = self
            .find_document(collection, name)
            .ok_or_else(|| StorageError::DocumentNotFound(child_path(collection, name)))?;
        self.documents
            .get_mut(&id)
            .ok_or_else(|| StorageError::DocumentNotFound(child_path(collection, name)))
    }

    fn start_event_mut(
        &mut self,
        collection: &str,
        name: &str,
        node: &NodeId,
    ) -> StorageResult<&mut NodeEvent> {
        let doc = self.document_mut(collection, name)?;
        match &mut doc.content {
            StoredContent::Xml { nodes, .. } => nodes
                .iter_mut()
                .find(|n| &n.node_id == node && matches!(n.data, NodeData::StartElement { .. }))
                .ok_or_else(|| StorageError::Corrupt(format!("no element {} in {}", node, name))),
            StoredContent::Binary { .. } => Err(StorageError::Corrupt(format!("{} is not XML", name))),
        }
    }

    fn stored_document(&self, doc: DocumentId) -> StorageResult<&StoredDocument> {
        self.documents
            .get(&doc)
            .ok_or_else(|| StorageError::DocumentNotFound(doc.to_string()))
    }
}

fn to_record(path: &str, stored: &StoredCollection) -> CollectionRecord {
    CollectionRecord {
        id: stored.id,
        path: path.to_string(),
        created: stored.created,
        permission: stored.permission.clone(),
        children: stored.children.clone(),
    }
}

impl Broker for MemoryStore {
    fn collection(&self, path: &str) -> StorageResult<Option<CollectionRecord>> {
        match self.collections.get(path) {
            None => Ok(None),
            Some(stored) if stored.unreadable => Err(StorageError::Corrupt(format!(
                "collection record {} cannot be decoded",
                path
            ))),
            Some(stored) => Ok(Some(to_record(path, stored))),
        }
    }

    fn documents(&self, collection: &CollectionRecord) -> StorageResult<Vec<DocumentRecord>> {
        Ok(self
            .documents
            .values()
            .filter(|d| d.collection_id == collection.id && !d.unreadable)
            .map(StoredDocument::record)
            .collect())
    }

    fn scan_collections(&self) -> CollectionScan<'_> {
        Box::new(self.collections.iter().map(|(path, stored)| {
            if stored.unreadable {
                Err(CorruptCollection {
                    path: path.clone(),
                    message: "collection record cannot be decoded".to_string(),
                })
            } else {
                Ok(to_record(path, stored))
            }
        }))
    }

    fn scan_documents(&self, direct_access: bool) -> DocumentScan<'_> {
        debug!("Scanning document records (direct access: {})", direct_access);
        Box::new(self.documents.values().map(|doc| {
            if doc.unreadable {
                Err(CorruptDocument {
                    id: doc.id,
                    message: format!("document record {} cannot be decoded", doc.id),
                })
            } else {
                Ok(doc.record())
            }
        }))
    }

    fn node_stream(&self, doc: &DocumentRecord) -> StorageResult<NodeStream<'_>> {
        let stored = self.stored_document(doc.id)?;
        match &stored.content {
            StoredContent::Xml { nodes, .. } => Ok(Box::new(nodes.iter().cloned().map(Ok))),
            StoredContent::Binary { .. } => Err(StorageError::Corrupt(format!(
                "document {} has no node stream",
                doc.name
            ))),
        }
    }

    fn root_element(&self, doc: &DocumentRecord) -> StorageResult<Option<NodeId>> {
        let stored = self.stored_document(doc.id)?;
        if stored.root_detached {
            return Ok(None);
        }
        match &stored.content {
            StoredContent::Xml { nodes, .. } => Ok(nodes
                .iter()
                .find(|n| n.node_id.level() == 1 && matches!(n.data, NodeData::StartElement { .. }))
                .map(|n| n.node_id.clone())),
            StoredContent::Binary { .. } => Ok(None),
        }
    }

    fn node_address(&self, doc: DocumentId, node: &NodeId) -> StorageResult<Option<StorageAddress>> {
        let stored = self.stored_document(doc)?;
        match &stored.content {
            StoredContent::Xml { index, .. } => Ok(index.get(node).copied()),
            StoredContent::Binary { .. } => Ok(None),
        }
    }

    fn index_depth(&self) -> usize {
        self.index_depth
    }

    fn read_binary(&self, doc: &DocumentRecord, out: &mut dyn Write) -> StorageResult<u64> {
        let stored = self.stored_document(doc.id)?;
        match &stored.content {
            StoredContent::Binary { data } => {
                out.write_all(data)?;
                Ok(data.len() as u64)
            }
            StoredContent::Xml { .. } => Err(StorageError::Corrupt(format!(
                "document {} is not a binary resource",
                doc.name
            ))),
        }
    }

    fn account_exists(&self, name: &str) -> bool {
        self.accounts.contains_key(name)
    }

    fn group_exists(&self, name: &str) -> bool {
        self.groups.contains(name)
    }

    fn installed_packages(&self) -> Vec<InstalledPackage> {
        self.packages.clone()
    }

    fn authenticate(&self, credentials: &Credentials) -> StorageResult<()> {
        match self.accounts.get(&credentials.user) {
            Some(account) if account.password_digest == digest(credentials.password.as_bytes()) => {
                if account.groups.iter().any(|g| g == DBA_GROUP) {
                    Ok(())
                } else {
                    Err(StorageError::PermissionDenied(format!(
                        "{} is not a member of the {} group",
                        credentials.user, DBA_GROUP
                    )))
                }
            }
            _ => Err(StorageError::PermissionDenied(format!(
                "invalid credentials for {}",
                credentials.user
            ))),
        }
    }
}

impl BrokerMut for MemoryStore {
    fn get_or_create_collection(
        &mut self,
        path: &str,
        created: DateTime<Utc>,
    ) -> StorageResult<CollectionRecord> {
        if let Some(existing) = self.collection(path)? {
            return Ok(existing);
        }
        if !is_within(path, ROOT_COLLECTION) {
            return Err(StorageError::CollectionNotFound(format!(
                "{} is outside of {}",
                path, ROOT_COLLECTION
            )));
        }
        if let Some(parent) = parent_path(path) {
            self.get_or_create_collection(parent, created)?;
            let name = last_segment(path).to_string();
            if let Some(stored) = self.collections.get_mut(parent) {
                if !stored.children.contains(&name) {
                    stored.children.push(name);
                }
            }
        }
        Ok(self.insert_collection(path, created))
    }

    fn store_document(
        &mut self,
        collection: &str,
        name: &str,
        content: &mut dyn Read,
        document: NewDocument,
    ) -> StorageResult<DocumentRecord> {
        let collection_id = self
            .collection(collection)?
            .ok_or_else(|| StorageError::CollectionNotFound(collection.to_string()))?
            .id;

        let mut bytes = Vec::new();
        content.read_to_end(&mut bytes)?;

        let first_page = self.next_page;
        let (content, first_node, blob_id, doctype) = match document.kind {
            ResourceKind::Xml => {
                let parsed = parse_document(&bytes, first_page, self.index_depth)?;
                self.next_page = parsed.next_page;
                let first_node = parsed
                    .nodes
                    .first()
                    .map(|n| n.address)
                    .unwrap_or_else(|| StorageAddress::new(first_page, 0));
                let doctype = document.doctype.or(parsed.doctype);
                (
                    StoredContent::Xml {
                        nodes: parsed.nodes,
                        index: parsed.index,
                    },
                    first_node,
                    None,
                    doctype,
                )
            }
            ResourceKind::Binary => {
                self.next_page += 1 + (bytes.len() / 4096) as u32;
                let blob_id = digest(&bytes);
                (
                    StoredContent::Binary { data: bytes },
                    StorageAddress::new(first_page, 0),
                    Some(blob_id),
                    None,
                )
            }
        };

        let now = Utc::now();
        let existing = self.find_document(collection, name);
        let (id, permission, created) = match existing.and_then(|id| self.documents.remove(&id)) {
            Some(old) => (old.id, old.permission, old.metadata.created),
            None => {
                let id = DocumentId(self.next_document_id);
                self.next_document_id += 1;
                (id, Permission::new(ADMIN_ACCOUNT, DBA_GROUP, 0o644), now)
            }
        };

        let stored = StoredDocument {
            id,
            collection_id,
            name: name.to_string(),
            permission,
            metadata: DocumentMetadata {
                created: document.created.unwrap_or(created),
                modified: document.modified.unwrap_or(now),
                mime_type: document.mime_type,
                doctype,
            },
            first_node,
            blob_id,
            content,
            unreadable: false,
            root_detached: false,
        };
        let record = stored.record();
        self.documents.insert(id, stored);
        Ok(record)
    }

    fn set_collection_permission(&mut self, path: &str, permission: Permission) -> StorageResult<()> {
        let stored = self
            .collections
            .get_mut(path)
            .ok_or_else(|| StorageError::CollectionNotFound(path.to_string()))?;
        stored.permission = permission;
        Ok(())
    }

    fn set_document_permission(
        &mut self,
        collection: &str,
        name: &str,
        permission: Permission,
    ) -> StorageResult<()> {
        self.document_mut(collection, name)?.permission = permission;
        Ok(())
    }

    fn remove_collection(&mut self, path: &str) -> StorageResult<bool> {
        if !self.collections.contains_key(path) {
            return Ok(false);
        }
        let doomed: Vec<String> = self
            .collections
            .keys()
            .filter(|p| is_within(p, path))
            .cloned()
            .collect();
        for doomed_path in &doomed {
            if let Some(stored) = self.collections.remove(doomed_path) {
                self.documents.retain(|_, d| d.collection_id != stored.id);
            }
        }
        if let Some(parent) = parent_path(path) {
            let name = last_segment(path);
            if let Some(stored) = self.collections.get_mut(parent) {
                stored.children.retain(|c| c != name);
            }
        }
        Ok(true)
    }

    fn remove_document(&mut self, collection: &str, name: &str) -> StorageResult<bool> {
        match self.find_document(collection, name) {
            Some(id) => Ok(self.documents.remove(&id).is_some()),
            None => Ok(false),
        }
    }

    fn triggers_enabled(&self) -> bool {
        self.triggers_enabled
    }

    fn set_triggers_enabled(&mut self, enabled: bool) {
        self.triggers_enabled = enabled;
    }

    fn set_password(&mut self, account: &str, password: &str) -> StorageResult<()> {
        let entry = self
            .accounts
            .get_mut(account)
            .ok_or_else(|| StorageError::PermissionDenied(format!("unknown account {}", account)))?;
        entry.password_digest = digest(password.as_bytes());
        Ok(())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}
