//! Read-only consistency check of a live store.
//!
//! Walks the collection hierarchy and, optionally, every document's persisted
//! node stream. Damage is recorded as [`ErrorReport`]s and the walk keeps
//! going; only cancellation aborts a check.

pub mod report;

use crate::progress::ProgressCallback;
use crate::storage::{
    Broker, CollectionRecord, DocumentRecord, NodeData, NodeId, NodeKind, ResourceKind,
    ROOT_COLLECTION,
};
use crate::utils::errors::{BackupError, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use report::{CollectionError, ErrorKind, ErrorReport, IndexError, ResourceError};

/// An element whose end event has not been seen yet.
struct ElementFrame {
    node_id: NodeId,
    /// Child count from the element header
    declared_children: usize,
    /// Children seen so far
    child_count: usize,
    previous_sibling: Option<NodeId>,
}

pub struct ConsistencyCheck<'a> {
    broker: &'a dyn Broker,
    direct_access: bool,
    deep: bool,
    cancel: CancellationToken,
    document_count: Option<usize>,
}

impl<'a> ConsistencyCheck<'a> {
    /// `deep` walks every node of every XML document instead of only
    /// loading the document element. `direct_access` reads document records
    /// from the data pages and skips the per-document second pass.
    pub fn new(broker: &'a dyn Broker, direct_access: bool, deep: bool) -> Self {
        Self {
            broker,
            direct_access,
            deep,
            cancel: CancellationToken::new(),
            document_count: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(BackupError::Terminated);
        }
        Ok(())
    }

    /// Run the collection tree walk and the document pass.
    pub fn check_all(&mut self, progress: &mut dyn ProgressCallback) -> Result<Vec<ErrorReport>> {
        let mut errors = Vec::new();
        if let Some(report) = self.check_configuration() {
            progress.error(&report.to_string(), None);
            errors.push(report);
        }
        errors.extend(self.check_collection_tree(progress)?);
        self.check_documents(progress, &mut errors)?;
        info!(
            "Consistency check finished: {} error(s) found",
            errors.len()
        );
        Ok(errors)
    }

    /// A deep check compares element addresses against the address index,
    /// which must hold at least the document elements.
    pub fn check_configuration(&self) -> Option<ErrorReport> {
        if !self.deep || self.broker.index_depth() > 0 {
            return None;
        }
        Some(ErrorReport::collection(
            ErrorKind::ConfigurationFailure,
            "Node index depth is 0, element addresses cannot be verified",
            None,
            ROOT_COLLECTION,
        ))
    }

    /// Visit every collection reachable from the root.
    pub fn check_collection_tree(&self, progress: &mut dyn ProgressCallback) -> Result<Vec<ErrorReport>> {
        let mut errors = Vec::new();
        let root = match self.broker.collection(ROOT_COLLECTION) {
            Ok(Some(root)) => root,
            Ok(None) => {
                let report = ErrorReport::collection(
                    ErrorKind::ChildCollection,
                    "Root collection not found",
                    None,
                    ROOT_COLLECTION,
                );
                progress.error(&report.to_string(), None);
                errors.push(report);
                return Ok(errors);
            }
            Err(e) => {
                let report = ErrorReport::collection(
                    ErrorKind::ChildCollection,
                    "Error while loading root collection",
                    None,
                    ROOT_COLLECTION,
                )
                .with_cause(&e);
                progress.error(&report.to_string(), report.cause());
                errors.push(report);
                return Ok(errors);
            }
        };

        let mut pending = vec![root];
        while let Some(collection) = pending.pop() {
            self.check_cancelled()?;
            progress.start_collection(&collection.path);

            for report in self.check_permissions(&collection) {
                progress.error(&report.to_string(), report.cause());
                errors.push(report);
            }

            let mut children = Vec::with_capacity(collection.children.len());
            for name in &collection.children {
                let child_path = collection.child_path(name);
                match self.broker.collection(&child_path) {
                    Ok(Some(child)) if child.id != collection.id => children.push(child),
                    Ok(Some(_)) => {
                        let report = ErrorReport::collection(
                            ErrorKind::ChildCollection,
                            format!("Child collection {} resolves to its own parent", name),
                            Some(collection.id),
                            child_path,
                        );
                        progress.error(&report.to_string(), None);
                        errors.push(report);
                    }
                    Ok(None) => {
                        let report = ErrorReport::collection(
                            ErrorKind::ChildCollection,
                            format!("Child collection not found: {}", name),
                            Some(collection.id),
                            child_path,
                        );
                        progress.error(&report.to_string(), None);
                        errors.push(report);
                    }
                    Err(e) => {
                        let report = ErrorReport::collection(
                            ErrorKind::ChildCollection,
                            format!("Error while loading child collection: {}", name),
                            Some(collection.id),
                            child_path,
                        )
                        .with_cause(&e);
                        progress.error(&report.to_string(), report.cause());
                        errors.push(report);
                    }
                }
            }
            // depth first, children in listing order
            pending.extend(children.into_iter().rev());
        }
        Ok(errors)
    }

    /// Number of document records, counted once.
    pub fn document_count(&mut self) -> usize {
        if let Some(count) = self.document_count {
            return count;
        }
        let count = self.broker.scan_documents(self.direct_access).count();
        self.document_count = Some(count);
        count
    }

    /// Scan every document record, then validate the readable XML documents
    /// in storage page order.
    pub fn check_documents(
        &mut self,
        progress: &mut dyn ProgressCallback,
        errors: &mut Vec<ErrorReport>,
    ) -> Result<()> {
        let total = self.document_count();
        let mut pending: Vec<DocumentRecord> = Vec::new();
        let mut current = 0;

        for scanned in self.broker.scan_documents(self.direct_access) {
            self.check_cancelled()?;
            current += 1;
            match scanned {
                Ok(doc) => {
                    progress.start_document(&doc.name, current, total);
                    if doc.kind == ResourceKind::Xml && !self.direct_access {
                        pending.push(doc);
                    }
                }
                Err(corrupt) => {
                    let report = ErrorReport::resource(
                        ErrorKind::ResourceAccessFailed,
                        corrupt.message,
                        Some(corrupt.id),
                    );
                    progress.error(&report.to_string(), None);
                    errors.push(report);
                }
            }
        }

        // validating in index order would jump between pages
        pending.sort_by_key(|doc| doc.first_node.page());
        debug!("Validating {} XML documents", pending.len());

        for doc in &pending {
            self.check_cancelled()?;
            let report = match self.check_document_permissions(doc) {
                Some(report) => Some(report),
                None if self.deep => self.check_xml_tree(doc),
                None => self.check_document(doc),
            };
            if let Some(report) = report {
                progress.error(&report.to_string(), report.cause());
                errors.push(report);
            }
        }
        Ok(())
    }

    /// Owner and group of a collection (and its ACL entries) must resolve.
    pub fn check_permissions(&self, collection: &CollectionRecord) -> Vec<ErrorReport> {
        let mut errors = Vec::new();
        let permission = &collection.permission;
        if !self.broker.account_exists(&permission.owner) {
            errors.push(ErrorReport::collection(
                ErrorKind::AccessFailed,
                format!("Owner account not found: {}", permission.owner),
                Some(collection.id),
                &collection.path,
            ));
        }
        if !self.broker.group_exists(&permission.group) {
            errors.push(ErrorReport::collection(
                ErrorKind::AccessFailed,
                format!("Owner group not found: {}", permission.group),
                Some(collection.id),
                &collection.path,
            ));
        }
        for ace in &permission.acl {
            let exists = match ace.target {
                crate::storage::AceTarget::User => self.broker.account_exists(&ace.who),
                crate::storage::AceTarget::Group => self.broker.group_exists(&ace.who),
            };
            if !exists {
                warn!("ACL of {} references unknown {}", collection.path, ace.who);
                errors.push(ErrorReport::collection(
                    ErrorKind::AccessFailed,
                    format!("ACL entry references unknown {} {}", ace.target.as_str(), ace.who),
                    Some(collection.id),
                    &collection.path,
                ));
            }
        }
        errors
    }

    pub fn check_document_permissions(&self, doc: &DocumentRecord) -> Option<ErrorReport> {
        let permission = &doc.permission;
        if !self.broker.account_exists(&permission.owner) {
            return Some(ErrorReport::resource(
                ErrorKind::AccessFailed,
                format!("Owner account of {} not found: {}", doc.name, permission.owner),
                Some(doc.id),
            ));
        }
        if !self.broker.group_exists(&permission.group) {
            return Some(ErrorReport::resource(
                ErrorKind::AccessFailed,
                format!("Owner group of {} not found: {}", doc.name, permission.group),
                Some(doc.id),
            ));
        }
        None
    }

    /// Cheap check: the document element can be loaded.
    pub fn check_document(&self, doc: &DocumentRecord) -> Option<ErrorReport> {
        match self.broker.root_element(doc) {
            Ok(Some(_)) => None,
            Ok(None) => Some(ErrorReport::resource(
                ErrorKind::ResourceAccessFailed,
                format!("Failed to access document data of {}", doc.name),
                Some(doc.id),
            )),
            Err(e) => Some(
                ErrorReport::resource(
                    ErrorKind::ResourceAccessFailed,
                    format!("Failed to access document data of {}", doc.name),
                    Some(doc.id),
                )
                .with_cause(e),
            ),
        }
    }

    /// Walk the whole node stream of a document and return the first
    /// structural error found.
    pub fn check_xml_tree(&self, doc: &DocumentRecord) -> Option<ErrorReport> {
        let stream = match self.broker.node_stream(doc) {
            Ok(stream) => stream,
            Err(e) => {
                return Some(
                    ErrorReport::resource(
                        ErrorKind::ResourceAccessFailed,
                        format!("Failed to open node stream of {}", doc.name),
                        Some(doc.id),
                    )
                    .with_cause(e),
                )
            }
        };

        let index_depth = self.broker.index_depth();
        let mut stack: Vec<ElementFrame> = Vec::new();
        let mut attributes_expected: Option<usize> = None;
        let mut attributes_seen = 0usize;
        let hierarchy = |message: String| ErrorReport::resource(ErrorKind::NodeHierarchy, message, Some(doc.id));

        for event in stream {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    return Some(
                        ErrorReport::resource(
                            ErrorKind::ResourceAccessFailed,
                            format!("Failed to read node stream of {}", doc.name),
                            Some(doc.id),
                        )
                        .with_cause(e),
                    )
                }
            };
            let is_attribute = matches!(event.data, NodeData::Attribute { .. });

            // the attribute run right after a start element is over
            if !is_attribute {
                if let Some(expected) = attributes_expected.take() {
                    if attributes_seen != expected {
                        return Some(ErrorReport::resource(
                            ErrorKind::IncorrectNodeType,
                            format!(
                                "Element {} declares {} attribute(s) but {} were found",
                                stack.last().map(|f| f.node_id.to_string()).unwrap_or_default(),
                                expected,
                                attributes_seen
                            ),
                            Some(doc.id),
                        ));
                    }
                }
            }

            if !event.is_end() {
                if let Some(parent) = stack.last_mut() {
                    parent.child_count += 1;
                    if !event.node_id.is_child_of(&parent.node_id) {
                        return Some(hierarchy(format!(
                            "Node {} is not a child of {}",
                            event.node_id, parent.node_id
                        )));
                    }
                    if let Some(previous) = &parent.previous_sibling {
                        if !(event.node_id.is_sibling_of(previous) && event.node_id > *previous) {
                            return Some(ErrorReport::resource(
                                ErrorKind::IncorrectNodeId,
                                format!(
                                    "Node {} is not a following sibling of {}",
                                    event.node_id, previous
                                ),
                                Some(doc.id),
                            ));
                        }
                    }
                    parent.previous_sibling = Some(event.node_id.clone());
                }
            }

            match &event.data {
                NodeData::Attribute { .. } => attributes_seen += 1,
                NodeData::EndElement { .. } => {
                    let frame = match stack.pop() {
                        Some(frame) => frame,
                        None => {
                            return Some(hierarchy(format!(
                                "End of element {} without a matching start",
                                event.node_id
                            )))
                        }
                    };
                    if frame.child_count != frame.declared_children {
                        return Some(hierarchy(format!(
                            "Element {} declares {} child(ren) but {} were found",
                            frame.node_id, frame.declared_children, frame.child_count
                        )));
                    }
                }
                NodeData::StartElement {
                    attribute_count,
                    child_count,
                    ..
                } => {
                    if event.node_id.level() <= index_depth {
                        match self.broker.node_address(doc.id, &event.node_id) {
                            Ok(Some(address)) if address == event.address => {}
                            Ok(Some(address)) => {
                                return Some(ErrorReport::index(
                                    ErrorKind::DomIndex,
                                    format!(
                                        "Index address {} of node {} does not match stream position {}",
                                        address, event.node_id, event.address
                                    ),
                                    doc.id,
                                ))
                            }
                            Ok(None) => {
                                return Some(ErrorReport::index(
                                    ErrorKind::DomIndex,
                                    format!("Node {} is missing from the address index", event.node_id),
                                    doc.id,
                                ))
                            }
                            Err(e) => {
                                return Some(
                                    ErrorReport::index(
                                        ErrorKind::DomIndex,
                                        format!("Failed to look up node {}", event.node_id),
                                        doc.id,
                                    )
                                    .with_cause(e),
                                )
                            }
                        }
                    }
                    if event.stored_kind != NodeKind::Element {
                        return Some(ErrorReport::resource(
                            ErrorKind::IncorrectNodeType,
                            format!(
                                "Start of element {} points to a stored {:?} node",
                                event.node_id, event.stored_kind
                            ),
                            Some(doc.id),
                        ));
                    }
                    stack.push(ElementFrame {
                        node_id: event.node_id.clone(),
                        declared_children: *child_count,
                        child_count: 0,
                        previous_sibling: None,
                    });
                    attributes_expected = Some(*attribute_count);
                    attributes_seen = 0;
                }
                _ => {}
            }
        }

        if let Some(expected) = attributes_expected {
            if attributes_seen != expected {
                return Some(ErrorReport::resource(
                    ErrorKind::IncorrectNodeType,
                    format!("Trailing element declares {} attribute(s) but {} were found", expected, attributes_seen),
                    Some(doc.id),
                ));
            }
        }
        if let Some(open) = stack.last() {
            return Some(hierarchy(format!(
                "Reached end of the node stream with element {} still open",
                open.node_id
            )));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::testing::RecordingProgress;
    use crate::storage::{MemoryStore, NodeId, StorageAddress};

    fn id(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    fn sample_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.create_collection("/db/data/nested").unwrap();
        store
            .put_xml("/db/data", "a.xml", r#"<root id="r"><item n="1">one</item><item n="2"/></root>"#)
            .unwrap();
        store
            .put_xml("/db/data/nested", "b.xml", "<b><!--c--><?pi data?><![CDATA[x]]></b>")
            .unwrap();
        store
            .put_binary("/db/data", "c.bin", b"\x00\x01", "application/octet-stream")
            .unwrap();
        store
    }

    fn doc(store: &MemoryStore, collection: &str, name: &str) -> DocumentRecord {
        store.document(collection, name).unwrap()
    }

    #[test]
    fn test_clean_store_has_no_errors() {
        let store = sample_store();
        let mut check = ConsistencyCheck::new(&store, false, true);
        let mut progress = RecordingProgress::default();
        let errors = check.check_all(&mut progress).unwrap();
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        assert_eq!(progress.collections, ["/db", "/db/data", "/db/data/nested"]);
        assert_eq!(progress.documents.len(), 3);
    }

    #[test]
    fn test_missing_child_collection_is_reported_and_walk_continues() {
        let mut store = sample_store();
        store.create_collection("/db/other").unwrap();
        store.delete_collection_record("/db/data").unwrap();

        let check = ConsistencyCheck::new(&store, false, false);
        let mut progress = RecordingProgress::default();
        let errors = check.check_collection_tree(&mut progress).unwrap();

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind(), ErrorKind::ChildCollection);
        assert!(errors[0].is_damaged_collection("/db/data"));
        assert!(progress.collections.contains(&"/db/other".to_string()));
    }

    #[test]
    fn test_unreadable_child_collection_is_reported() {
        let mut store = sample_store();
        store.corrupt_collection_record("/db/data/nested").unwrap();
        let check = ConsistencyCheck::new(&store, false, false);
        let errors = check
            .check_collection_tree(&mut RecordingProgress::default())
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_damaged_collection("/db/data/nested"));
        assert!(errors[0].cause().is_some());
    }

    #[test]
    fn test_unknown_owner_is_access_failure() {
        let mut store = sample_store();
        store.add_account("bob", "pw", &["staff"]);
        crate::storage::BrokerMut::set_collection_permission(
            &mut store,
            "/db/data",
            crate::storage::Permission::new("bob", "staff", 0o700),
        )
        .unwrap();
        store.remove_account("bob");

        let check = ConsistencyCheck::new(&store, false, false);
        let errors = check
            .check_collection_tree(&mut RecordingProgress::default())
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind(), ErrorKind::AccessFailed);
    }

    #[test]
    fn test_wrong_child_count_is_node_hierarchy() {
        let mut store = sample_store();
        store.corrupt_child_count("/db/data", "a.xml", &id("1"), 7).unwrap();
        let check = ConsistencyCheck::new(&store, false, true);
        let report = check.check_xml_tree(&doc(&store, "/db/data", "a.xml")).unwrap();
        assert_eq!(report.kind(), ErrorKind::NodeHierarchy);
        assert_eq!(report.document_id(), Some(doc(&store, "/db/data", "a.xml").id));
    }

    #[test]
    fn test_detached_root_is_resource_access_failure() {
        let mut store = sample_store();
        store.detach_root_element("/db/data", "a.xml").unwrap();
        let check = ConsistencyCheck::new(&store, false, false);
        let report = check.check_document(&doc(&store, "/db/data", "a.xml")).unwrap();
        assert_eq!(report.kind(), ErrorKind::ResourceAccessFailed);
    }

    #[test]
    fn test_wrong_index_address_is_dom_index() {
        let mut store = sample_store();
        store
            .corrupt_index_entry("/db/data", "a.xml", &id("1"), StorageAddress::new(999, 1))
            .unwrap();
        let check = ConsistencyCheck::new(&store, false, true);
        let report = check.check_xml_tree(&doc(&store, "/db/data", "a.xml")).unwrap();
        assert_eq!(report.kind(), ErrorKind::DomIndex);
        assert!(matches!(report, ErrorReport::Index(_)));
    }

    #[test]
    fn test_attribute_count_mismatch_is_node_type_error() {
        let mut store = sample_store();
        store
            .corrupt_attribute_count("/db/data", "a.xml", &id("1.2"), 3)
            .unwrap();
        let check = ConsistencyCheck::new(&store, false, true);
        let report = check.check_xml_tree(&doc(&store, "/db/data", "a.xml")).unwrap();
        assert_eq!(report.kind(), ErrorKind::IncorrectNodeType);
    }

    #[test]
    fn test_stored_kind_mismatch_is_node_type_error() {
        let mut store = sample_store();
        store
            .corrupt_node_type("/db/data", "a.xml", &id("1.2"), NodeKind::Text)
            .unwrap();
        let check = ConsistencyCheck::new(&store, false, true);
        let report = check.check_xml_tree(&doc(&store, "/db/data", "a.xml")).unwrap();
        assert_eq!(report.kind(), ErrorKind::IncorrectNodeType);
    }

    #[test]
    fn test_out_of_order_sibling_is_incorrect_node_id() {
        let mut store = sample_store();
        // stream: root, @id, item(1.2), @n, text, /item, item(1.3) ...
        store.corrupt_node_id("/db/data", "a.xml", 6, id("1.1")).unwrap();
        let check = ConsistencyCheck::new(&store, false, true);
        let report = check.check_xml_tree(&doc(&store, "/db/data", "a.xml")).unwrap();
        assert_eq!(report.kind(), ErrorKind::IncorrectNodeId);
    }

    #[test]
    fn test_foreign_node_is_node_hierarchy() {
        let mut store = sample_store();
        // the text node of the first item claims to belong to another element
        store.corrupt_node_id("/db/data", "a.xml", 4, id("1.5.1")).unwrap();
        let check = ConsistencyCheck::new(&store, false, true);
        let report = check.check_xml_tree(&doc(&store, "/db/data", "a.xml")).unwrap();
        assert_eq!(report.kind(), ErrorKind::NodeHierarchy);
    }

    #[test]
    fn test_check_documents_records_unreadable_records_and_continues() {
        let mut store = sample_store();
        store.corrupt_document_record("/db/data/nested", "b.xml").unwrap();
        store.corrupt_child_count("/db/data", "a.xml", &id("1"), 1).unwrap();

        let mut check = ConsistencyCheck::new(&store, false, true);
        let mut errors = Vec::new();
        check
            .check_documents(&mut RecordingProgress::default(), &mut errors)
            .unwrap();

        let kinds: Vec<ErrorKind> = errors.iter().map(ErrorReport::kind).collect();
        assert_eq!(kinds, [ErrorKind::ResourceAccessFailed, ErrorKind::NodeHierarchy]);
        assert_eq!(check.document_count(), 3);
    }

    #[test]
    fn test_zero_index_depth_is_configuration_failure() {
        let mut store = sample_store();
        store.set_index_depth(0);
        let mut check = ConsistencyCheck::new(&store, false, true);
        let errors = check.check_all(&mut RecordingProgress::default()).unwrap();
        assert_eq!(errors.len(), 1, "{:?}", errors);
        assert_eq!(errors[0].kind(), ErrorKind::ConfigurationFailure);
        assert!(!errors[0].is_damaged_collection(ROOT_COLLECTION));

        // the cheap check never reads the index
        let mut shallow = ConsistencyCheck::new(&store, false, false);
        assert!(shallow.check_all(&mut RecordingProgress::default()).unwrap().is_empty());
    }

    #[test]
    fn test_cancellation_terminates_check() {
        let store = sample_store();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut check = ConsistencyCheck::new(&store, false, true).with_cancel(cancel);
        let result = check.check_all(&mut RecordingProgress::default());
        assert!(matches!(result, Err(BackupError::Terminated)));
    }
}
