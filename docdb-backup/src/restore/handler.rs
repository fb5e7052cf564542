//! Replays one collection manifest into the store.

use super::RestoreListener;
use crate::descriptor::BackupDescriptor;
use crate::manifest::{
    parse_date, parse_mode, Attributes, DeletedKind, ManifestEvent, ManifestReader, BLOB_STORE_VERSION,
    FORMAT_VERSION,
};
use crate::storage::{
    child_path, is_within, Ace, BrokerMut, DocType, NewDocument, Permission, ResourceKind, DBA_GROUP,
    REALM_NAME, ROOT_COLLECTION, SECURITY_COLLECTION, SYSTEM_ACCOUNT, SYSTEM_COLLECTION,
};
use crate::utils::encode::decode;
use crate::utils::errors::{BackupError, Result};
use chrono::Utc;
use std::collections::HashSet;
use std::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_MODE: u32 = 0o644;

/// Shared state of a restore run.
pub(crate) struct RestoreContext<'r> {
    pub broker: &'r mut dyn BrokerMut,
    pub listener: &'r mut dyn RestoreListener,
    /// Symbolic paths of subcollections that must not be restored
    pub paths_to_ignore: &'r HashSet<String>,
    pub cancel: &'r CancellationToken,
}

/// Permission to apply once an entry's element closes, so that ACL entries
/// nested in the element can be attached first.
#[derive(Debug)]
enum DeferredPermission {
    Skipped,
    Collection {
        path: String,
        permission: Permission,
    },
    Resource {
        collection: String,
        name: String,
        permission: Permission,
    },
}

impl DeferredPermission {
    fn add_ace(&mut self, ace: Ace) {
        match self {
            DeferredPermission::Skipped => {}
            DeferredPermission::Collection { permission, .. }
            | DeferredPermission::Resource { permission, .. } => permission.acl.push(ace),
        }
    }

    fn apply(self, broker: &mut dyn BrokerMut) -> std::result::Result<(), String> {
        match self {
            DeferredPermission::Skipped => Ok(()),
            DeferredPermission::Collection { path, permission } => broker
                .set_collection_permission(&path, permission)
                .map_err(|e| format!("Failed to set permissions on: '{}': {}", path, e)),
            DeferredPermission::Resource {
                collection,
                name,
                permission,
            } => broker
                .set_document_permission(&collection, &name, permission)
                .map_err(|e| {
                    format!(
                        "Failed to set permissions on: '{}': {}",
                        child_path(&collection, &name),
                        e
                    )
                }),
        }
    }
}

/// Percent-encode a name from a manifest written before names were stored
/// as strict URIs.
fn encode_legacy_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' | b'%' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Subcollections restored ahead of everything else, which the regular
/// walk must leave alone.
fn is_priority_child(current: &str, name: &str) -> bool {
    let realm = child_path(SECURITY_COLLECTION, REALM_NAME);
    (current == ROOT_COLLECTION && name == "system")
        || (current == SYSTEM_COLLECTION && name == "security")
        || (current == realm && name == "groups")
}

/// Processes the events of one manifest.
struct ManifestHandler<'h, 'r> {
    ctx: &'h mut RestoreContext<'r>,
    descriptor: &'h dyn BackupDescriptor,
    version: u32,
    deduplicate_blobs: bool,
    current: Option<String>,
    deferred: Vec<DeferredPermission>,
    children: Vec<Box<dyn BackupDescriptor>>,
}

/// Restore the collection described by `descriptor`. Returns the
/// descriptors of its subcollections, in manifest order, for the caller to
/// process next.
pub(crate) fn restore_descriptor(
    ctx: &mut RestoreContext<'_>,
    descriptor: &dyn BackupDescriptor,
) -> Result<Vec<Box<dyn BackupDescriptor>>> {
    ctx.listener.processing_descriptor(&descriptor.symbolic_path());
    let reader = ManifestReader::new(BufReader::new(descriptor.contents()?), descriptor.symbolic_path());
    let mut handler = ManifestHandler {
        ctx,
        descriptor,
        version: 0,
        deduplicate_blobs: false,
        current: None,
        deferred: Vec::new(),
        children: Vec::new(),
    };
    for event in reader {
        handler.handle(event?)?;
    }
    Ok(handler.children)
}

impl ManifestHandler<'_, '_> {
    fn handle(&mut self, event: ManifestEvent) -> Result<()> {
        if self.ctx.cancel.is_cancelled() {
            return Err(BackupError::Terminated);
        }
        match event {
            ManifestEvent::Collection(attrs) => {
                let deferred = self.restore_collection(&attrs)?;
                self.deferred.push(deferred);
            }
            ManifestEvent::Resource(attrs) => {
                let deferred = self.restore_resource(&attrs)?;
                self.deferred.push(deferred);
            }
            ManifestEvent::Ace(attrs) => self.add_ace(&attrs),
            ManifestEvent::Subcollection(attrs) => self.restore_subcollection(&attrs)?,
            ManifestEvent::Deleted(attrs) => self.restore_deleted(&attrs),
            ManifestEvent::EndCollection | ManifestEvent::EndResource => self.apply_deferred(),
        }
        Ok(())
    }

    fn name_from_manifest(&self, name: &str) -> String {
        if self.version >= FORMAT_VERSION {
            name.to_string()
        } else {
            encode_legacy_name(name)
        }
    }

    /// Owner, group and mode of an entry. Entries below the system
    /// collection always belong to SYSTEM.
    fn permission(&mut self, attrs: &Attributes, path: &str) -> Permission {
        let mode = match attrs.get("mode") {
            Some(mode) => parse_mode(mode).unwrap_or_else(|| {
                self.ctx
                    .listener
                    .warn(&format!("Invalid mode '{}' for {}, using {:o}", mode, path, DEFAULT_MODE));
                DEFAULT_MODE
            }),
            None => DEFAULT_MODE,
        };
        if is_within(path, SYSTEM_COLLECTION) {
            return Permission::new(SYSTEM_ACCOUNT, DBA_GROUP, mode);
        }
        Permission::new(
            attrs.get("owner").unwrap_or(SYSTEM_ACCOUNT),
            attrs.get("group").unwrap_or(DBA_GROUP),
            mode,
        )
    }

    fn restore_collection(&mut self, attrs: &Attributes) -> Result<DeferredPermission> {
        if attrs.flag("skip") {
            return Ok(DeferredPermission::Skipped);
        }
        let name = attrs.get("name").ok_or_else(|| {
            BackupError::manifest(self.descriptor.symbolic_path(), "collection requires a name attribute")
        })?;

        if let Some(version) = attrs.get("version") {
            self.version = version.trim().parse().unwrap_or_else(|_| {
                self.ctx.listener.warn(&format!(
                    "Could not parse version number for Collection '{}', defaulting to version 0",
                    name
                ));
                0
            });
        }
        self.deduplicate_blobs = self.version >= BLOB_STORE_VERSION && attrs.flag("deduplicate-blobs");

        self.ctx.listener.created_collection(name);
        let path = self.name_from_manifest(name);

        if self.ctx.broker.collection(&path)?.is_none() {
            let created = match attrs.get("created").and_then(parse_date) {
                Some(created) => created,
                None => {
                    self.ctx.listener.error(&format!(
                        "Could not parse created date '{}' from backup for: '{}', using current time!",
                        attrs.get("created").unwrap_or_default(),
                        name
                    ));
                    Utc::now()
                }
            };
            self.ctx.broker.get_or_create_collection(&path, created).map_err(|e| {
                self.ctx.listener.warn(&format!(
                    "An unrecoverable error occurred while restoring collection '{}': {}",
                    name, e
                ));
                BackupError::from(e)
            })?;
        }

        let permission = self.permission(attrs, &path);
        self.current = Some(path.clone());
        Ok(DeferredPermission::Collection { path, permission })
    }

    fn restore_resource(&mut self, attrs: &Attributes) -> Result<DeferredPermission> {
        if attrs.flag("skip") {
            return Ok(DeferredPermission::Skipped);
        }
        // an entry without a name is stored under its unescaped member name
        let (name, filename) = match (attrs.get("name"), attrs.get("filename")) {
            (Some(name), filename) => (name.to_string(), filename.unwrap_or(name)),
            (None, Some(filename)) => (decode(filename), filename),
            (None, None) => {
                return Err(BackupError::manifest(
                    self.descriptor.symbolic_path(),
                    "resource requires a name or filename attribute",
                ))
            }
        };
        let name = name.as_str();
        let collection = self.current.clone().ok_or_else(|| {
            BackupError::manifest(self.descriptor.symbolic_path(), "resource outside of a collection")
        })?;

        let kind = attrs
            .get("type")
            .and_then(ResourceKind::from_manifest_type)
            .unwrap_or(ResourceKind::Binary);
        let doc_name = self.name_from_manifest(name);

        let mut content = if self.deduplicate_blobs && kind == ResourceKind::Binary {
            let blob_id = attrs.get("blob-id").unwrap_or_default();
            match self.descriptor.blob(blob_id)? {
                Some(content) => content,
                None => {
                    self.ctx.listener.warn(&format!(
                        "Failed to restore resource '{}' from blob '{}'. Reason: blob not found",
                        name, blob_id
                    ));
                    return Ok(DeferredPermission::Skipped);
                }
            }
        } else {
            match self.descriptor.member(filename)? {
                Some(content) => content,
                None => {
                    self.ctx.listener.warn(&format!(
                        "Failed to restore resource '{}' from file '{}'. Reason: file not found",
                        name,
                        self.descriptor.symbolic_member_path(filename)
                    ));
                    return Ok(DeferredPermission::Skipped);
                }
            }
        };

        let mime_type = match attrs.get("mimetype").map(str::trim).filter(|m| !m.is_empty()) {
            Some(mime_type) => mime_type.to_string(),
            None => {
                let mime_type = kind.default_mime_type();
                self.ctx.listener.warn(&format!(
                    "Missing mimetype attribute in the backup manifest for: {}, assuming: {}",
                    name, mime_type
                ));
                mime_type.to_string()
            }
        };

        let created = match attrs.get("created") {
            Some(value) => parse_date(value).or_else(|| {
                self.ctx.listener.warn("Illegal creation date. Ignoring date...");
                None
            }),
            None => None,
        };
        let modified = match attrs.get("modified") {
            Some(value) => parse_date(value).or_else(|| {
                self.ctx.listener.warn("Illegal modification date. Ignoring date...");
                None
            }),
            None => None,
        };

        let public_id = attrs.get("publicid").map(str::to_string);
        let system_id = attrs.get("systemid").map(str::to_string);
        let doctype = if public_id.is_some() || system_id.is_some() {
            Some(DocType {
                name: attrs.get("namedoctype").unwrap_or_default().to_string(),
                public_id,
                system_id,
            })
        } else {
            None
        };

        let document = NewDocument {
            kind,
            mime_type,
            created,
            modified,
            doctype,
        };
        if let Err(e) = self
            .ctx
            .broker
            .store_document(&collection, &doc_name, &mut content, document)
        {
            self.ctx.listener.warn(&format!(
                "Failed to restore resource '{}' from file '{}'. Reason: {}",
                name,
                self.descriptor.symbolic_member_path(filename),
                e
            ));
            return Ok(DeferredPermission::Skipped);
        }

        let permission = self.permission(attrs, &collection);
        self.ctx.listener.restored_resource(name);
        Ok(DeferredPermission::Resource {
            collection,
            name: doc_name,
            permission,
        })
    }

    fn restore_subcollection(&mut self, attrs: &Attributes) -> Result<()> {
        let name = match attrs.get("filename").or_else(|| attrs.get("name")) {
            Some(name) => name,
            None => return Ok(()),
        };
        if let Some(current) = &self.current {
            if is_priority_child(current, name) {
                return Ok(());
            }
        }

        let child = match self.descriptor.child(name) {
            Ok(Some(child)) => child,
            Ok(None) => {
                self.ctx.listener.error(&format!(
                    "Collection {} does not exist or is not readable.",
                    self.descriptor.symbolic_member_path(name)
                ));
                return Ok(());
            }
            Err(e) => {
                self.ctx.listener.error(&format!(
                    "Could not read sub-collection {}: {}",
                    self.descriptor.symbolic_member_path(name),
                    e
                ));
                return Ok(());
            }
        };

        if self.ctx.paths_to_ignore.contains(&child.symbolic_path()) {
            self.ctx.listener.skip_resources(
                &format!(
                    "Skipping app path {}. Newer version is already installed.",
                    child.symbolic_path()
                ),
                child.number_of_resources(),
            );
            return Ok(());
        }
        self.children.push(child);
        Ok(())
    }

    fn restore_deleted(&mut self, attrs: &Attributes) {
        let current = match &self.current {
            Some(current) => current.clone(),
            None => return,
        };
        let (name, kind) = match (attrs.get("name"), attrs.get("type").and_then(DeletedKind::parse)) {
            (Some(name), Some(kind)) => (name, kind),
            _ => return,
        };
        match kind {
            DeletedKind::Collection => {
                let path = child_path(&current, name);
                match self.ctx.broker.remove_collection(&path) {
                    Ok(removed) => debug!("Deleted collection {} (present: {})", path, removed),
                    Err(e) => self
                        .ctx
                        .listener
                        .warn(&format!("Failed to remove deleted collection: {}: {}", name, e)),
                }
            }
            DeletedKind::Resource => match self.ctx.broker.remove_document(&current, name) {
                Ok(removed) => debug!("Deleted resource {} in {} (present: {})", name, current, removed),
                Err(e) => self
                    .ctx
                    .listener
                    .warn(&format!("Failed to remove deleted resource: {}: {}", name, e)),
            },
        }
    }

    fn add_ace(&mut self, attrs: &Attributes) {
        let ace = (|| -> std::result::Result<Ace, String> {
            Ok(Ace {
                target: attrs.get("target").unwrap_or_default().parse()?,
                who: attrs.get("who").ok_or("missing who")?.to_string(),
                access_type: attrs.get("access_type").unwrap_or_default().parse()?,
                mode: attrs
                    .get("mode")
                    .and_then(parse_mode)
                    .ok_or("invalid mode")?,
            })
        })();
        match (ace, self.deferred.last_mut()) {
            (Ok(ace), Some(deferred)) => deferred.add_ace(ace),
            (Ok(_), None) => {}
            (Err(e), _) => self
                .ctx
                .listener
                .warn(&format!("Ignoring ACL entry in {}: {}", self.descriptor.symbolic_path(), e)),
        }
    }

    fn apply_deferred(&mut self) {
        if let Some(deferred) = self.deferred.pop() {
            if let Err(message) = deferred.apply(self.ctx.broker) {
                self.ctx.listener.warn(&message);
            }
        }
    }
}
