//! Records exchanged with the storage engine.

use super::node::StorageAddress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const SYSTEM_ACCOUNT: &str = "SYSTEM";
pub const ADMIN_ACCOUNT: &str = "admin";
pub const GUEST_ACCOUNT: &str = "guest";
pub const DBA_GROUP: &str = "dba";
pub const GUEST_GROUP: &str = "guest";

pub const ROOT_COLLECTION: &str = "/db";
pub const SYSTEM_COLLECTION: &str = "/db/system";
pub const TEMP_COLLECTION: &str = "/db/system/temp";
pub const SECURITY_COLLECTION: &str = "/db/system/security";
/// Name of the built-in security realm below the security collection
pub const REALM_NAME: &str = "docdb";
pub const APPS_COLLECTION: &str = "/db/apps";
pub const LOST_AND_FOUND_COLLECTION: &str = "/db/__lost_and_found__";
pub const LOST_AND_FOUND_NAME: &str = "__lost_and_found__";

/// Join a collection path and a child name.
pub fn child_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Last path segment of a collection path.
pub fn last_segment(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

pub fn parent_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => None,
        Some(pos) => Some(&trimmed[..pos]),
    }
}

/// `path` equals `ancestor` or lies below it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionId(pub u32);

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub u32);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AceTarget {
    User,
    Group,
}

impl AceTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            AceTarget::User => "USER",
            AceTarget::Group => "GROUP",
        }
    }
}

impl FromStr for AceTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" => Ok(AceTarget::User),
            "GROUP" => Ok(AceTarget::Group),
            other => Err(format!("unknown ACE target: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessType {
    Allowed,
    Denied,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessType::Allowed => "ALLOWED",
            AccessType::Denied => "DENIED",
        }
    }
}

impl FromStr for AccessType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ALLOWED" => Ok(AccessType::Allowed),
            "DENIED" => Ok(AccessType::Denied),
            other => Err(format!("unknown ACE access type: {}", other)),
        }
    }
}

/// Access control entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ace {
    pub target: AceTarget,
    pub who: String,
    pub access_type: AccessType,
    pub mode: u32,
}

/// Unix-style ownership and mode plus an optional access control list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub owner: String,
    pub group: String,
    pub mode: u32,
    #[serde(default)]
    pub acl: Vec<Ace>,
}

impl Permission {
    pub fn new(owner: impl Into<String>, group: impl Into<String>, mode: u32) -> Self {
        Self {
            owner: owner.into(),
            group: group.into(),
            mode,
            acl: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub id: CollectionId,
    /// Absolute path, e.g. `/db/apps/demo`
    pub path: String,
    pub created: DateTime<Utc>,
    pub permission: Permission,
    /// Child collection names in listing order
    pub children: Vec<String>,
}

impl CollectionRecord {
    pub fn name(&self) -> &str {
        last_segment(&self.path)
    }

    pub fn child_path(&self, name: &str) -> String {
        child_path(&self.path, name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Xml,
    Binary,
}

impl ResourceKind {
    /// Value of the manifest `type` attribute
    pub fn manifest_type(&self) -> &'static str {
        match self {
            ResourceKind::Xml => "XMLResource",
            ResourceKind::Binary => "BinaryResource",
        }
    }

    pub fn from_manifest_type(value: &str) -> Option<Self> {
        match value {
            "XMLResource" => Some(ResourceKind::Xml),
            "BinaryResource" => Some(ResourceKind::Binary),
            _ => None,
        }
    }

    pub fn default_mime_type(&self) -> &'static str {
        match self {
            ResourceKind::Xml => "application/xml",
            ResourceKind::Binary => "application/octet-stream",
        }
    }
}

/// Document type declaration of an XML resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocType {
    pub name: String,
    pub public_id: Option<String>,
    pub system_id: Option<String>,
}

impl DocType {
    /// Parse the body of a `<!DOCTYPE ...>` declaration. Internal subsets
    /// are ignored.
    pub fn parse(body: &str) -> Option<DocType> {
        let body = body.trim();
        let body = match body.find('[') {
            Some(pos) => &body[..pos],
            None => body,
        };
        let mut rest = body.trim_start();
        let name_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let name = rest[..name_end].to_string();
        if name.is_empty() {
            return None;
        }
        rest = rest[name_end..].trim_start();

        let mut literals = Vec::new();
        let keyword_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let keyword = &rest[..keyword_end];
        rest = rest[keyword_end..].trim_start();
        while let Some(quote) = rest.chars().next().filter(|c| *c == '"' || *c == '\'') {
            let inner = &rest[1..];
            let end = inner.find(quote)?;
            literals.push(inner[..end].to_string());
            rest = inner[end + 1..].trim_start();
        }

        let (public_id, system_id) = match (keyword, literals.len()) {
            ("PUBLIC", 2) => (Some(literals[0].clone()), Some(literals[1].clone())),
            ("PUBLIC", 1) => (Some(literals[0].clone()), None),
            ("SYSTEM", 1) => (None, Some(literals[0].clone())),
            _ => (None, None),
        };
        Some(DocType {
            name,
            public_id,
            system_id,
        })
    }

    /// Body of the declaration as written after `<!DOCTYPE `.
    pub fn declaration(&self) -> String {
        match (&self.public_id, &self.system_id) {
            (Some(public), Some(system)) => {
                format!("{} PUBLIC \"{}\" \"{}\"", self.name, public, system)
            }
            (Some(public), None) => format!("{} PUBLIC \"{}\"", self.name, public),
            (None, Some(system)) => format!("{} SYSTEM \"{}\"", self.name, system),
            (None, None) => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub mime_type: String,
    #[serde(default)]
    pub doctype: Option<DocType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub collection_id: CollectionId,
    pub name: String,
    pub kind: ResourceKind,
    pub permission: Permission,
    pub metadata: DocumentMetadata,
    /// Address of the first persisted node (XML) or content page (binary)
    pub first_node: StorageAddress,
    /// Content digest for binary resources
    pub blob_id: Option<String>,
    pub size: u64,
}

/// Metadata for a document being stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDocument {
    pub kind: ResourceKind,
    pub mime_type: String,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub doctype: Option<DocType>,
}

impl NewDocument {
    pub fn xml() -> Self {
        Self {
            kind: ResourceKind::Xml,
            mime_type: ResourceKind::Xml.default_mime_type().to_string(),
            created: None,
            modified: None,
            doctype: None,
        }
    }

    pub fn binary(mime_type: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Binary,
            mime_type: mime_type.into(),
            created: None,
            modified: None,
            doctype: None,
        }
    }
}

/// A document record the failsafe scan could not decode.
#[derive(Debug, Clone, PartialEq)]
pub struct CorruptDocument {
    pub id: DocumentId,
    pub message: String,
}

/// A collection record the failsafe scan could not decode.
#[derive(Debug, Clone, PartialEq)]
pub struct CorruptCollection {
    pub path: String,
    pub message: String,
}

/// Application package installed in the live database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledPackage {
    /// Collection the package is installed into, e.g. `/db/apps/demo`
    pub path: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(child_path("/db", "apps"), "/db/apps");
        assert_eq!(last_segment("/db/apps/demo"), "demo");
        assert_eq!(parent_path("/db/apps/demo"), Some("/db/apps"));
        assert_eq!(parent_path("/db"), None);
        assert!(is_within("/db/system/temp/x", TEMP_COLLECTION));
        assert!(is_within(TEMP_COLLECTION, TEMP_COLLECTION));
        assert!(!is_within("/db/system/temporary", TEMP_COLLECTION));
    }

    #[test]
    fn test_doctype_parse_and_render() {
        let doctype = DocType::parse(
            r#" html PUBLIC "-//W3C//DTD XHTML 1.0 Strict//EN" "xhtml1-strict.dtd""#,
        )
        .unwrap();
        assert_eq!(doctype.name, "html");
        assert_eq!(
            doctype.public_id.as_deref(),
            Some("-//W3C//DTD XHTML 1.0 Strict//EN")
        );
        assert_eq!(doctype.system_id.as_deref(), Some("xhtml1-strict.dtd"));
        assert_eq!(DocType::parse(&doctype.declaration()), Some(doctype));

        let system = DocType::parse("note SYSTEM 'note.dtd'").unwrap();
        assert_eq!(system.public_id, None);
        assert_eq!(system.system_id.as_deref(), Some("note.dtd"));
        assert_eq!(DocType::parse("   "), None);
    }
}
