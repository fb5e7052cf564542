//! Structured error reports produced by the consistency check.

use crate::storage::{CollectionId, DocumentId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of damage detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    IncorrectNodeId,
    IncorrectNodeType,
    NodeHierarchy,
    AccessFailed,
    ChildCollection,
    ResourceAccessFailed,
    DomIndex,
    ConfigurationFailure,
}

impl ErrorKind {
    pub fn code(&self) -> u8 {
        match self {
            ErrorKind::IncorrectNodeId => 0,
            ErrorKind::IncorrectNodeType => 1,
            ErrorKind::NodeHierarchy => 2,
            ErrorKind::AccessFailed => 3,
            ErrorKind::ChildCollection => 4,
            ErrorKind::ResourceAccessFailed => 5,
            ErrorKind::DomIndex => 6,
            ErrorKind::ConfigurationFailure => 7,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::IncorrectNodeId => "Incorrect node id: node is not a sibling of the previous node or out of order",
            ErrorKind::IncorrectNodeType => "Node type or attribute count does not match the stored header",
            ErrorKind::NodeHierarchy => "Node hierarchy is broken: wrong parent or child count",
            ErrorKind::AccessFailed => "Access to the stored permissions failed",
            ErrorKind::ChildCollection => "Child collection is missing or cannot be loaded",
            ErrorKind::ResourceAccessFailed => "Document data cannot be read",
            ErrorKind::DomIndex => "Node address index does not match the node stream",
            ErrorKind::ConfigurationFailure => "Configuration could not be read",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::IncorrectNodeId => "INCORRECT_NODE_ID",
            ErrorKind::IncorrectNodeType => "INCORRECT_NODE_TYPE",
            ErrorKind::NodeHierarchy => "NODE_HIERARCHY",
            ErrorKind::AccessFailed => "ACCESS_FAILED",
            ErrorKind::ChildCollection => "CHILD_COLLECTION",
            ErrorKind::ResourceAccessFailed => "RESOURCE_ACCESS_FAILED",
            ErrorKind::DomIndex => "DOM_INDEX",
            ErrorKind::ConfigurationFailure => "CONFIGURATION_FAILURE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionError {
    pub kind: ErrorKind,
    pub message: String,
    pub cause: Option<String>,
    pub collection_id: Option<CollectionId>,
    pub collection_uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceError {
    pub kind: ErrorKind,
    pub message: String,
    pub cause: Option<String>,
    pub document_id: Option<DocumentId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexError {
    pub kind: ErrorKind,
    pub message: String,
    pub cause: Option<String>,
    pub document_id: DocumentId,
}

/// One recorded problem. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ErrorReport {
    Collection(CollectionError),
    Resource(ResourceError),
    Index(IndexError),
}

impl ErrorReport {
    pub fn collection(
        kind: ErrorKind,
        message: impl Into<String>,
        collection_id: Option<CollectionId>,
        collection_uri: impl Into<String>,
    ) -> Self {
        ErrorReport::Collection(CollectionError {
            kind,
            message: message.into(),
            cause: None,
            collection_id,
            collection_uri: collection_uri.into(),
        })
    }

    pub fn resource(kind: ErrorKind, message: impl Into<String>, document_id: Option<DocumentId>) -> Self {
        ErrorReport::Resource(ResourceError {
            kind,
            message: message.into(),
            cause: None,
            document_id,
        })
    }

    pub fn index(kind: ErrorKind, message: impl Into<String>, document_id: DocumentId) -> Self {
        ErrorReport::Index(IndexError {
            kind,
            message: message.into(),
            cause: None,
            document_id,
        })
    }

    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        let cause = Some(cause.to_string());
        match &mut self {
            ErrorReport::Collection(e) => e.cause = cause,
            ErrorReport::Resource(e) => e.cause = cause,
            ErrorReport::Index(e) => e.cause = cause,
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorReport::Collection(e) => e.kind,
            ErrorReport::Resource(e) => e.kind,
            ErrorReport::Index(e) => e.kind,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ErrorReport::Collection(e) => &e.message,
            ErrorReport::Resource(e) => &e.message,
            ErrorReport::Index(e) => &e.message,
        }
    }

    pub fn cause(&self) -> Option<&str> {
        match self {
            ErrorReport::Collection(e) => e.cause.as_deref(),
            ErrorReport::Resource(e) => e.cause.as_deref(),
            ErrorReport::Index(e) => e.cause.as_deref(),
        }
    }

    pub fn document_id(&self) -> Option<DocumentId> {
        match self {
            ErrorReport::Collection(_) => None,
            ErrorReport::Resource(e) => e.document_id,
            ErrorReport::Index(e) => Some(e.document_id),
        }
    }

    /// The document has been found unreadable and must not be exported.
    pub fn is_damaged_document(&self, id: DocumentId) -> bool {
        matches!(self, ErrorReport::Resource(e)
            if e.kind == ErrorKind::ResourceAccessFailed && e.document_id == Some(id))
    }

    /// The child collection at `path` has been reported missing or unloadable.
    pub fn is_damaged_collection(&self, path: &str) -> bool {
        matches!(self, ErrorReport::Collection(e)
            if e.kind == ErrorKind::ChildCollection && e.collection_uri == path)
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorReport::Collection(e) => {
                write!(f, "{}: {} (collection {}", e.kind, e.message, e.collection_uri)?;
                if let Some(id) = e.collection_id {
                    write!(f, ", id {}", id)?;
                }
                f.write_str(")")?;
            }
            ErrorReport::Resource(e) => {
                write!(f, "{}: {}", e.kind, e.message)?;
                if let Some(id) = e.document_id {
                    write!(f, " (document {})", id)?;
                }
            }
            ErrorReport::Index(e) => {
                write!(f, "{}: {} (document {})", e.kind, e.message, e.document_id)?;
            }
        }
        if let Some(cause) = self.cause() {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_damage_lookups() {
        let damaged = ErrorReport::resource(
            ErrorKind::ResourceAccessFailed,
            "unreadable",
            Some(DocumentId(7)),
        );
        assert!(damaged.is_damaged_document(DocumentId(7)));
        assert!(!damaged.is_damaged_document(DocumentId(8)));

        let hierarchy = ErrorReport::resource(ErrorKind::NodeHierarchy, "bad", Some(DocumentId(7)));
        assert!(!hierarchy.is_damaged_document(DocumentId(7)));

        let child = ErrorReport::collection(ErrorKind::ChildCollection, "missing", None, "/db/a");
        assert!(child.is_damaged_collection("/db/a"));
        assert!(!child.is_damaged_collection("/db/b"));
    }

    #[test]
    fn test_report_display_and_json() {
        let report = ErrorReport::index(ErrorKind::DomIndex, "address mismatch", DocumentId(3))
            .with_cause("lookup returned 4:2");
        assert_eq!(
            report.to_string(),
            "DOM_INDEX: address mismatch (document 3): lookup returned 4:2"
        );

        let json = serde_json::to_string(&report).unwrap();
        let back: ErrorReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
        assert_eq!(back.kind().code(), 6);
    }
}
