//! Node identifiers, storage addresses and the persisted node event stream.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Dynamic level number of a node, e.g. `1.3.2`.
///
/// The document element is `1`; its attributes and children are numbered
/// `1.1`, `1.2`, ... in document order. The derived ordering is document
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Vec<u32>);

impl NodeId {
    /// Identifier of the `n`-th top-level node (1-based).
    pub fn top(n: u32) -> Self {
        NodeId(vec![n])
    }

    pub fn level(&self) -> usize {
        self.0.len()
    }

    pub fn parent(&self) -> Option<NodeId> {
        if self.0.len() > 1 {
            Some(NodeId(self.0[..self.0.len() - 1].to_vec()))
        } else {
            None
        }
    }

    /// The `n`-th child (1-based).
    pub fn child(&self, n: u32) -> NodeId {
        let mut levels = self.0.clone();
        levels.push(n);
        NodeId(levels)
    }

    pub fn is_child_of(&self, parent: &NodeId) -> bool {
        self.0.len() == parent.0.len() + 1 && self.0.starts_with(&parent.0)
    }

    pub fn is_sibling_of(&self, other: &NodeId) -> bool {
        let len = self.0.len();
        self != other && len == other.0.len() && self.0[..len - 1] == other.0[..len - 1]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, level) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", level)?;
        }
        Ok(())
    }
}

impl FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let levels = s
            .split('.')
            .map(|part| match part.parse::<u32>() {
                Ok(0) | Err(_) => Err(format!("invalid node id: {}", s)),
                Ok(n) => Ok(n),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(NodeId(levels))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Physical location of a node: storage page in the high bits, offset in
/// the low 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageAddress(pub u64);

impl StorageAddress {
    pub fn new(page: u32, offset: u16) -> Self {
        StorageAddress(((page as u64) << 16) | offset as u64)
    }

    pub fn page(&self) -> u32 {
        (self.0 >> 16) as u32
    }

    pub fn offset(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl fmt::Display for StorageAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page(), self.offset())
    }
}

/// Node type as recorded in the persisted node header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Element,
    Attribute,
    Text,
    CData,
    Comment,
    ProcessingInstruction,
}

/// Payload of one event in a document's node stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NodeData {
    StartElement {
        name: String,
        /// Attribute count from the element header
        attribute_count: usize,
        /// Child count (attributes included) from the element header
        child_count: usize,
    },
    EndElement {
        name: String,
    },
    Attribute {
        name: String,
        value: String,
    },
    Text {
        text: String,
    },
    CData {
        text: String,
    },
    Comment {
        text: String,
    },
    ProcessingInstruction {
        target: String,
        data: String,
    },
}

/// One event of the persisted node stream. End events carry the id and
/// address of the element they close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub node_id: NodeId,
    pub address: StorageAddress,
    pub stored_kind: NodeKind,
    #[serde(flatten)]
    pub data: NodeData,
}

impl NodeEvent {
    pub fn is_end(&self) -> bool {
        matches!(self.data, NodeData::EndElement { .. })
    }
}
