//! Parse XML content into persisted node records.

use super::model::DocType;
use super::node::{NodeData, NodeEvent, NodeId, NodeKind, StorageAddress};
use super::{StorageError, StorageResult};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::BTreeMap;

/// Node records of one parsed document.
#[derive(Debug)]
pub(crate) struct ParsedDocument {
    pub nodes: Vec<NodeEvent>,
    pub index: BTreeMap<NodeId, StorageAddress>,
    pub doctype: Option<DocType>,
    /// First page not used by this document
    pub next_page: u32,
}

/// An element whose end tag has not been seen yet.
struct OpenElement {
    node_id: NodeId,
    address: StorageAddress,
    start_index: usize,
    next_child: u32,
    attributes: usize,
    children: usize,
}

/// Hands out consecutive addresses starting at a fresh page.
struct Allocator {
    page: u32,
    offset: u16,
}

impl Allocator {
    fn next(&mut self) -> StorageAddress {
        if self.offset == u16::MAX {
            self.page += 1;
            self.offset = 0;
        }
        let address = StorageAddress::new(self.page, self.offset);
        self.offset += 1;
        address
    }
}

fn parse_error(err: impl std::fmt::Display) -> StorageError {
    StorageError::Parse(err.to_string())
}

/// Parse `content` into node records placed from `first_page` onward.
/// Elements at or above `index_depth` are entered into the address index.
pub(crate) fn parse_document(
    content: &[u8],
    first_page: u32,
    index_depth: usize,
) -> StorageResult<ParsedDocument> {
    let mut reader = Reader::from_reader(content);
    reader.trim_text(false);
    reader.expand_empty_elements(true);

    let mut alloc = Allocator {
        page: first_page,
        offset: 0,
    };
    let mut nodes: Vec<NodeEvent> = Vec::new();
    let mut index = BTreeMap::new();
    let mut doctype = None;
    let mut stack: Vec<OpenElement> = Vec::new();
    let mut next_top = 1u32;
    let mut root_elements = 0usize;
    let mut buf = Vec::new();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(parse_error)?;
        match event {
            Event::Start(start) => {
                let node_id = next_id(&mut stack, &mut next_top);
                if stack.is_empty() {
                    root_elements += 1;
                }
                let address = alloc.next();
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                if node_id.level() <= index_depth {
                    index.insert(node_id.clone(), address);
                }
                let mut open = OpenElement {
                    node_id: node_id.clone(),
                    address,
                    start_index: nodes.len(),
                    next_child: 1,
                    attributes: 0,
                    children: 0,
                };
                nodes.push(NodeEvent {
                    node_id,
                    address,
                    stored_kind: NodeKind::Element,
                    data: NodeData::StartElement {
                        name,
                        attribute_count: 0,
                        child_count: 0,
                    },
                });
                for attr in start.attributes() {
                    let attr = attr.map_err(parse_error)?;
                    let value = attr.unescape_value().map_err(parse_error)?.into_owned();
                    let attr_id = open.node_id.child(open.next_child);
                    open.next_child += 1;
                    open.attributes += 1;
                    open.children += 1;
                    nodes.push(NodeEvent {
                        node_id: attr_id,
                        address: alloc.next(),
                        stored_kind: NodeKind::Attribute,
                        data: NodeData::Attribute {
                            name: String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
                            value,
                        },
                    });
                }
                stack.push(open);
            }
            Event::End(end) => {
                let open = stack
                    .pop()
                    .ok_or_else(|| parse_error("unexpected end tag"))?;
                if let NodeData::StartElement {
                    attribute_count,
                    child_count,
                    ..
                } = &mut nodes[open.start_index].data
                {
                    *attribute_count = open.attributes;
                    *child_count = open.children;
                }
                nodes.push(NodeEvent {
                    node_id: open.node_id,
                    address: open.address,
                    stored_kind: NodeKind::Element,
                    data: NodeData::EndElement {
                        name: String::from_utf8_lossy(end.name().as_ref()).into_owned(),
                    },
                });
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(parse_error)?.into_owned();
                if stack.is_empty() {
                    // whitespace between top-level nodes is not stored
                    if text.trim().is_empty() {
                        buf.clear();
                        continue;
                    }
                    return Err(parse_error("text outside of the document element"));
                }
                push_leaf(&mut nodes, &mut stack, &mut next_top, &mut alloc, NodeKind::Text, NodeData::Text { text });
            }
            Event::CData(cdata) => {
                let text = String::from_utf8_lossy(&cdata.into_inner()).into_owned();
                push_leaf(&mut nodes, &mut stack, &mut next_top, &mut alloc, NodeKind::CData, NodeData::CData { text });
            }
            Event::Comment(comment) => {
                let text = String::from_utf8_lossy(&comment).into_owned();
                push_leaf(&mut nodes, &mut stack, &mut next_top, &mut alloc, NodeKind::Comment, NodeData::Comment { text });
            }
            Event::PI(pi) => {
                let content = String::from_utf8_lossy(&pi).into_owned();
                let (target, data) = match content.find(char::is_whitespace) {
                    Some(pos) => (content[..pos].to_string(), content[pos..].trim_start().to_string()),
                    None => (content, String::new()),
                };
                push_leaf(
                    &mut nodes,
                    &mut stack,
                    &mut next_top,
                    &mut alloc,
                    NodeKind::ProcessingInstruction,
                    NodeData::ProcessingInstruction { target, data },
                );
            }
            Event::DocType(body) => {
                doctype = DocType::parse(&String::from_utf8_lossy(&body));
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(parse_error("unclosed element at end of document"));
    }
    if root_elements != 1 {
        return Err(parse_error(format!(
            "expected exactly one document element, found {}",
            root_elements
        )));
    }

    Ok(ParsedDocument {
        nodes,
        index,
        doctype,
        next_page: alloc.page + 1,
    })
}

fn next_id(stack: &mut [OpenElement], next_top: &mut u32) -> NodeId {
    match stack.last_mut() {
        Some(parent) => {
            let id = parent.node_id.child(parent.next_child);
            parent.next_child += 1;
            parent.children += 1;
            id
        }
        None => {
            let id = NodeId::top(*next_top);
            *next_top += 1;
            id
        }
    }
}

fn push_leaf(
    nodes: &mut Vec<NodeEvent>,
    stack: &mut [OpenElement],
    next_top: &mut u32,
    alloc: &mut Allocator,
    stored_kind: NodeKind,
    data: NodeData,
) {
    let node_id = next_id(stack, next_top);
    nodes.push(NodeEvent {
        node_id,
        address: alloc.next(),
        stored_kind,
        data,
    });
}
