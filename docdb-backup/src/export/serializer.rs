//! Replays a document's persisted node stream as XML text.

use crate::storage::{Broker, DocumentRecord, NodeData};
use crate::utils::errors::Result;
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Write;

/// Serialize an XML document from its node stream into `out`.
///
/// Attributes follow their element in the stream, so a start tag is held
/// back until the first non-attribute event. An element closed right away
/// is written as an empty tag.
pub(crate) fn serialize_document<W: Write>(broker: &dyn Broker, doc: &DocumentRecord, out: W) -> Result<W> {
    let mut writer = Writer::new(out);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Text(BytesText::from_escaped("\n")))?;
    if let Some(doctype) = &doc.metadata.doctype {
        writer.write_event(Event::DocType(BytesText::from_escaped(doctype.declaration())))?;
        writer.write_event(Event::Text(BytesText::from_escaped("\n")))?;
    }

    let mut pending: Option<BytesStart<'static>> = None;
    for event in broker.node_stream(doc)? {
        let event = event?;
        if let NodeData::Attribute { name, value } = &event.data {
            if let Some(start) = pending.as_mut() {
                start.push_attribute((name.as_str(), value.as_str()));
            }
            continue;
        }

        if let NodeData::EndElement { name } = &event.data {
            match pending.take() {
                Some(start) => writer.write_event(Event::Empty(start))?,
                None => writer.write_event(Event::End(BytesEnd::new(name.as_str())))?,
            }
            continue;
        }

        if let Some(start) = pending.take() {
            writer.write_event(Event::Start(start))?;
        }
        match event.data {
            NodeData::StartElement { name, .. } => pending = Some(BytesStart::new(name)),
            NodeData::Text { text } => writer.write_event(Event::Text(BytesText::new(&text)))?,
            NodeData::CData { text } => write_cdata(&mut writer, &text)?,
            NodeData::Comment { text } => writer.write_event(Event::Comment(BytesText::from_escaped(text)))?,
            NodeData::ProcessingInstruction { target, data } => {
                let content = if data.is_empty() {
                    target
                } else {
                    format!("{} {}", target, data)
                };
                writer.write_event(Event::PI(BytesText::from_escaped(content)))?;
            }
            NodeData::Attribute { .. } | NodeData::EndElement { .. } => {}
        }
    }
    if let Some(start) = pending.take() {
        writer.write_event(Event::Empty(start))?;
    }
    Ok(writer.into_inner())
}

/// `]]>` cannot occur inside a CDATA section, so the text is split
/// between the `]]` and the `>`.
fn write_cdata<W: Write>(writer: &mut Writer<W>, text: &str) -> Result<()> {
    let mut rest = text;
    while let Some(pos) = rest.find("]]>") {
        writer.write_event(Event::CData(BytesCData::new(&rest[..pos + 2])))?;
        rest = &rest[pos + 2..];
    }
    writer.write_event(Event::CData(BytesCData::new(rest)))?;
    Ok(())
}
