//! Streaming manifest writer.

use super::{format_date, format_mode, yes_no, NAMESPACE};
use crate::storage::{Ace, DocType, Permission, ResourceKind};
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;
use std::io::Write;

/// Attributes of the root `collection` element.
#[derive(Debug, Clone)]
pub struct CollectionEntry {
    /// Absolute collection path
    pub name: String,
    pub permission: Permission,
    pub created: DateTime<Utc>,
    pub deduplicate_blobs: bool,
    pub version: u32,
}

/// One `resource` element.
#[derive(Debug, Clone)]
pub struct ResourceEntry {
    pub kind: ResourceKind,
    pub name: String,
    /// Content is unchanged since the previous backup and was not written
    pub skip: bool,
    pub permission: Permission,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub filename: String,
    pub mime_type: String,
    pub doctype: Option<DocType>,
    pub blob_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletedKind {
    Collection,
    Resource,
}

impl DeletedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletedKind::Collection => "collection",
            DeletedKind::Resource => "resource",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "collection" => Some(DeletedKind::Collection),
            "resource" => Some(DeletedKind::Resource),
            _ => None,
        }
    }
}

/// Writes one manifest. Call [`start_collection`](Self::start_collection)
/// first and [`finish`](Self::finish) last.
pub struct ManifestWriter<W: Write> {
    writer: Writer<W>,
}

impl<W: Write> ManifestWriter<W> {
    pub fn new(inner: W) -> Result<Self> {
        let mut writer = Writer::new_with_indent(inner, b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        Ok(Self { writer })
    }

    pub fn start_collection(&mut self, entry: &CollectionEntry) -> Result<()> {
        let mode = format_mode(entry.permission.mode);
        let created = format_date(&entry.created);
        let version = entry.version.to_string();

        let mut start = BytesStart::new("collection");
        start.push_attribute(("xmlns", NAMESPACE));
        start.push_attribute(("name", entry.name.as_str()));
        start.push_attribute(("version", version.as_str()));
        start.push_attribute(("owner", entry.permission.owner.as_str()));
        start.push_attribute(("group", entry.permission.group.as_str()));
        start.push_attribute(("mode", mode.as_str()));
        start.push_attribute(("created", created.as_str()));
        start.push_attribute(("deduplicate-blobs", yes_no(entry.deduplicate_blobs)));
        self.writer.write_event(Event::Start(start))?;
        self.acl(&entry.permission.acl)
    }

    fn acl(&mut self, acl: &[Ace]) -> Result<()> {
        if acl.is_empty() {
            return Ok(());
        }
        let entries = acl.len().to_string();
        let mut start = BytesStart::new("acl");
        start.push_attribute(("entries", entries.as_str()));
        start.push_attribute(("version", "1"));
        self.writer.write_event(Event::Start(start))?;

        for (index, ace) in acl.iter().enumerate() {
            let index = index.to_string();
            let mode = format_mode(ace.mode);
            let mut element = BytesStart::new("ace");
            element.push_attribute(("index", index.as_str()));
            element.push_attribute(("target", ace.target.as_str()));
            element.push_attribute(("who", ace.who.as_str()));
            element.push_attribute(("access_type", ace.access_type.as_str()));
            element.push_attribute(("mode", mode.as_str()));
            self.writer.write_event(Event::Empty(element))?;
        }
        self.writer.write_event(Event::End(BytesEnd::new("acl")))?;
        Ok(())
    }

    pub fn resource(&mut self, entry: &ResourceEntry) -> Result<()> {
        let mode = format_mode(entry.permission.mode);
        let created = format_date(&entry.created);
        let modified = format_date(&entry.modified);

        let mut start = BytesStart::new("resource");
        start.push_attribute(("type", entry.kind.manifest_type()));
        start.push_attribute(("name", entry.name.as_str()));
        start.push_attribute(("skip", yes_no(entry.skip)));
        start.push_attribute(("owner", entry.permission.owner.as_str()));
        start.push_attribute(("group", entry.permission.group.as_str()));
        start.push_attribute(("mode", mode.as_str()));
        start.push_attribute(("created", created.as_str()));
        start.push_attribute(("modified", modified.as_str()));
        start.push_attribute(("filename", entry.filename.as_str()));
        start.push_attribute(("mimetype", entry.mime_type.as_str()));
        if let Some(doctype) = &entry.doctype {
            start.push_attribute(("namedoctype", doctype.name.as_str()));
            if let Some(public_id) = &doctype.public_id {
                start.push_attribute(("publicid", public_id.as_str()));
            }
            if let Some(system_id) = &doctype.system_id {
                start.push_attribute(("systemid", system_id.as_str()));
            }
        }
        if let Some(blob_id) = &entry.blob_id {
            start.push_attribute(("blob-id", blob_id.as_str()));
        }

        if entry.permission.acl.is_empty() {
            self.writer.write_event(Event::Empty(start))?;
        } else {
            self.writer.write_event(Event::Start(start))?;
            self.acl(&entry.permission.acl)?;
            self.writer.write_event(Event::End(BytesEnd::new("resource")))?;
        }
        Ok(())
    }

    pub fn subcollection(&mut self, name: &str, filename: &str) -> Result<()> {
        let mut element = BytesStart::new("subcollection");
        element.push_attribute(("name", name));
        element.push_attribute(("filename", filename));
        self.writer.write_event(Event::Empty(element))?;
        Ok(())
    }

    pub fn deleted(&mut self, name: &str, kind: DeletedKind) -> Result<()> {
        let mut element = BytesStart::new("deleted");
        element.push_attribute(("name", name));
        element.push_attribute(("type", kind.as_str()));
        self.writer.write_event(Event::Empty(element))?;
        Ok(())
    }

    /// Close the `collection` element and hand back the sink.
    pub fn finish(mut self) -> Result<W> {
        self.writer.write_event(Event::End(BytesEnd::new("collection")))?;
        Ok(self.writer.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AccessType, AceTarget};
    use chrono::TimeZone;

    #[test]
    fn test_writes_collection_acl_and_entries() {
        let created = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let mut permission = Permission::new("admin", "dba", 0o755);
        permission.acl.push(Ace {
            target: AceTarget::Group,
            who: "editors".to_string(),
            access_type: AccessType::Allowed,
            mode: 0o6,
        });

        let mut writer = ManifestWriter::new(Vec::new()).unwrap();
        writer
            .start_collection(&CollectionEntry {
                name: "/db/data".to_string(),
                permission,
                created,
                deduplicate_blobs: false,
                version: 1,
            })
            .unwrap();
        writer
            .resource(&ResourceEntry {
                kind: ResourceKind::Xml,
                name: "a&b.xml".to_string(),
                skip: false,
                permission: Permission::new("admin", "dba", 0o644),
                created,
                modified: created,
                filename: "a&26;b.xml".to_string(),
                mime_type: "application/xml".to_string(),
                doctype: None,
                blob_id: None,
            })
            .unwrap();
        writer.subcollection("nested", "nested").unwrap();
        writer.deleted("gone.xml", DeletedKind::Resource).unwrap();
        let xml = String::from_utf8(writer.finish().unwrap()).unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains(&format!("xmlns=\"{}\"", NAMESPACE)));
        assert!(xml.contains("mode=\"755\""));
        assert!(xml.contains("<ace index=\"0\" target=\"GROUP\" who=\"editors\" access_type=\"ALLOWED\" mode=\"6\"/>"));
        assert!(xml.contains("name=\"a&amp;b.xml\""));
        assert!(xml.contains("<subcollection name=\"nested\" filename=\"nested\"/>"));
        assert!(xml.contains("<deleted name=\"gone.xml\" type=\"resource\"/>"));
        assert!(xml.trim_end().ends_with("</collection>"));
    }
}
