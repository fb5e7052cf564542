//! Pull parser turning a manifest into [`ManifestEvent`]s.

use super::{parse_flag, NAMESPACE};
use crate::utils::errors::{BackupError, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;
use std::collections::BTreeMap;
use std::io::BufRead;

/// Attributes of one manifest element, unescaped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(BTreeMap<String, String>);

impl Attributes {
    fn from_start(start: &BytesStart<'_>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for attr in start.attributes() {
            let attr = attr?;
            if attr.key.as_namespace_binding().is_some() {
                continue;
            }
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            map.insert(key, value);
        }
        Ok(Self(map))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// `yes`/`true` are set, anything else (or absence) is unset.
    pub fn flag(&self, name: &str) -> bool {
        self.get(name).map(parse_flag).unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn with(mut self, name: &str, value: &str) -> Self {
        self.0.insert(name.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestEvent {
    Collection(Attributes),
    /// ACL entry of the enclosing collection or resource
    Ace(Attributes),
    Resource(Attributes),
    EndResource,
    Subcollection(Attributes),
    Deleted(Attributes),
    EndCollection,
}

/// Streams the events of one manifest. Elements outside the manifest
/// namespace are ignored; a document whose root is not a manifest
/// `collection` is an error.
pub struct ManifestReader<R: BufRead> {
    reader: NsReader<R>,
    buf: Vec<u8>,
    source: String,
    seen_root: bool,
    /// Elements opened and not yet closed
    depth: usize,
    done: bool,
}

impl<R: BufRead> ManifestReader<R> {
    /// `source` names the manifest in error messages.
    pub fn new(input: R, source: impl Into<String>) -> Self {
        let mut reader = NsReader::from_reader(input);
        reader.trim_text(true);
        reader.expand_empty_elements(true);
        Self {
            reader,
            buf: Vec::new(),
            source: source.into(),
            seen_root: false,
            depth: 0,
            done: false,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn read_next(&mut self) -> Result<Option<ManifestEvent>> {
        loop {
            self.buf.clear();
            let source = &self.source;
            let (resolved, event) = self
                .reader
                .read_resolved_event_into(&mut self.buf)
                .map_err(|e| BackupError::manifest(source.as_str(), e.to_string()))?;
            let ours = matches!(resolved, ResolveResult::Bound(Namespace(ns)) if ns == NAMESPACE.as_bytes());

            match event {
                Event::Start(start) => {
                    self.depth += 1;
                    let local = start.local_name();
                    if !self.seen_root {
                        if !ours || local.as_ref() != b"collection" {
                            return Err(BackupError::manifest(
                                source.as_str(),
                                "root element is not a backup collection manifest",
                            ));
                        }
                        self.seen_root = true;
                    }
                    if !ours {
                        continue;
                    }
                    let event = match local.as_ref() {
                        b"collection" => ManifestEvent::Collection(Attributes::from_start(&start)?),
                        b"ace" => ManifestEvent::Ace(Attributes::from_start(&start)?),
                        b"resource" => ManifestEvent::Resource(Attributes::from_start(&start)?),
                        b"subcollection" => ManifestEvent::Subcollection(Attributes::from_start(&start)?),
                        b"deleted" => ManifestEvent::Deleted(Attributes::from_start(&start)?),
                        _ => continue,
                    };
                    return Ok(Some(event));
                }
                Event::End(end) => {
                    self.depth = self.depth.saturating_sub(1);
                    if !ours {
                        continue;
                    }
                    match end.local_name().as_ref() {
                        b"collection" => return Ok(Some(ManifestEvent::EndCollection)),
                        b"resource" => return Ok(Some(ManifestEvent::EndResource)),
                        _ => {}
                    }
                }
                Event::Eof => {
                    if !self.seen_root {
                        return Err(BackupError::manifest(source.as_str(), "empty manifest"));
                    }
                    if self.depth > 0 {
                        return Err(BackupError::manifest(source.as_str(), "unexpected end of manifest"));
                    }
                    return Ok(None);
                }
                _ => {}
            }
        }
    }
}

impl<R: BufRead> Iterator for ManifestReader<R> {
    type Item = Result<ManifestEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_next() {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
