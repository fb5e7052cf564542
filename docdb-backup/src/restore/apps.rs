//! Application packages in a backup.
//!
//! Packages live in collections below `/db/apps` and describe themselves in
//! an `expath-pkg.xml` file. A package already installed at the same or a
//! newer version is not overwritten by a restore.

use super::RestoreListener;
use crate::descriptor::BackupDescriptor;
use crate::manifest::{ManifestEvent, ManifestReader};
use crate::storage::{child_path, last_segment, InstalledPackage, APPS_COLLECTION, ROOT_COLLECTION};
use crate::utils::errors::Result;
use quick_xml::events::Event;
use quick_xml::Reader;
use semver::Version;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use tracing::debug;

pub const PACKAGE_DESCRIPTOR: &str = "expath-pkg.xml";

/// `version` attribute of a package descriptor's root element.
pub fn package_version<R: BufRead>(input: R) -> Option<String> {
    let mut reader = Reader::from_reader(input);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) | Ok(Event::Empty(start)) => {
                return start
                    .try_get_attribute("version")
                    .ok()
                    .flatten()
                    .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()));
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

/// Semantic version, accepting the `1` and `1.2` shorthands.
fn parse_version(value: &str) -> Option<Version> {
    let value = value.trim();
    Version::parse(value).ok().or_else(|| match value.matches('.').count() {
        0 => Version::parse(&format!("{}.0.0", value)).ok(),
        1 => Version::parse(&format!("{}.0", value)).ok(),
        _ => None,
    })
}

/// Compare package versions; falls back to plain string order when either
/// side is not a version number.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_version(a), parse_version(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Symbolic paths of the archived app collections below `top` that must
/// not be restored because the installed package is the same or newer.
pub(crate) fn paths_to_ignore(
    top: &dyn BackupDescriptor,
    installed: &[InstalledPackage],
    listener: &mut dyn RestoreListener,
) -> Result<HashSet<String>> {
    let mut ignore = HashSet::new();
    if installed.is_empty() || !is_root_manifest(top)? {
        return Ok(ignore);
    }
    let apps = match top.child(last_segment(APPS_COLLECTION))? {
        Some(apps) => apps,
        None => return Ok(ignore),
    };

    let reader = ManifestReader::new(BufReader::new(apps.contents()?), apps.symbolic_path());
    for event in reader {
        let attrs = match event? {
            ManifestEvent::Subcollection(attrs) => attrs,
            _ => continue,
        };
        let name = match attrs.get("name") {
            Some(name) => name,
            None => continue,
        };
        let path = child_path(APPS_COLLECTION, name);
        let package = match installed.iter().find(|p| p.path == path) {
            Some(package) => package,
            None => continue,
        };
        let filename = attrs.get("filename").unwrap_or(name);
        let archived = match apps.child(filename)? {
            Some(archived) => archived,
            None => continue,
        };
        let version = match archived.member(PACKAGE_DESCRIPTOR)? {
            Some(input) => package_version(BufReader::new(input)),
            None => None,
        };
        let version = match version {
            Some(version) => version,
            None => {
                listener.warn(&format!(
                    "No package version found in {}",
                    archived.symbolic_member_path(PACKAGE_DESCRIPTOR)
                ));
                continue;
            }
        };

        if compare_versions(&version, &package.version) != Ordering::Greater {
            debug!(
                "Archived {} {} is not newer than installed {}",
                path, version, package.version
            );
            ignore.insert(archived.symbolic_path());
        }
    }
    Ok(ignore)
}

fn is_root_manifest(descriptor: &dyn BackupDescriptor) -> Result<bool> {
    let reader = ManifestReader::new(BufReader::new(descriptor.contents()?), descriptor.symbolic_path());
    for event in reader {
        if let ManifestEvent::Collection(attrs) = event? {
            return Ok(attrs.get("name") == Some(ROOT_COLLECTION));
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_version() {
        let xml = r#"<?xml version="1.0"?>
<package xmlns="http://expath.org/ns/pkg" name="http://example.com/demo" abbrev="demo" version="1.4.2" spec="1.0"/>"#;
        assert_eq!(package_version(xml.as_bytes()).as_deref(), Some("1.4.2"));
        assert_eq!(package_version("<package/>".as_bytes()), None);
        assert_eq!(package_version("".as_bytes()), None);
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.2.0", "1.10.0"), Ordering::Less);
        assert_eq!(compare_versions("2", "1.9.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.0.0-beta", "1.0.0"), Ordering::Less);
    }
}
