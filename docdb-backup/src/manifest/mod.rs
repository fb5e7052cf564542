//! The per-collection `__contents__.xml` manifest.
//!
//! A manifest describes one collection: its own metadata and ACL, then its
//! resources, subcollections and (for incremental backups) deletions, in
//! that order. Elements live in [`NAMESPACE`].

pub mod counter;
pub mod reader;
pub mod writer;

use chrono::{DateTime, SecondsFormat, Utc};

pub use counter::count_resources;
pub use reader::{Attributes, ManifestEvent, ManifestReader};
pub use writer::{CollectionEntry, DeletedKind, ManifestWriter, ResourceEntry};

pub const CONTENTS_FILE: &str = "__contents__.xml";
pub const NAMESPACE: &str = "http://docdb.dev/ns/backup";

/// Manifest version written when blobs are stored inline.
pub const FORMAT_VERSION: u32 = 1;
/// Manifest version written when binary content goes to the blob store.
pub const BLOB_STORE_VERSION: u32 = 2;

/// Directory of deduplicated binary payloads, at the archive root.
pub const BLOB_DIRECTORY: &str = "blob";
pub const PROPERTIES_FILE: &str = "backup.properties";

pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

pub fn format_mode(mode: u32) -> String {
    format!("{:o}", mode)
}

pub fn parse_mode(value: &str) -> Option<u32> {
    u32::from_str_radix(value.trim(), 8).ok()
}

pub(crate) fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

pub(crate) fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "yes" | "true")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_date_and_mode_formats() {
        let date = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(format_date(&date), "2024-03-01T12:30:00.000Z");
        assert_eq!(parse_date("2024-03-01T12:30:00.000Z"), Some(date));
        assert_eq!(parse_date("yesterday"), None);

        assert_eq!(format_mode(0o755), "755");
        assert_eq!(parse_mode("0771"), Some(0o771));
        assert_eq!(parse_mode("rwx"), None);
    }
}
