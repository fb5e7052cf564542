//! Export a store, restore it elsewhere and compare.

use docdb_backup::storage::{
    Ace, AceTarget, AccessType, Credentials, NodeData, Permission, ADMIN_ACCOUNT, LOST_AND_FOUND_COLLECTION,
};
use docdb_backup::{
    open_backup, Broker, BrokerMut, ConsistencyCheck, ErrorKind, ExportOptions, LoggingProgress,
    LoggingRestoreListener, MemoryStore, Restore, SystemExport,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

fn directory_options() -> ExportOptions {
    ExportOptions {
        zip: false,
        ..ExportOptions::default()
    }
}

fn export(store: &MemoryStore, target: &Path, options: &ExportOptions) -> PathBuf {
    let mut progress = LoggingProgress::new();
    SystemExport::new(store, &mut progress)
        .export(target, options, &[])
        .unwrap()
}

fn restore(store: &mut MemoryStore, location: &Path) -> LoggingRestoreListener {
    let mut listener = LoggingRestoreListener::new();
    Restore::new(store)
        .restore(&Credentials::new(ADMIN_ACCOUNT, ""), None, location, &mut listener, false)
        .unwrap();
    listener
}

fn nodes(store: &MemoryStore, collection: &str, name: &str) -> Vec<NodeData> {
    let doc = store.document(collection, name).unwrap();
    store
        .node_stream(&doc)
        .unwrap()
        .map(|event| event.unwrap().data)
        .collect()
}

fn sample_store() -> MemoryStore {
    let mut store = MemoryStore::new();
    store.add_group("editors");
    store.add_account("alice", "secret", &["editors"]);

    store.create_collection("/db/data/reports").unwrap();
    let mut permission = Permission::new("alice", "editors", 0o770);
    permission.acl.push(Ace {
        target: AceTarget::Group,
        who: "editors".to_string(),
        access_type: AccessType::Allowed,
        mode: 0o6,
    });
    store.set_collection_permission("/db/data", permission).unwrap();

    store
        .put_xml(
            "/db/data",
            "page.xhtml",
            r#"<!DOCTYPE html PUBLIC "-//W3C//DTD XHTML 1.0 Strict//EN" "http://www.w3.org/TR/xhtml1/DTD/xhtml1-strict.dtd"><html><body class="main">Tom &amp; Jerry<!-- note --></body></html>"#,
        )
        .unwrap();
    store
        .put_xml("/db/data/reports", "q1:2024?.xml", "<report><![CDATA[a < b]]><?render fast?></report>")
        .unwrap();
    store
        .put_binary("/db/data/reports", "chart.png", &[0x89, b'P', b'N', b'G', 0, 1, 2], "image/png")
        .unwrap();
    store
        .set_document_permission("/db/data/reports", "chart.png", Permission::new("alice", "editors", 0o600))
        .unwrap();
    store
}

/// Every file of a directory backup, keyed by its path inside the backup.
/// Manifest lines are sorted and the root collection's creation date is
/// dropped since the root always exists in the target store.
fn backup_files(root: &Path) -> BTreeMap<String, Vec<String>> {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(root) {
        let entry = entry.unwrap();
        if !entry.file_type().is_file() || entry.file_name() == "backup.properties" {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
        let bytes = std::fs::read(entry.path()).unwrap();
        let mut lines: Vec<String> = String::from_utf8_lossy(&bytes)
            .lines()
            .map(|line| {
                if relative == "db/__contents__.xml" && line.trim_start().starts_with("<collection ") {
                    strip_attribute(line, "created")
                } else {
                    line.to_string()
                }
            })
            .collect();
        lines.sort();
        files.insert(relative, lines);
    }
    files
}

fn strip_attribute(line: &str, name: &str) -> String {
    let marker = format!(" {}=\"", name);
    match line.find(&marker) {
        Some(start) => {
            let value_start = start + marker.len();
            match line[value_start..].find('"') {
                Some(end) => format!("{}{}", &line[..start], &line[value_start + end + 1..]),
                None => line.to_string(),
            }
        }
        None => line.to_string(),
    }
}

#[test]
fn zip_round_trip_preserves_content_and_metadata() {
    let temp = TempDir::new().unwrap();
    let source = sample_store();
    let backup = export(&source, temp.path(), &ExportOptions::default());
    assert_eq!(backup.extension().and_then(|e| e.to_str()), Some("zip"));

    let mut target = MemoryStore::new();
    target.add_group("editors");
    target.add_account("alice", "secret", &["editors"]);
    let listener = restore(&mut target, &backup);
    assert!(!listener.has_problems(), "{:?} {:?}", listener.warnings, listener.errors);
    assert_eq!(listener.restored, 3);
    assert_eq!(listener.percent_complete(), 100.0);

    let data = target.collection("/db/data").unwrap().unwrap();
    let expected = source.collection("/db/data").unwrap().unwrap();
    assert_eq!(data.permission, expected.permission);
    assert_eq!(data.children, vec!["reports".to_string()]);

    for (collection, name) in [("/db/data", "page.xhtml"), ("/db/data/reports", "q1:2024?.xml")] {
        assert_eq!(nodes(&target, collection, name), nodes(&source, collection, name), "{}", name);
    }
    let page = target.document("/db/data", "page.xhtml").unwrap();
    assert_eq!(
        page.metadata.doctype,
        source.document("/db/data", "page.xhtml").unwrap().metadata.doctype
    );

    let chart = target.document("/db/data/reports", "chart.png").unwrap();
    assert_eq!(chart.metadata.mime_type, "image/png");
    assert_eq!(chart.permission, Permission::new("alice", "editors", 0o600));
    assert_eq!(
        target.binary_content("/db/data/reports", "chart.png"),
        source.binary_content("/db/data/reports", "chart.png")
    );
}

#[test]
fn re_export_of_restored_store_is_identical() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let source = sample_store();
    let backup = export(&source, first.path(), &directory_options());

    let mut target = MemoryStore::new();
    target.add_group("editors");
    target.add_account("alice", "secret", &["editors"]);
    restore(&mut target, &backup);
    let again = export(&target, second.path(), &directory_options());

    let before = backup_files(&backup);
    let after = backup_files(&again);
    assert_eq!(before.keys().collect::<Vec<_>>(), after.keys().collect::<Vec<_>>());
    for (path, lines) in &before {
        assert_eq!(lines, &after[path], "{} differs", path);
    }
}

#[test]
fn incremental_backup_skips_unchanged_documents() {
    let temp = TempDir::new().unwrap();
    let mut source = sample_store();
    let full = export(&source, temp.path(), &directory_options());

    source.put_xml("/db/data", "fresh.xml", "<fresh/>").unwrap();
    source.remove_document("/db/data/reports", "chart.png").unwrap();
    let options = ExportOptions {
        incremental: true,
        ..directory_options()
    };
    let increment = export(&source, temp.path(), &options);
    assert_ne!(full, increment);

    let top = open_backup(&increment).unwrap();
    let properties = top.properties().unwrap().unwrap();
    assert!(properties.incremental);
    assert_eq!(properties.number_in_sequence, 2);
    let data = top.child("data").unwrap().unwrap();
    assert!(data.member("fresh.xml").unwrap().is_some());
    assert!(data.member("page.xhtml").unwrap().is_none());

    let mut target = MemoryStore::new();
    target.add_group("editors");
    target.add_account("alice", "secret", &["editors"]);
    let listener = restore(&mut target, &increment);
    assert!(listener.errors.is_empty(), "{:?}", listener.errors);
    assert!(target.document("/db/data", "fresh.xml").is_some());
    assert_eq!(
        nodes(&target, "/db/data", "page.xhtml"),
        nodes(&source, "/db/data", "page.xhtml")
    );
    assert!(target.document("/db/data/reports", "chart.png").is_none());
}

#[test]
fn deduplicated_blobs_restore_every_resource() {
    let temp = TempDir::new().unwrap();
    let mut source = MemoryStore::new();
    source.create_collection("/db/media").unwrap();
    source.put_binary("/db/media", "a.bin", b"shared bytes", "application/octet-stream").unwrap();
    source.put_binary("/db/media", "b.bin", b"shared bytes", "application/octet-stream").unwrap();
    source.put_binary("/db/media", "c.bin", b"other bytes", "application/octet-stream").unwrap();
    let options = ExportOptions {
        deduplicate_blobs: true,
        ..ExportOptions::default()
    };
    let backup = export(&source, temp.path(), &options);

    let mut target = MemoryStore::new();
    let listener = restore(&mut target, &backup);
    assert!(listener.errors.is_empty(), "{:?}", listener.errors);
    for name in ["a.bin", "b.bin", "c.bin"] {
        assert_eq!(
            target.binary_content("/db/media", name),
            source.binary_content("/db/media", name),
            "{}",
            name
        );
    }
}

#[test]
fn damaged_documents_are_detected_and_left_out() {
    let temp = TempDir::new().unwrap();
    let mut store = sample_store();
    store.put_xml("/db/data", "broken.xml", "<broken/>").unwrap();
    store.detach_root_element("/db/data", "broken.xml").unwrap();
    let broken = store.document("/db/data", "broken.xml").unwrap();

    let mut progress = LoggingProgress::new();
    let errors = ConsistencyCheck::new(&store, false, false)
        .check_all(&mut progress)
        .unwrap();
    assert_eq!(errors.len(), 1, "{:?}", errors);
    assert_eq!(errors[0].kind(), ErrorKind::ResourceAccessFailed);
    assert!(errors[0].is_damaged_document(broken.id));

    let backup = SystemExport::new(&store, &mut progress)
        .export(temp.path(), &directory_options(), &errors)
        .unwrap();
    let data = open_backup(&backup).unwrap().child("data").unwrap().unwrap();
    assert!(data.member("broken.xml").unwrap().is_none());
    assert!(data.member("page.xhtml").unwrap().is_some());
}

#[test]
fn orphaned_documents_are_restored_into_lost_and_found() {
    let temp = TempDir::new().unwrap();
    let mut source = MemoryStore::new();
    source.create_collection("/db/left").unwrap();
    source.create_collection("/db/right").unwrap();
    source.put_xml("/db/left", "note.xml", "<left/>").unwrap();
    source.put_xml("/db/right", "note.xml", "<right/>").unwrap();
    source.delete_collection_record("/db/left").unwrap();
    source.delete_collection_record("/db/right").unwrap();

    let mut progress = LoggingProgress::new();
    let errors = ConsistencyCheck::new(&source, false, false)
        .check_all(&mut progress)
        .unwrap();
    assert!(errors.iter().any(|e| e.kind() == ErrorKind::ChildCollection));
    let backup = SystemExport::new(&source, &mut progress)
        .export(temp.path(), &ExportOptions::default(), &errors)
        .unwrap();

    let mut target = MemoryStore::new();
    let listener = restore(&mut target, &backup);
    assert!(listener.errors.is_empty(), "{:?}", listener.errors);
    assert!(target.collection("/db/left").unwrap().is_none());

    let mut recovered: Vec<Vec<NodeData>> = ["note.xml", "note.xml.1"]
        .iter()
        .map(|name| nodes(&target, LOST_AND_FOUND_COLLECTION, name))
        .collect();
    let mut expected = vec![
        nodes(&source, "/db/left", "note.xml"),
        nodes(&source, "/db/right", "note.xml"),
    ];
    recovered.sort_by_key(|n| format!("{:?}", n));
    expected.sort_by_key(|n| format!("{:?}", n));
    assert_eq!(recovered, expected);
}

#[test]
fn restore_rejects_member_outside_the_backup() {
    let temp = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    std::fs::write(outside.path().join("secret.xml"), "<secret/>").unwrap();

    let mut source = MemoryStore::new();
    source.create_collection("/db/data").unwrap();
    source.put_xml("/db/data", "a.xml", "<a/>").unwrap();
    let backup = export(&source, temp.path(), &directory_options());

    let manifest = backup.join("db").join("data").join("__contents__.xml");
    let content = std::fs::read_to_string(&manifest).unwrap();
    let escape = format!("filename=\"../../../../{}/secret.xml\"", outside.path().display());
    std::fs::write(&manifest, content.replace("filename=\"a.xml\"", &escape)).unwrap();

    let mut target = MemoryStore::new();
    let listener = restore(&mut target, &backup);
    assert!(
        listener.errors.iter().any(|e| e.contains("archive exit")),
        "{:?}",
        listener.errors
    );
    assert!(target.document("/db/data", "a.xml").is_none());
}
