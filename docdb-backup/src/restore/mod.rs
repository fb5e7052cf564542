//! Restore of a backup, or a chain of incremental backups, into the store.
//!
//! A backup is replayed one collection manifest at a time from a worklist;
//! subcollections found in a manifest go to the front of the list so the
//! tree is restored depth first. Within each backup the security data goes
//! first (groups, the security collection, the system collection), then
//! the rest of the tree. Incremental chains are replayed oldest first.

mod apps;
mod handler;
mod listener;

use crate::descriptor::{open_backup, BackupDescriptor};
use crate::storage::{BrokerMut, Credentials, ADMIN_ACCOUNT, REALM_NAME};
use crate::utils::errors::{BackupError, Result};
use handler::{restore_descriptor, RestoreContext};
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use apps::{compare_versions, package_version, PACKAGE_DESCRIPTOR};
pub use listener::{LoggingRestoreListener, RestoreListener};

/// Restores backups into a store. Holds the store exclusively for the
/// duration of the restore.
pub struct Restore<'a> {
    broker: &'a mut dyn BrokerMut,
    cancel: CancellationToken,
}

/// Everything resolved before the first resource is written.
struct RestorePlan {
    /// Backups of the chain, oldest first
    chain: Vec<Box<dyn BackupDescriptor>>,
    paths_to_ignore: HashSet<String>,
    total_resources: usize,
}

/// Descriptors of one backup in processing order: the groups collection,
/// the security collection, the system collection, then the root.
fn priority_descriptors(top: &dyn BackupDescriptor) -> Result<Vec<Box<dyn BackupDescriptor>>> {
    let groups = format!("system/security/{}/groups", REALM_NAME);
    let mut ordered = Vec::new();
    for relative in [groups.as_str(), "system/security", "system"] {
        if let Some(descriptor) = top.descendant(relative)? {
            ordered.push(descriptor);
        }
    }
    Ok(ordered)
}

impl<'a> Restore<'a> {
    pub fn new(broker: &'a mut dyn BrokerMut) -> Self {
        Self {
            broker,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Restore the backup at `location` and every backup it depends on.
    ///
    /// `listener.started` and `listener.finished` are called even when the
    /// restore fails. Application packages already installed at the same or
    /// a newer version are left alone unless `overwrite_apps` is set.
    pub fn restore(
        &mut self,
        credentials: &Credentials,
        new_admin_password: Option<&str>,
        location: &Path,
        listener: &mut dyn RestoreListener,
        overwrite_apps: bool,
    ) -> Result<()> {
        let plan = self.prepare(credentials, new_admin_password, location, listener, overwrite_apps);
        listener.started(plan.as_ref().map_or(0, |plan| plan.total_resources));

        let result = match plan {
            Ok(plan) => {
                let triggers = self.broker.triggers_enabled();
                self.broker.set_triggers_enabled(false);
                let result = self.process(&plan, listener);
                self.broker.set_triggers_enabled(triggers);
                result
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            listener.error(&format!("Restore of {} failed: {}", location.display(), e));
        }
        listener.finished();
        result
    }

    fn prepare(
        &mut self,
        credentials: &Credentials,
        new_admin_password: Option<&str>,
        location: &Path,
        listener: &mut dyn RestoreListener,
        overwrite_apps: bool,
    ) -> Result<RestorePlan> {
        self.broker.authenticate(credentials)?;
        if let Some(password) = new_admin_password {
            self.broker.set_password(ADMIN_ACCOUNT, password)?;
            listener.info("Admin password changed");
        }

        let chain = resolve_chain(location)?;
        let total_resources = chain.iter().map(|backup| backup.number_of_resources()).sum();

        let mut paths_to_ignore = HashSet::new();
        if !overwrite_apps {
            let installed = self.broker.installed_packages();
            for backup in &chain {
                match apps::paths_to_ignore(backup.as_ref(), &installed, listener) {
                    Ok(paths) => paths_to_ignore.extend(paths),
                    Err(e) => listener.warn(&format!(
                        "Could not check application versions in {}: {}",
                        backup.name(),
                        e
                    )),
                }
            }
        }
        info!(
            "Restoring {} backup(s) from {}, {} resources",
            chain.len(),
            location.display(),
            total_resources
        );
        Ok(RestorePlan {
            chain,
            paths_to_ignore,
            total_resources,
        })
    }

    fn process(&mut self, plan: &RestorePlan, listener: &mut dyn RestoreListener) -> Result<()> {
        let mut ctx = RestoreContext {
            broker: &mut *self.broker,
            listener,
            paths_to_ignore: &plan.paths_to_ignore,
            cancel: &self.cancel,
        };

        for backup in &plan.chain {
            ctx.listener.info(&format!("Restoring backup {}", backup.name()));
            for root in priority_descriptors(backup.as_ref())? {
                restore_tree(&mut ctx, root.as_ref())?;
            }
            restore_tree(&mut ctx, backup.as_ref())?;
        }
        Ok(())
    }
}

/// Restore `root` and everything below it.
fn restore_tree(ctx: &mut RestoreContext<'_>, root: &dyn BackupDescriptor) -> Result<()> {
    let mut worklist: VecDeque<Box<dyn BackupDescriptor>> = VecDeque::new();
    restore_one(ctx, root, &mut worklist)?;
    while let Some(descriptor) = worklist.pop_front() {
        if ctx.cancel.is_cancelled() {
            return Err(BackupError::Terminated);
        }
        restore_one(ctx, descriptor.as_ref(), &mut worklist)?;
    }
    Ok(())
}

/// Restore one collection and queue its subcollections ahead of the rest
/// of the worklist. A broken manifest is reported and skipped.
fn restore_one(
    ctx: &mut RestoreContext<'_>,
    descriptor: &dyn BackupDescriptor,
    worklist: &mut VecDeque<Box<dyn BackupDescriptor>>,
) -> Result<()> {
    match restore_descriptor(ctx, descriptor) {
        Ok(children) => {
            for child in children.into_iter().rev() {
                worklist.push_front(child);
            }
            Ok(())
        }
        Err(e) if e.is_terminated() => Err(e),
        Err(e) => {
            ctx.listener
                .error(&format!("Failed to restore {}: {}", descriptor.symbolic_path(), e));
            Ok(())
        }
    }
}

/// Open the backup at `location` and follow its `previous` links. The
/// result is ordered oldest first.
fn resolve_chain(location: &Path) -> Result<Vec<Box<dyn BackupDescriptor>>> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = open_backup(location)?;
    loop {
        seen.insert(current.name());
        let previous = current
            .properties()?
            .and_then(|properties| properties.previous().map(str::to_string));
        let parent = current.parent_location();
        chain.push(current);

        let previous = match previous {
            Some(previous) => previous,
            None => break,
        };
        if seen.contains(&previous) {
            return Err(BackupError::Properties(format!(
                "backup chain refers to {} twice",
                previous
            )));
        }
        let path = parent.join(&previous);
        debug!("Following backup chain to {}", path.display());
        current = open_backup(&path)
            .map_err(|_| BackupError::MissingIncrement(path.display().to_string()))?;
    }
    chain.reverse();
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{ExportOptions, SystemExport};
    use crate::manifest::CONTENTS_FILE;
    use crate::progress::testing::RecordingProgress;
    use crate::storage::{Broker, MemoryStore, SYSTEM_ACCOUNT};
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct RecordingListener {
        started: Option<usize>,
        finished: bool,
        descriptors: Vec<String>,
        restored: Vec<String>,
        skipped: Vec<(String, usize)>,
        warnings: Vec<String>,
        errors: Vec<String>,
    }

    impl RestoreListener for RecordingListener {
        fn started(&mut self, total_resources: usize) {
            self.started = Some(total_resources);
        }

        fn processing_descriptor(&mut self, path: &str) {
            self.descriptors.push(path.to_string());
        }

        fn created_collection(&mut self, _path: &str) {}

        fn restored_resource(&mut self, name: &str) {
            self.restored.push(name.to_string());
        }

        fn skip_resources(&mut self, reason: &str, count: usize) {
            self.skipped.push((reason.to_string(), count));
        }

        fn info(&mut self, _message: &str) {}

        fn warn(&mut self, message: &str) {
            self.warnings.push(message.to_string());
        }

        fn error(&mut self, message: &str) {
            self.errors.push(message.to_string());
        }

        fn finished(&mut self) {
            self.finished = true;
        }
    }

    fn admin() -> Credentials {
        Credentials::new(ADMIN_ACCOUNT, "")
    }

    fn export(store: &MemoryStore, target: &Path, incremental: bool) -> PathBuf {
        let mut progress = RecordingProgress::default();
        let options = ExportOptions {
            zip: false,
            incremental,
            ..ExportOptions::default()
        };
        SystemExport::new(store, &mut progress)
            .export(target, &options, &[])
            .unwrap()
    }

    fn restore(store: &mut MemoryStore, location: &Path, overwrite_apps: bool) -> (Result<()>, RecordingListener) {
        let mut listener = RecordingListener::default();
        let result = Restore::new(store).restore(&admin(), None, location, &mut listener, overwrite_apps);
        (result, listener)
    }

    #[test]
    fn test_security_collections_are_restored_first() {
        let temp = TempDir::new().unwrap();
        let mut source = MemoryStore::new();
        source.create_collection("/db/system/security/docdb/groups").unwrap();
        source.create_collection("/db/system/security/docdb/accounts").unwrap();
        source.create_collection("/db/data").unwrap();
        source.put_xml("/db/system/security/docdb/groups", "dba.xml", "<group/>").unwrap();
        source.put_xml("/db/data", "a.xml", "<a/>").unwrap();
        let backup = export(&source, temp.path(), false);

        let mut target = MemoryStore::new();
        let (result, listener) = restore(&mut target, &backup, false);
        result.unwrap();
        assert!(listener.errors.is_empty(), "{:?}", listener.errors);

        let order: Vec<&str> = listener
            .descriptors
            .iter()
            .map(|d| d.split("/db").last().unwrap_or_default())
            .collect();
        assert_eq!(
            order,
            vec![
                "/system/security/docdb/groups",
                "/system/security",
                "/system/security/docdb",
                "/system/security/docdb/accounts",
                "/system",
                "",
                "/data",
            ]
        );
        assert_eq!(listener.started, Some(2));
        assert!(listener.finished);

        let system = target.collection("/db/system").unwrap().unwrap();
        assert_eq!(system.permission.owner, SYSTEM_ACCOUNT);
        assert!(target.document("/db/data", "a.xml").is_some());
        assert!(target.triggers_enabled());
    }

    #[test]
    fn test_incremental_chain_applies_deletions() {
        let temp = TempDir::new().unwrap();
        let mut source = MemoryStore::new();
        source.create_collection("/db/data/old").unwrap();
        source.put_xml("/db/data", "keep.xml", "<keep/>").unwrap();
        source.put_xml("/db/data", "gone.xml", "<gone/>").unwrap();
        export(&source, temp.path(), false);

        source.remove_document("/db/data", "gone.xml").unwrap();
        source.remove_collection("/db/data/old").unwrap();
        source.put_xml("/db/data", "new.xml", "<new/>").unwrap();
        let increment = export(&source, temp.path(), true);
        assert!(increment.file_name().unwrap().to_string_lossy().starts_with("inc"));

        let mut target = MemoryStore::new();
        let (result, listener) = restore(&mut target, &increment, false);
        result.unwrap();
        assert!(listener.errors.is_empty(), "{:?}", listener.errors);
        assert!(target.document("/db/data", "keep.xml").is_some());
        assert!(target.document("/db/data", "new.xml").is_some());
        assert!(target.document("/db/data", "gone.xml").is_none());
        assert!(target.collection("/db/data/old").unwrap().is_none());
    }

    #[test]
    fn test_missing_increment_fails_but_reports_start_and_finish() {
        let temp = TempDir::new().unwrap();
        let mut source = MemoryStore::new();
        source.put_xml("/db", "a.xml", "<a/>").unwrap();
        let full = export(&source, temp.path(), false);
        let increment = export(&source, temp.path(), true);
        std::fs::remove_dir_all(&full).unwrap();

        let mut target = MemoryStore::new();
        let (result, listener) = restore(&mut target, &increment, false);
        assert!(matches!(result, Err(BackupError::MissingIncrement(_))));
        assert_eq!(listener.started, Some(0));
        assert!(listener.finished);
        assert!(target.document("/db", "a.xml").is_none());
    }

    #[test]
    fn test_wrong_credentials_are_rejected() {
        let temp = TempDir::new().unwrap();
        let source = MemoryStore::new();
        let backup = export(&source, temp.path(), false);

        let mut target = MemoryStore::new();
        let mut listener = RecordingListener::default();
        let result = Restore::new(&mut target).restore(
            &Credentials::new(ADMIN_ACCOUNT, "wrong"),
            None,
            &backup,
            &mut listener,
            false,
        );
        assert!(matches!(result, Err(BackupError::Storage(_))));
        assert!(listener.finished);
    }

    #[test]
    fn test_installed_apps_are_not_downgraded() {
        let temp = TempDir::new().unwrap();
        let mut source = MemoryStore::new();
        source.create_collection("/db/apps/demo").unwrap();
        source
            .put_xml(
                "/db/apps/demo",
                PACKAGE_DESCRIPTOR,
                r#"<package xmlns="http://expath.org/ns/pkg" abbrev="demo" version="1.0.0"/>"#,
            )
            .unwrap();
        source.put_xml("/db/apps/demo", "index.xml", "<page/>").unwrap();
        let backup = export(&source, temp.path(), false);

        let mut target = MemoryStore::new();
        target.install_package("/db/apps/demo", "2.0.0");
        let (result, listener) = restore(&mut target, &backup, false);
        result.unwrap();
        assert_eq!(listener.skipped.len(), 1);
        assert_eq!(listener.skipped[0].1, 2);
        assert!(listener.skipped[0].0.starts_with("Skipping app path"));
        assert!(target.document("/db/apps/demo", "index.xml").is_none());

        let (result, listener) = restore(&mut target, &backup, true);
        result.unwrap();
        assert!(listener.skipped.is_empty());
        assert!(target.document("/db/apps/demo", "index.xml").is_some());
    }

    #[test]
    fn test_new_admin_password_is_applied() {
        let temp = TempDir::new().unwrap();
        let backup = export(&MemoryStore::new(), temp.path(), false);

        let mut target = MemoryStore::new();
        let mut listener = RecordingListener::default();
        Restore::new(&mut target)
            .restore(&admin(), Some("s3cret"), &backup, &mut listener, false)
            .unwrap();
        assert!(target.authenticate(&Credentials::new(ADMIN_ACCOUNT, "s3cret")).is_ok());
        assert!(target.authenticate(&admin()).is_err());
    }

    #[test]
    fn test_resource_without_name_uses_unescaped_filename() {
        let temp = TempDir::new().unwrap();
        let mut source = MemoryStore::new();
        source.create_collection("/db/data").unwrap();
        source.put_xml("/db/data", "q:1.xml", "<q/>").unwrap();
        let backup = export(&source, temp.path(), false);

        let manifest = backup.join("db/data").join(CONTENTS_FILE);
        let text = std::fs::read_to_string(&manifest).unwrap();
        assert!(text.contains(r#" name="q:1.xml""#), "{}", text);
        std::fs::write(&manifest, text.replace(r#" name="q:1.xml""#, "")).unwrap();

        let mut target = MemoryStore::new();
        let (result, listener) = restore(&mut target, &backup, false);
        result.unwrap();
        assert!(listener.warnings.is_empty(), "{:?}", listener.warnings);
        assert_eq!(listener.restored, vec!["q:1.xml".to_string()]);
        assert!(target.document("/db/data", "q:1.xml").is_some());
    }

    #[test]
    fn test_cancelled_restore_stops() {
        let temp = TempDir::new().unwrap();
        let mut source = MemoryStore::new();
        source.put_xml("/db", "a.xml", "<a/>").unwrap();
        let backup = export(&source, temp.path(), false);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut target = MemoryStore::new();
        let mut listener = RecordingListener::default();
        let result = Restore::new(&mut target)
            .with_cancel(cancel)
            .restore(&admin(), None, &backup, &mut listener, false);
        assert!(matches!(result, Err(BackupError::Terminated)));
        assert!(target.document("/db", "a.xml").is_none());
    }
}
