use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditLog, Operation};
use crate::config::Config;
use crate::error::{Result, VersionError};
use crate::fork::{ForkHandler, ForkOutcome};
use crate::hierarchy::{Hierarchy, RootKind};
use crate::jobs::{LocalQueue, TaskQueue};
use crate::manifest::{JsonManifestProducer, ManifestProducer};
use crate::paths;
use crate::reaper::HeartbeatReaper;
use crate::runs::RunEngine;
use crate::store::{FolderId, FolderRecord, FolderStore};
use crate::tale::{Tale, TaleStore, RUNS_ROOT_NAME, VERSIONS_ROOT_NAME};
use crate::versions::VersionEngine;

/// Wires the stores and engines together and exposes the tale lifecycle
/// hooks the enclosing service calls directly: `on_tale_created`,
/// `on_tale_removed`, `on_tale_copied` and `ensure_version_before_export`.
///
/// Opening a service also performs crash recovery: any critical-section flag
/// a dead process left behind is cleared.
pub struct VersioningService {
    config: Config,
    store: Arc<FolderStore>,
    tales: Arc<TaleStore>,
    audit: Arc<AuditLog>,
    queue: Arc<dyn TaskQueue>,
    local_queue: Option<Arc<LocalQueue>>,
    versions: VersionEngine,
    runs: RunEngine,
    fork: ForkHandler,
}

impl VersioningService {
    /// Persistent service: records live under `config.metadata_root`.
    pub fn open(config: Config) -> Result<Self> {
        config.ensure_roots()?;
        let store = Arc::new(FolderStore::open(config.metadata_root.join("folders"))?);
        let tales = Arc::new(TaleStore::open(config.metadata_root.join("tales"))?);
        let local = Arc::new(LocalQueue::new());
        Self::assemble(config, store, tales, local.clone(), Some(local), Arc::new(JsonManifestProducer))
    }

    /// Everything in memory; records die with the process.
    pub fn in_memory(config: Config) -> Result<Self> {
        config.ensure_roots()?;
        let store = Arc::new(FolderStore::in_memory());
        let tales = Arc::new(TaleStore::in_memory());
        let local = Arc::new(LocalQueue::new());
        Self::assemble(config, store, tales, local.clone(), Some(local), Arc::new(JsonManifestProducer))
    }

    /// Fully custom wiring (external queue, external manifest producer).
    pub fn with_components(
        config: Config,
        store: Arc<FolderStore>,
        tales: Arc<TaleStore>,
        queue: Arc<dyn TaskQueue>,
        manifest: Arc<dyn ManifestProducer>,
    ) -> Result<Self> {
        config.ensure_roots()?;
        Self::assemble(config, store, tales, queue, None, manifest)
    }

    fn assemble(
        config: Config,
        store: Arc<FolderStore>,
        tales: Arc<TaleStore>,
        queue: Arc<dyn TaskQueue>,
        local_queue: Option<Arc<LocalQueue>>,
        manifest: Arc<dyn ManifestProducer>,
    ) -> Result<Self> {
        if let Err(errors) = config.validate() {
            return Err(VersionError::Storage(crate::store::StoreError::Unavailable(
                errors.join("; "),
            )));
        }
        store.reset_crashed_critical_sections()?;

        let audit = Arc::new(AuditLog::default());
        let hierarchy = Hierarchy::new(Arc::clone(&store), config.clone());
        let versions = VersionEngine::new(
            hierarchy.clone(),
            Arc::clone(&tales),
            Arc::clone(&manifest),
            Arc::clone(&audit),
        );
        let runs = RunEngine::new(
            hierarchy.clone(),
            Arc::clone(&tales),
            Arc::clone(&queue),
            Arc::clone(&audit),
        );
        let fork = ForkHandler::new(
            hierarchy,
            Arc::clone(&tales),
            manifest,
            versions.clone(),
            Arc::clone(&audit),
        );

        Ok(VersioningService {
            config,
            store,
            tales,
            audit,
            queue,
            local_queue,
            versions,
            runs,
            fork,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &FolderStore {
        &self.store
    }

    pub fn tales(&self) -> &TaleStore {
        &self.tales
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn versions(&self) -> &VersionEngine {
        &self.versions
    }

    pub fn runs(&self) -> &RunEngine {
        &self.runs
    }

    pub fn fork(&self) -> &ForkHandler {
        &self.fork
    }

    pub fn queue(&self) -> Arc<dyn TaskQueue> {
        Arc::clone(&self.queue)
    }

    /// The built-in queue, when the service was not wired to an external
    /// one. Tests use this to steer worker state.
    pub fn local_queue(&self) -> Option<&LocalQueue> {
        self.local_queue.as_deref()
    }

    /// Convenience wrapper: persist a new tale and run its creation hook.
    pub fn create_tale(
        &self,
        title: &str,
        creator_user_id: &str,
        workspace: &Path,
    ) -> Result<Tale> {
        fs::create_dir_all(workspace)?;
        let tale = Tale::new(title, creator_user_id, workspace);
        self.tales.save(&tale)?;
        self.on_tale_created(&tale.id)
    }

    /// Hook: a tale was created. Appends the two root folder records and the
    /// two on-disk root directories (each with its `.trash`).
    pub fn on_tale_created(&self, tale_id: &FolderId) -> Result<Tale> {
        let tale = self.tales.load(tale_id)?;

        let mut versions_root_id = None;
        let mut runs_root_id = None;
        for kind in [RootKind::Versions, RootKind::Runs] {
            let name = match kind {
                RootKind::Versions => VERSIONS_ROOT_NAME,
                RootKind::Runs => RUNS_ROOT_NAME,
            };
            let mut root = FolderRecord::new(None, name);
            root.seq = Some(0);
            root.tale_id = Some(tale.id.clone());
            if kind == RootKind::Versions {
                root.critical_section = Some(false);
            }
            self.store.save(&root)?;
            paths::ensure_tale_dir(kind.root_dir(&self.config), &tale.id)?;

            match kind {
                RootKind::Versions => versions_root_id = Some(root.id),
                RootKind::Runs => runs_root_id = Some(root.id),
            }
        }

        let tale = self.tales.update(tale_id, |t| {
            t.versions_root_id = versions_root_id.clone();
            t.runs_root_id = runs_root_id.clone();
        })?;
        self.audit.record(Operation::TaleCreate, Some(tale_id), None, tale.title.clone());
        Ok(tale)
    }

    /// Hook: a tale is being removed. Drops the root records, every child
    /// record under them, and both on-disk trees (trash included).
    pub fn on_tale_removed(&self, tale_id: &FolderId) -> Result<()> {
        let tale = self.tales.load(tale_id)?;

        for kind in [RootKind::Runs, RootKind::Versions] {
            if let Ok(root_id) = kind.root_id(&tale) {
                let children = self.store.child_folders(root_id, Default::default(), 0, 0)?;
                for child in children {
                    self.store.remove(&child.id)?;
                }
                self.store.remove(root_id)?;
            }
            let dir = paths::tale_dir(kind.root_dir(&self.config), &tale.id);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
        }

        self.audit.record(Operation::TaleRemove, Some(tale_id), None, tale.title.clone());
        Ok(())
    }

    /// Remove a tale entirely: lifecycle hook plus the tale record itself.
    pub fn remove_tale(&self, tale_id: &FolderId) -> Result<()> {
        self.on_tale_removed(tale_id)?;
        self.tales.remove(tale_id)?;
        Ok(())
    }

    /// Hook: a tale was copied. Duplicates the source's versions and runs
    /// into the destination.
    pub fn on_tale_copied(
        &self,
        source_id: &FolderId,
        destination_id: &FolderId,
        target_version: Option<&FolderId>,
        shallow: bool,
    ) -> Result<ForkOutcome> {
        self.fork.copy(source_id, destination_id, target_version, shallow)
    }

    /// Hook: export/publish needs a version to operate on.
    pub fn ensure_version_before_export(
        &self,
        tale_id: &FolderId,
        version_id: Option<&FolderId>,
    ) -> Result<FolderRecord> {
        self.versions.ensure_version(tale_id, version_id)
    }

    pub fn start_reaper(&self, interval: Duration) -> HeartbeatReaper {
        HeartbeatReaper::start(self.runs.clone(), Arc::clone(&self.queue), interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, VersioningService) {
        let tmp = tempfile::tempdir().unwrap();
        let service = VersioningService::in_memory(Config::under(tmp.path())).unwrap();
        (tmp, service)
    }

    #[test]
    fn test_tale_creation_builds_roots() {
        let (tmp, service) = setup();
        let tale = service.create_tale("Demo", "u1", &tmp.path().join("ws")).unwrap();

        let versions_root = service.store().load(tale.versions_root_id.as_ref().unwrap()).unwrap();
        assert_eq!(versions_root.name, VERSIONS_ROOT_NAME);
        assert_eq!(versions_root.seq, Some(0));
        assert_eq!(versions_root.critical_section, Some(false));
        assert_eq!(versions_root.tale_id, Some(tale.id.clone()));

        let runs_root = service.store().load(tale.runs_root_id.as_ref().unwrap()).unwrap();
        assert_eq!(runs_root.name, RUNS_ROOT_NAME);

        let versions_dir = paths::tale_dir(&service.config().versions_root, &tale.id);
        let runs_dir = paths::tale_dir(&service.config().runs_root, &tale.id);
        assert!(paths::trash_dir(&versions_dir).is_dir());
        assert!(paths::trash_dir(&runs_dir).is_dir());
    }

    #[test]
    fn test_tale_removal_cleans_up() {
        let (tmp, service) = setup();
        let workspace = tmp.path().join("ws");
        fs::create_dir_all(&workspace).unwrap();
        fs::write(workspace.join("a.txt"), "a").unwrap();
        let tale = service.create_tale("Demo", "u1", &workspace).unwrap();
        let version = service.versions().create(&tale.id, Some("v1"), false, false).unwrap();

        service.remove_tale(&tale.id).unwrap();

        assert!(service.tales().load(&tale.id).is_err());
        assert!(service.store().try_load(&version.id).is_none());
        assert!(!paths::tale_dir(&service.config().versions_root, &tale.id).exists());
        assert!(!paths::tale_dir(&service.config().runs_root, &tale.id).exists());
    }

    #[test]
    fn test_open_clears_stuck_critical_sections() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::under(tmp.path());
        let root_id;
        {
            let service = VersioningService::open(config.clone()).unwrap();
            let tale = service.create_tale("Demo", "u1", &tmp.path().join("ws")).unwrap();
            root_id = tale.versions_root_id.clone().unwrap();
            // Simulate a crash while holding the section.
            service
                .store()
                .update(&root_id, |r| r.critical_section = Some(true))
                .unwrap();
        }

        let reopened = VersioningService::open(config).unwrap();
        assert_eq!(reopened.store().load(&root_id).unwrap().critical_section, Some(false));
    }

    #[test]
    fn test_ensure_version_before_export_passthrough() {
        let (tmp, service) = setup();
        let workspace = tmp.path().join("ws");
        fs::create_dir_all(&workspace).unwrap();
        fs::write(workspace.join("a.txt"), "a").unwrap();
        let tale = service.create_tale("Demo", "u1", &workspace).unwrap();

        let created = service.ensure_version_before_export(&tale.id, None).unwrap();
        let explicit =
            service.ensure_version_before_export(&tale.id, Some(&created.id)).unwrap();
        assert_eq!(created.id, explicit.id);
    }
}
