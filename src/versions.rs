use std::fs;
use std::sync::Arc;

use crate::audit::{AuditLog, Operation};
use crate::error::{Result, VersionError};
use crate::hierarchy::{Hierarchy, RootKind};
use crate::manifest::{self, ManifestProducer};
use crate::paths;
use crate::snapshot;
use crate::store::{FolderId, FolderRecord, Sort};
use crate::tale::{Tale, TaleStore};

/// Version lifecycle: immutable hard-linked snapshots of a tale workspace
/// plus its serialized metadata. All mutations of a tale's version tree run
/// under that tale's critical section.
#[derive(Clone)]
pub struct VersionEngine {
    hierarchy: Hierarchy,
    tales: Arc<TaleStore>,
    manifest: Arc<dyn ManifestProducer>,
    audit: Arc<AuditLog>,
}

impl VersionEngine {
    pub fn new(
        hierarchy: Hierarchy,
        tales: Arc<TaleStore>,
        manifest: Arc<dyn ManifestProducer>,
        audit: Arc<AuditLog>,
    ) -> Self {
        VersionEngine { hierarchy, tales, manifest, audit }
    }

    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    /// Create a new version of the tale's workspace.
    ///
    /// Unless `force` is set, creation short-circuits with
    /// [`VersionError::NotModified`] when the workspace and project metadata
    /// are identical to the last version or to the version the tale was
    /// restored from.
    pub fn create(
        &self,
        tale_id: &FolderId,
        name: Option<&str>,
        force: bool,
        allow_rename: bool,
    ) -> Result<FolderRecord> {
        let tale = self.tales.load(tale_id)?;
        let root_id = RootKind::Versions.root_id(&tale)?.clone();
        let _section = self.hierarchy.lock_root(&root_id)?;

        let name = match name {
            Some(n) => n.to_string(),
            None => self.hierarchy.generate_name(),
        };
        let name = self.hierarchy.check_name_sanity(&name, &root_id, allow_rename)?;

        let last = self.last_version(&root_id)?;
        let last_restore =
            tale.restored_from.as_ref().and_then(|id| self.hierarchy.store().try_load(id));

        if !force {
            // Order matters: the restore source first, then the newest
            // version.
            let mut checked: Option<FolderId> = None;
            for candidate in [last_restore.as_ref(), last.as_ref()].into_iter().flatten() {
                if checked.as_ref() == Some(&candidate.id) {
                    continue;
                }
                if self.unchanged_since(&tale, candidate)? {
                    return Err(VersionError::NotModified { version_id: candidate.id.clone() });
                }
                checked = Some(candidate.id.clone());
            }
        }

        let tale_dir =
            paths::ensure_tale_dir(&self.hierarchy.config().versions_root, &tale.id)?;
        let new_version = self.hierarchy.create_subdir(&tale_dir, &root_id, &name)?;

        if let Err(e) = self.snapshot(last.as_ref(), &tale, &new_version) {
            self.rollback_version(&new_version);
            return Err(e);
        }

        self.tales.touch(tale_id)?;
        self.audit.record(
            Operation::VersionCreate,
            Some(tale_id),
            Some(&new_version.id),
            new_version.name.clone(),
        );
        Ok(self.hierarchy.store().load(&new_version.id)?)
    }

    /// Write the version's documents and hard-link the workspace into it.
    fn snapshot(&self, last: Option<&FolderRecord>, tale: &Tale, version: &FolderRecord) -> Result<()> {
        let version_dir = version
            .fs_path
            .as_ref()
            .ok_or_else(|| VersionError::NotFound(version.id.to_string()))?;

        let manifest_json =
            self.manifest.dump_manifest(tale, Some((&version.id, &version.name)))?;
        fs::write(paths::manifest_file(version_dir), manifest_json)?;
        let environment_json = self.manifest.dump_environment(tale)?;
        fs::write(paths::environment_file(version_dir), environment_json)?;

        let new_workspace = paths::workspace_dir(version_dir);
        fs::create_dir(&new_workspace)?;
        let old_workspace = last.and_then(|l| l.fs_path.as_deref()).map(paths::workspace_dir);
        snapshot::snapshot_recursive(
            old_workspace.as_deref(),
            &tale.workspace_path,
            &new_workspace,
        )?;
        Ok(())
    }

    fn rollback_version(&self, version: &FolderRecord) {
        if let Some(path) = &version.fs_path {
            if let Err(e) = fs::remove_dir_all(path) {
                log::warn!("Rollback: failed to remove {:?}: {}", path, e);
            }
        }
        if let Err(e) = self.hierarchy.store().remove(&version.id) {
            log::warn!("Rollback: failed to remove record {}: {}", version.id, e);
        }
    }

    /// True when `version` captures exactly the tale's current metadata and
    /// workspace (by inode identity).
    fn unchanged_since(&self, tale: &Tale, version: &FolderRecord) -> Result<bool> {
        let Some(version_dir) = version.fs_path.as_deref() else {
            return Ok(false);
        };
        let manifest_json = match fs::read_to_string(paths::manifest_file(version_dir)) {
            Ok(s) => s,
            Err(_) => return Ok(false),
        };
        let environment_json = match fs::read_to_string(paths::environment_file(version_dir)) {
            Ok(s) => s,
            Err(_) => return Ok(false),
        };
        let stored = manifest::restore_tale(&manifest_json, &environment_json)?;
        if stored != manifest::restored_from_live(tale) {
            return Ok(false);
        }

        let version_workspace = paths::workspace_dir(version_dir);
        Ok(snapshot::same_tree(Some(&version_workspace), &tale.workspace_path)?)
    }

    /// Newest version under a root. The store answers this; there is no
    /// efficient "latest subdir" on a POSIX filesystem.
    fn last_version(&self, root_id: &FolderId) -> Result<Option<FolderRecord>> {
        Ok(self
            .hierarchy
            .store()
            .child_folders(root_id, Sort::created_desc(), 1, 0)?
            .into_iter()
            .next())
    }

    pub fn list(
        &self,
        tale_id: &FolderId,
        sort: Sort,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FolderRecord>> {
        let tale = self.tales.load(tale_id)?;
        let root_id = RootKind::Versions.root_id(&tale)?;
        Ok(self.hierarchy.store().child_folders(root_id, sort, limit, offset)?)
    }

    pub fn load(&self, version_id: &FolderId) -> Result<FolderRecord> {
        Ok(self.hierarchy.store().load(version_id)?)
    }

    pub fn exists(&self, tale_id: &FolderId, name: &str) -> Result<Option<FolderRecord>> {
        let tale = self.tales.load(tale_id)?;
        let root_id = RootKind::Versions.root_id(&tale)?;
        Ok(self.hierarchy.store().find_by_name(root_id, name)?)
    }

    /// Rename a version. The manifest embeds the version name, so it is
    /// rewritten in place.
    pub fn rename(
        &self,
        version_id: &FolderId,
        new_name: &str,
        allow_rename: bool,
    ) -> Result<FolderRecord> {
        let renamed = self.hierarchy.rename_child(version_id, new_name, allow_rename)?;

        if let Some(version_dir) = renamed.fs_path.as_deref() {
            let manifest_path = paths::manifest_file(version_dir);
            let manifest_json = fs::read_to_string(&manifest_path)?;
            let rewritten = manifest::set_version_name(&manifest_json, &renamed.name)?;
            fs::write(&manifest_path, rewritten)?;
        }

        self.audit.record(Operation::VersionRename, None, Some(version_id), renamed.name.clone());
        Ok(renamed)
    }

    /// Delete a version: blocked while any live run references it.
    pub fn delete(&self, version_id: &FolderId) -> Result<()> {
        let removed = self.hierarchy.remove_to_trash(version_id, true)?;

        // Bubble the change up to the tale record.
        if let Some(root_id) = &removed.parent_id {
            if let Some(root) = self.hierarchy.store().try_load(root_id) {
                if let Some(tale_id) = &root.tale_id {
                    let _ = self.tales.touch(tale_id);
                    self.audit.record(
                        Operation::VersionDelete,
                        Some(tale_id),
                        Some(version_id),
                        removed.name.clone(),
                    );
                }
            }
        }
        Ok(())
    }

    /// Replace the tale's workspace and metadata with a version's snapshot.
    pub fn restore(&self, tale_id: &FolderId, version_id: &FolderId) -> Result<Tale> {
        let tale = self.tales.load(tale_id)?;
        let version = self.hierarchy.store().load(version_id)?;
        let root_id = RootKind::Versions.root_id(&tale)?.clone();
        if version.parent_id.as_ref() != Some(&root_id) {
            return Err(VersionError::NotFound(version_id.to_string()));
        }
        let version_dir = version
            .fs_path
            .as_deref()
            .ok_or_else(|| VersionError::NotFound(version_id.to_string()))?;

        let _section = self.hierarchy.lock_root(&root_id)?;

        let workspace = &tale.workspace_path;
        if workspace.exists() {
            fs::remove_dir_all(workspace)?;
        }
        fs::create_dir_all(workspace)?;
        snapshot::snapshot_recursive(None, &paths::workspace_dir(version_dir), workspace)?;

        let manifest_json = fs::read_to_string(paths::manifest_file(version_dir))?;
        let environment_json = fs::read_to_string(paths::environment_file(version_dir))?;
        let restored = manifest::restore_tale(&manifest_json, &environment_json)?;

        let tale = self.tales.update(tale_id, |t| {
            t.title = restored.title.clone();
            t.metadata = restored.metadata.clone();
            t.data_set = restored.data_set.clone();
            t.environment = restored.environment.clone();
            t.restored_from = Some(version_id.clone());
            t.updated = chrono::Utc::now();
        })?;

        self.audit.record(Operation::VersionRestore, Some(tale_id), Some(version_id), "");
        Ok(tale)
    }

    /// Make sure a version exists before export/publish. A supplied id is
    /// used as-is; otherwise a version is created, with the "not modified"
    /// answer resolving to the existing one. Either way the version is
    /// touched so it bubbles to the top of most-recently-used listings.
    pub fn ensure_version(
        &self,
        tale_id: &FolderId,
        version_id: Option<&FolderId>,
    ) -> Result<FolderRecord> {
        let id = match version_id {
            Some(id) => id.clone(),
            None => match self.create(tale_id, None, false, true) {
                Ok(version) => version.id,
                Err(VersionError::NotModified { version_id }) => version_id,
                Err(e) => return Err(e),
            },
        };
        self.hierarchy.store().touch(&id)?;
        Ok(self.hierarchy.store().load(&id)?)
    }

    /// Dataset recorded in the version's manifest.
    pub fn data_set(&self, version_id: &FolderId) -> Result<serde_json::Value> {
        let version = self.hierarchy.store().load(version_id)?;
        let version_dir = version
            .fs_path
            .as_deref()
            .ok_or_else(|| VersionError::NotFound(version_id.to_string()))?;
        let manifest_json = fs::read_to_string(paths::manifest_file(version_dir))?;
        manifest::data_set_from_manifest(&manifest_json)
    }

    /// Administrative: drop every version record of a tale without touching
    /// the directories on disk.
    pub fn clear(&self, tale_id: &FolderId) -> Result<usize> {
        let tale = self.tales.load(tale_id)?;
        let root_id = RootKind::Versions.root_id(&tale)?;
        let children = self.hierarchy.store().child_folders(root_id, Sort::created(), 0, 0)?;
        let mut removed = 0;
        for child in &children {
            self.hierarchy.store().remove(&child.id)?;
            removed += 1;
        }
        Ok(removed)
    }
}
