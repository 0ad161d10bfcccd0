use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::Arc;

use crate::audit::{AuditLog, Operation};
use crate::error::{Result, VersionError};
use crate::hierarchy::{Hierarchy, RootKind};
use crate::manifest::ManifestProducer;
use crate::paths;
use crate::snapshot;
use crate::store::{FolderId, FolderRecord, Sort};
use crate::tale::TaleStore;
use crate::versions::VersionEngine;

/// Outcome of duplicating one tale's history into another.
#[derive(Debug, Default)]
pub struct ForkOutcome {
    /// Source version id -> cloned version id.
    pub version_id_map: BTreeMap<FolderId, FolderId>,
    pub versions_copied: usize,
    pub runs_copied: usize,
}

/// Deep duplication of a tale's versions and runs into another tale, with
/// every run's `version` symlink rewritten to point into the destination's
/// version tree.
#[derive(Clone)]
pub struct ForkHandler {
    hierarchy: Hierarchy,
    tales: Arc<TaleStore>,
    manifest: Arc<dyn ManifestProducer>,
    versions: VersionEngine,
    audit: Arc<AuditLog>,
}

impl ForkHandler {
    pub fn new(
        hierarchy: Hierarchy,
        tales: Arc<TaleStore>,
        manifest: Arc<dyn ManifestProducer>,
        versions: VersionEngine,
        audit: Arc<AuditLog>,
    ) -> Self {
        ForkHandler { hierarchy, tales, manifest, versions, audit }
    }

    /// Copy `source` tale's history into `destination`.
    ///
    /// With `shallow`, only `target_version` (and the runs derived from it)
    /// is copied; a shallow request without a target is a no-op. When a
    /// target is given the destination workspace is restored to the cloned
    /// version at the end.
    pub fn copy(
        &self,
        source_id: &FolderId,
        destination_id: &FolderId,
        target_version: Option<&FolderId>,
        shallow: bool,
    ) -> Result<ForkOutcome> {
        if shallow && target_version.is_none() {
            return Ok(ForkOutcome::default());
        }

        let source = self.tales.load(source_id)?;
        let destination = self.tales.load(destination_id)?;
        let mut outcome = ForkOutcome::default();

        // Versions first: run rewiring needs the id map.
        for kind in [RootKind::Versions, RootKind::Runs] {
            let src_root_id = kind.root_id(&source)?;
            let dst_root_id = kind.root_id(&destination)?.clone();
            let dst_tale_dir =
                paths::ensure_tale_dir(kind.root_dir(self.hierarchy.config()), &destination.id)?;

            let children =
                self.hierarchy.store().child_folders(src_root_id, Sort::created(), 0, 0)?;
            for child in children {
                if shallow
                    && kind == RootKind::Versions
                    && target_version != Some(&child.id)
                {
                    continue;
                }
                match kind {
                    RootKind::Versions => {
                        let clone =
                            self.clone_child(&child, &dst_root_id, &dst_tale_dir)?;
                        outcome.version_id_map.insert(child.id.clone(), clone.id.clone());
                        self.hierarchy.store().save(&clone)?;
                        outcome.versions_copied += 1;
                    }
                    RootKind::Runs => {
                        let mut clone =
                            self.clone_child(&child, &dst_root_id, &dst_tale_dir)?;
                        match self.rewire_run(&mut clone, &destination.id, &outcome.version_id_map)
                        {
                            Ok(()) => {
                                self.hierarchy.store().save(&clone)?;
                                outcome.runs_copied += 1;
                            }
                            Err(e) => {
                                // A run whose version was not exported (or
                                // whose link is broken) is dropped, not
                                // cloned half-wired.
                                log::warn!(
                                    "Skipping run {:?} while copying tale {}: {}",
                                    child.name,
                                    source_id,
                                    e
                                );
                                if let Some(dir) = &clone.fs_path {
                                    let _ = fs::remove_dir_all(dir);
                                }
                            }
                        }
                    }
                }
            }
            self.hierarchy.store().touch(&dst_root_id)?;
        }

        self.regenerate_manifests(&destination.id, &outcome.version_id_map)?;
        self.recompute_reference_counts(&destination, &outcome.version_id_map)?;

        if let Some(target) = target_version {
            let mapped = outcome
                .version_id_map
                .get(target)
                .ok_or_else(|| VersionError::NotFound(target.to_string()))?
                .clone();
            self.versions.restore(&destination.id, &mapped)?;
        }

        self.tales.touch(destination_id)?;
        self.audit.record(
            Operation::Fork,
            Some(destination_id),
            None,
            format!(
                "from {} ({} versions, {} runs)",
                source_id, outcome.versions_copied, outcome.runs_copied
            ),
        );
        Ok(outcome)
    }

    /// Clone one child record and its directory tree. Display name, custom
    /// fields and timestamps are preserved; the id (and with it the
    /// directory name) is new.
    fn clone_child(
        &self,
        src: &FolderRecord,
        dst_root_id: &FolderId,
        dst_tale_dir: &std::path::Path,
    ) -> Result<FolderRecord> {
        let src_dir = src
            .fs_path
            .as_deref()
            .ok_or_else(|| VersionError::NotFound(src.id.to_string()))?;

        let mut clone = FolderRecord::new(Some(dst_root_id.clone()), src.name.as_str());
        clone.extra = src.extra.clone();
        clone.run_status = src.run_status;
        clone.created = src.created;
        clone.updated = src.updated;
        clone.is_mapping = true;

        let clone_dir = dst_tale_dir.join(clone.id.as_str());
        fs::create_dir_all(&clone_dir)?;
        clone.fs_path = Some(crate::hierarchy::absolutize(&clone_dir));
        snapshot::copy_tree_preserving_links(src_dir, &clone_dir)?;
        Ok(clone)
    }

    /// Point a cloned run's `version` symlink (and `run_version_id`) at the
    /// cloned version in the destination tale.
    fn rewire_run(
        &self,
        clone: &mut FolderRecord,
        destination_tale_id: &FolderId,
        version_id_map: &BTreeMap<FolderId, FolderId>,
    ) -> Result<()> {
        let clone_dir = clone
            .fs_path
            .as_deref()
            .ok_or_else(|| VersionError::NotFound(clone.id.to_string()))?;
        let link_path = clone_dir.join(paths::VERSION_LINK_NAME);

        let target = fs::read_link(&link_path)?;
        let src_version_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| VersionError::NotFound(format!("{:?}", target)))?;
        let src_version_id = FolderId::parse(src_version_name)?;
        let mapped = version_id_map
            .get(&src_version_id)
            .ok_or_else(|| VersionError::NotFound(src_version_id.to_string()))?;

        fs::remove_file(&link_path)?;
        std::os::unix::fs::symlink(
            paths::version_link_target(destination_tale_id, mapped),
            &link_path,
        )?;
        clone.run_version_id = Some(mapped.clone());
        Ok(())
    }

    /// Every cloned version gets a manifest describing the destination tale,
    /// under its new version id.
    fn regenerate_manifests(
        &self,
        destination_id: &FolderId,
        version_id_map: &BTreeMap<FolderId, FolderId>,
    ) -> Result<()> {
        let destination = self.tales.load(destination_id)?;
        for dst_version_id in version_id_map.values() {
            let clone = self.hierarchy.store().load(dst_version_id)?;
            let Some(dir) = clone.fs_path.as_deref() else {
                continue;
            };
            let manifest_json =
                self.manifest.dump_manifest(&destination, Some((&clone.id, &clone.name)))?;
            fs::write(paths::manifest_file(dir), manifest_json)?;
        }
        Ok(())
    }

    /// Counters restate the actual cloned runs; in a shallow fork the source
    /// counters would otherwise refer to runs that were never copied.
    fn recompute_reference_counts(
        &self,
        destination: &crate::tale::Tale,
        version_id_map: &BTreeMap<FolderId, FolderId>,
    ) -> Result<()> {
        let runs_root_id = RootKind::Runs.root_id(destination)?;
        let runs = self.hierarchy.store().child_folders(runs_root_id, Sort::created(), 0, 0)?;
        let mut counts: HashMap<FolderId, i64> = HashMap::new();
        for run in &runs {
            if let Some(version_id) = &run.run_version_id {
                *counts.entry(version_id.clone()).or_insert(0) += 1;
            }
        }
        for dst_version_id in version_id_map.values() {
            let count = counts.get(dst_version_id).copied().unwrap_or(0);
            self.hierarchy.store().update(dst_version_id, |r| r.ref_count = Some(count))?;
        }
        Ok(())
    }
}
