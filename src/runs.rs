use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditLog, Operation};
use crate::error::{Result, VersionError};
use crate::hierarchy::{Hierarchy, RootKind};
use crate::jobs::{Credential, JobHandle, JobStatus, TaskQueue, DEFAULT_ENTRYPOINT,
                  FINISHED_JOB_CREDENTIAL_TTL};
use crate::paths;
use crate::snapshot;
use crate::store::{FolderId, FolderRecord, RunMeta, Sort};
use crate::tale::TaleStore;

/// Run lifecycle states. `Completed`, `Failed` and `Cancelled` are sinks:
/// once reached, no transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Unknown = 0,
    Starting = 1,
    Running = 2,
    Completed = 3,
    Failed = 4,
    Cancelled = 5,
}

impl RunStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            RunStatus::Unknown => "UNKNOWN",
            RunStatus::Starting => "STARTING",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_code(code: i32) -> Option<RunStatus> {
        match code {
            0 => Some(RunStatus::Unknown),
            1 => Some(RunStatus::Starting),
            2 => Some(RunStatus::Running),
            3 => Some(RunStatus::Completed),
            4 => Some(RunStatus::Failed),
            5 => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Credential lifetime handed to a freshly dispatched job.
const JOB_CREDENTIAL_TTL: Duration = Duration::from_secs(12 * 3600);

/// Run lifecycle: each run owns a snapshot of its version's workspace, a
/// symlink back to the version, and a status mirrored between the record and
/// the on-disk `.status` file.
#[derive(Clone)]
pub struct RunEngine {
    hierarchy: Hierarchy,
    tales: Arc<TaleStore>,
    queue: Arc<dyn TaskQueue>,
    audit: Arc<AuditLog>,
}

impl RunEngine {
    pub fn new(
        hierarchy: Hierarchy,
        tales: Arc<TaleStore>,
        queue: Arc<dyn TaskQueue>,
        audit: Arc<AuditLog>,
    ) -> Self {
        RunEngine { hierarchy, tales, queue, audit }
    }

    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    pub fn queue(&self) -> &dyn TaskQueue {
        self.queue.as_ref()
    }

    /// Create a run derived from a version. Increments the version's
    /// reference count, which blocks deleting the version for as long as the
    /// run lives.
    pub fn create(
        &self,
        version_id: &FolderId,
        name: Option<&str>,
        allow_rename: bool,
    ) -> Result<FolderRecord> {
        let version = self.hierarchy.store().load(version_id)?;
        let versions_root_id = version
            .parent_id
            .clone()
            .ok_or_else(|| VersionError::NotFound(version_id.to_string()))?;
        let versions_root = self.hierarchy.store().load(&versions_root_id)?;
        let tale_id = versions_root
            .tale_id
            .clone()
            .ok_or_else(|| VersionError::NotFound(versions_root_id.to_string()))?;
        let tale = self.tales.load(&tale_id)?;
        let runs_root_id = RootKind::Runs.root_id(&tale)?.clone();

        let name = match name {
            Some(n) => n.to_string(),
            None => self.hierarchy.generate_name(),
        };
        let name = self.hierarchy.check_name_sanity(&name, &runs_root_id, allow_rename)?;

        let runs_dir = paths::ensure_tale_dir(&self.hierarchy.config().runs_root, &tale.id)?;
        let run = self.hierarchy.create_subdir(&runs_dir, &runs_root_id, &name)?;

        if let Err(e) = self.populate(&run, &version, &tale.id) {
            self.rollback_run(&run);
            return Err(e);
        }

        self.tales.touch(&tale_id)?;
        // The counter is what pins the version; a run that cannot pin it must
        // not exist.
        if let Err(e) = self.hierarchy.increment_reference_count(version_id) {
            self.rollback_run(&run);
            return Err(e);
        }

        self.audit.record(Operation::RunCreate, Some(&tale_id), Some(&run.id), run.name.clone());
        Ok(self.hierarchy.store().load(&run.id)?)
    }

    /// Fill a freshly created run directory: record fields, the relative
    /// `version` symlink, the workspace snapshot, and the `.status` file.
    fn populate(&self, run: &FolderRecord, version: &FolderRecord, tale_id: &FolderId) -> Result<()> {
        let run_dir = run
            .fs_path
            .as_deref()
            .ok_or_else(|| VersionError::NotFound(run.id.to_string()))?;
        let version_dir = version
            .fs_path
            .as_deref()
            .ok_or_else(|| VersionError::NotFound(version.id.to_string()))?;

        self.hierarchy.store().update(&run.id, |r| {
            r.run_version_id = Some(version.id.clone());
            r.run_status = Some(RunStatus::Unknown.code());
        })?;

        std::os::unix::fs::symlink(
            paths::version_link_target(tale_id, &version.id),
            run_dir.join(paths::VERSION_LINK_NAME),
        )?;

        let run_workspace = paths::workspace_dir(run_dir);
        fs::create_dir(&run_workspace)?;
        snapshot::snapshot_recursive(None, &paths::workspace_dir(version_dir), &run_workspace)?;

        write_status(run_dir, RunStatus::Unknown)?;
        Ok(())
    }

    fn rollback_run(&self, run: &FolderRecord) {
        if let Some(path) = &run.fs_path {
            if let Err(e) = fs::remove_dir_all(path) {
                log::warn!("Rollback: failed to remove {:?}: {}", path, e);
            }
        }
        if let Err(e) = self.hierarchy.store().remove(&run.id) {
            log::warn!("Rollback: failed to remove record {}: {}", run.id, e);
        }
    }

    /// Delete a run and release its hold on the version.
    pub fn delete(&self, run_id: &FolderId) -> Result<()> {
        let run = self.hierarchy.store().load(run_id)?;
        let removed = self.hierarchy.remove_to_trash(run_id, false)?;

        if let Some(version_id) = &run.run_version_id {
            self.hierarchy.decrement_reference_count(version_id)?;
        }

        self.audit.record(Operation::RunDelete, None, Some(run_id), removed.name.clone());
        Ok(())
    }

    pub fn list(
        &self,
        tale_id: &FolderId,
        sort: Sort,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FolderRecord>> {
        let tale = self.tales.load(tale_id)?;
        let root_id = RootKind::Runs.root_id(&tale)?;
        Ok(self.hierarchy.store().child_folders(root_id, sort, limit, offset)?)
    }

    pub fn load(&self, run_id: &FolderId) -> Result<FolderRecord> {
        Ok(self.hierarchy.store().load(run_id)?)
    }

    pub fn exists(&self, tale_id: &FolderId, name: &str) -> Result<Option<FolderRecord>> {
        let tale = self.tales.load(tale_id)?;
        let root_id = RootKind::Runs.root_id(&tale)?;
        Ok(self.hierarchy.store().find_by_name(root_id, name)?)
    }

    pub fn rename(&self, run_id: &FolderId, new_name: &str, allow_rename: bool) -> Result<FolderRecord> {
        let renamed = self.hierarchy.rename_child(run_id, new_name, allow_rename)?;
        self.audit.record(Operation::RunRename, None, Some(run_id), renamed.name.clone());
        Ok(renamed)
    }

    /// `(code, name)` for a run; a record without a status reads as
    /// `UNKNOWN`.
    pub fn get_status(&self, run_id: &FolderId) -> Result<(i32, &'static str)> {
        let run = self.hierarchy.store().load(run_id)?;
        let status = run
            .run_status
            .and_then(RunStatus::from_code)
            .unwrap_or(RunStatus::Unknown);
        Ok((status.code(), status.name()))
    }

    pub fn set_status_code(&self, run_id: &FolderId, code: i32) -> Result<()> {
        let status = RunStatus::from_code(code)
            .ok_or_else(|| VersionError::NotFound(format!("unknown run status code {}", code)))?;
        self.set_status(run_id, status)
    }

    /// Persist a status: record first, then the `.status` file. Terminal
    /// states are sinks; an attempt to leave one is dropped with a warning.
    pub fn set_status(&self, run_id: &FolderId, status: RunStatus) -> Result<()> {
        let run = self.hierarchy.store().load(run_id)?;
        let current = run
            .run_status
            .and_then(RunStatus::from_code)
            .unwrap_or(RunStatus::Unknown);
        if current.is_terminal() && status != current {
            log::warn!("Run {} is {} (terminal); ignoring transition to {}", run_id, current, status);
            return Ok(());
        }

        self.hierarchy.store().update(run_id, |r| r.run_status = Some(status.code()))?;
        if let Some(run_dir) = run.fs_path.as_deref() {
            // The record is already updated; the file is an advisory mirror,
            // but a failed write still surfaces.
            write_status(run_dir, status)?;
        }
        self.audit.record(Operation::RunStatus, None, Some(run_id), status.name());
        Ok(())
    }

    /// Dispatch the recorded-run job for this run and remember the worker
    /// identifiers for the heartbeat sweep.
    pub fn start(&self, run_id: &FolderId, entrypoint: Option<&str>) -> Result<JobHandle> {
        let run = self.hierarchy.store().load(run_id)?;
        let runs_root_id = run
            .parent_id
            .clone()
            .ok_or_else(|| VersionError::NotFound(run_id.to_string()))?;
        let runs_root = self.hierarchy.store().load(&runs_root_id)?;
        let tale_id = runs_root
            .tale_id
            .clone()
            .ok_or_else(|| VersionError::NotFound(runs_root_id.to_string()))?;

        let entrypoint = entrypoint.unwrap_or(DEFAULT_ENTRYPOINT);
        let handle = self.queue.submit_recorded_run(run_id, &tale_id, entrypoint)?;
        let credential = Credential::short_lived(JOB_CREDENTIAL_TTL);

        self.hierarchy.store().update(run_id, |r| {
            r.run_meta = Some(RunMeta {
                job_id: handle.job_id.clone(),
                queue: handle.queue.clone(),
                node_id: handle.node_id.clone(),
                container_name: handle.container_name.clone(),
                task_id: handle.task_id.clone(),
                credential: Some(credential.token.clone()),
            });
        })?;
        self.set_status(run_id, RunStatus::Starting)?;

        self.audit.record(Operation::RunStart, Some(&tale_id), Some(run_id), handle.job_id.clone());
        Ok(handle)
    }

    /// Correlate an external job event with this run. Applied only when the
    /// mapped status differs from the stored one; terminal states never
    /// change. Reaching a terminal state expires the job's credential.
    pub fn apply_job_event(&self, run_id: &FolderId, job_status: JobStatus) -> Result<()> {
        let mapped = match job_status {
            JobStatus::Queued | JobStatus::Running => RunStatus::Running,
            JobStatus::Success => RunStatus::Completed,
            JobStatus::Error => RunStatus::Failed,
        };

        let run = self.hierarchy.store().load(run_id)?;
        let current = run
            .run_status
            .and_then(RunStatus::from_code)
            .unwrap_or(RunStatus::Unknown);
        if current.is_terminal() || mapped == current {
            return Ok(());
        }

        self.set_status(run_id, mapped)?;

        if mapped.is_terminal() {
            if let Some(meta) = &run.run_meta {
                self.queue.expire_job_credential(&meta.job_id, FINISHED_JOB_CREDENTIAL_TTL)?;
            }
        }
        Ok(())
    }

    /// Runs the heartbeat sweep cares about: live-ish status with worker
    /// identifiers attached.
    pub fn heartbeat_candidates(&self) -> Result<Vec<FolderRecord>> {
        Ok(self.hierarchy.store().filter(|r| {
            matches!(
                r.run_status.and_then(RunStatus::from_code),
                Some(RunStatus::Running) | Some(RunStatus::Unknown)
            ) && r.run_meta.is_some()
                && r.run_version_id.is_some()
        })?)
    }
}

/// Single line `"<code> <NAME>"`.
pub fn write_status(run_dir: &Path, status: RunStatus) -> std::io::Result<()> {
    fs::write(paths::status_file(run_dir), format!("{} {}\n", status.code(), status.name()))
}
