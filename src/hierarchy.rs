use chrono::Local;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Result, VersionError};
use crate::paths;
use crate::store::{FolderId, FolderRecord, FolderStore, StoreError};
use crate::tale::Tale;

/// Which per-tale root an operation addresses. Version and run folders share
/// all of the hierarchy logic; the root they hang off is an explicit
/// parameter rather than a subclass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    Versions,
    Runs,
}

impl RootKind {
    pub fn root_id<'a>(&self, tale: &'a Tale) -> Result<&'a FolderId> {
        let id = match self {
            RootKind::Versions => tale.versions_root_id.as_ref(),
            RootKind::Runs => tale.runs_root_id.as_ref(),
        };
        id.ok_or_else(|| VersionError::NotFound(format!("tale {} has no {:?} root", tale.id, self)))
    }

    pub fn root_dir<'a>(&self, config: &'a Config) -> &'a Path {
        match self {
            RootKind::Versions => &config.versions_root,
            RootKind::Runs => &config.runs_root,
        }
    }
}

/// Shared hierarchy logic for the version and run engines: name handling,
/// subdir creation, the per-tale critical section, reference counters and
/// trash-on-delete.
#[derive(Clone)]
pub struct Hierarchy {
    store: Arc<FolderStore>,
    config: Config,
}

/// Holding this value means the caller owns the critical section of one
/// versions root. Dropped (or explicitly released), it clears the flag; a
/// release that fails is logged and left to the startup sweep.
pub struct CriticalSection<'a> {
    hierarchy: &'a Hierarchy,
    root_id: FolderId,
    released: bool,
}

impl CriticalSection<'_> {
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match self.hierarchy.update_critical_section_flag(&self.root_id, false) {
            Ok(true) => {}
            Ok(false) => {
                log::warn!("Critical section on {} was already clear", self.root_id)
            }
            Err(e) => log::error!("Failed to release critical section on {}: {}", self.root_id, e),
        }
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        self.do_release();
    }
}

impl Hierarchy {
    pub fn new(store: Arc<FolderStore>, config: Config) -> Self {
        Hierarchy { store, config }
    }

    pub fn store(&self) -> &FolderStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Default name for versions and runs created without one.
    pub fn generate_name(&self) -> String {
        Local::now().format("%c").to_string()
    }

    /// Validate `name` and resolve collisions among the children of
    /// `parent_id`. With `allow_rename`, a taken name is suffixed
    /// `"<name> (n)"` for the first free n in 1..=100 (the 100th candidate
    /// is accepted even if taken).
    pub fn check_name_sanity(
        &self,
        name: &str,
        parent_id: &FolderId,
        allow_rename: bool,
    ) -> Result<String> {
        if name.is_empty() {
            return Err(VersionError::InvalidName("name cannot be empty".to_string()));
        }
        if !portable_filename(name) {
            return Err(VersionError::InvalidName(name.to_string()));
        }

        if self.store.find_by_name(parent_id, name)?.is_some() && !allow_rename {
            return Err(VersionError::NameConflict(name.to_string()));
        }

        let mut candidate = name.to_string();
        let mut n = 0;
        while self.store.find_by_name(parent_id, &candidate)?.is_some() {
            n += 1;
            candidate = format!("{} ({})", name, n);
            if n > 100 {
                break;
            }
        }
        Ok(candidate)
    }

    /// Create the child record and its directory. The directory is named by
    /// the record id, not the display name, so renames never move anything
    /// on disk.
    pub fn create_subdir(
        &self,
        tale_dir: &Path,
        root_id: &FolderId,
        name: &str,
    ) -> Result<FolderRecord> {
        let root = self.store.load(root_id)?;
        let mut folder = FolderRecord::new(Some(root.id), name);

        let dir = tale_dir.join(folder.id.as_str());
        fs::create_dir_all(&dir)?;
        folder.fs_path = Some(absolutize(&dir));
        folder.is_mapping = true;
        self.store.save(&folder)?;

        self.store.touch(root_id)?;
        Ok(folder)
    }

    /// Acquire the critical section on a versions root, or fail with
    /// [`VersionError::BusyTryLater`].
    pub fn lock_root(&self, root_id: &FolderId) -> Result<CriticalSection<'_>> {
        if self.update_critical_section_flag(root_id, true)? {
            Ok(CriticalSection { hierarchy: self, root_id: root_id.clone(), released: false })
        } else {
            Err(VersionError::BusyTryLater)
        }
    }

    /// Flip the flag via the store's conditional update; `Ok(false)` means
    /// the flag already had the requested value (i.e. someone else holds the
    /// section when setting, or it was never held when clearing).
    fn update_critical_section_flag(&self, root_id: &FolderId, value: bool) -> Result<bool> {
        let result = self.store.update_if(
            root_id,
            |r| r.critical_section != Some(value),
            |r| {
                r.critical_section = Some(value);
                r.seq = Some(r.seq.unwrap_or(0) + 1);
            },
        );
        match result {
            Ok(_) => Ok(true),
            Err(StoreError::Conflict) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn increment_reference_count(&self, version_id: &FolderId) -> Result<()> {
        self.update_reference_count(version_id, 1)
    }

    pub fn decrement_reference_count(&self, version_id: &FolderId) -> Result<()> {
        self.update_reference_count(version_id, -1)
    }

    /// Adjust a version's run counter under its parent root's critical
    /// section, so counting cannot race the refcount check in delete. The
    /// acquisition is retried briefly: run mutations should not fail just
    /// because a version operation held the section for a moment.
    fn update_reference_count(&self, version_id: &FolderId, delta: i64) -> Result<()> {
        let version = self.store.load(version_id)?;
        let root_id = version
            .parent_id
            .ok_or_else(|| VersionError::NotFound(version_id.to_string()))?;

        let _section = self.lock_root_with_retry(&root_id, 50, std::time::Duration::from_millis(20))?;
        self.store.update(version_id, |r| {
            r.ref_count = Some(r.ref_count.unwrap_or(0) + delta);
        })?;
        Ok(())
    }

    fn lock_root_with_retry(
        &self,
        root_id: &FolderId,
        attempts: u32,
        delay: std::time::Duration,
    ) -> Result<CriticalSection<'_>> {
        let mut remaining = attempts;
        loop {
            match self.lock_root(root_id) {
                Err(VersionError::BusyTryLater) if remaining > 0 => {
                    remaining -= 1;
                    std::thread::sleep(delay);
                }
                other => return other,
            }
        }
    }

    /// Delete a child: remove its record and move its directory into the
    /// sibling `.trash`. For versions (`guard_refcount`) the record is
    /// re-read under the critical section and a live run count blocks the
    /// delete.
    pub fn remove_to_trash(&self, id: &FolderId, guard_refcount: bool) -> Result<FolderRecord> {
        let record = self.store.load(id)?;

        let section;
        if guard_refcount {
            let root_id = record
                .parent_id
                .clone()
                .ok_or_else(|| VersionError::NotFound(id.to_string()))?;
            section = Some(self.lock_root(&root_id)?);
            // Re-read now that the section protects the counter.
            let current = self.store.load(id)?;
            if current.ref_count.unwrap_or(0) > 0 {
                return Err(VersionError::VersionInUse);
            }
        } else {
            section = None;
        }

        let path = record
            .fs_path
            .clone()
            .ok_or_else(|| VersionError::NotFound(format!("{} has no directory", id)))?;
        let trash = paths::trash_dir(path.parent().unwrap_or(Path::new("/")));
        let dest = trash.join(path.file_name().unwrap_or_default());

        self.store.remove(id)?;
        fs::rename(&path, &dest)?;

        drop(section);
        Ok(record)
    }

    /// Rename a child in place: the display name changes, the directory
    /// never moves. Directory and parent mtimes are refreshed so tree-level
    /// change detection notices.
    pub fn rename_child(
        &self,
        id: &FolderId,
        new_name: &str,
        allow_rename: bool,
    ) -> Result<FolderRecord> {
        let record = self.store.load(id)?;
        let parent_id = record
            .parent_id
            .clone()
            .ok_or_else(|| VersionError::NotFound(id.to_string()))?;

        let new_name = self.check_name_sanity(new_name, &parent_id, allow_rename)?;
        let updated = self.store.update(id, |r| {
            r.name = new_name.clone();
            r.updated = chrono::Utc::now();
        })?;

        if let Some(path) = &updated.fs_path {
            touch_now(path)?;
            if let Some(parent) = path.parent() {
                touch_now(parent)?;
            }
        }
        Ok(updated)
    }
}

/// POSIX-portable filename: no separators, no control characters, not a
/// relative-dir token, not a reserved device name, at most 255 bytes.
pub fn portable_filename(name: &str) -> bool {
    if name.is_empty() || name == "." || name == ".." || name.len() > 255 {
        return false;
    }
    if name.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
        return false;
    }
    let stem = name.split('.').next().unwrap_or("").to_ascii_uppercase();
    const RESERVED: &[&str] = &[
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    !RESERVED.contains(&stem.as_str())
}

pub(crate) fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map(|cwd| cwd.join(path)).unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Set a path's access and modification times to now.
pub fn touch_now(path: &Path) -> io::Result<()> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let ts = nix::sys::time::TimeSpec::new(now.as_secs() as i64, now.subsec_nanos() as i64);
    nix::sys::stat::utimensat(None, path, &ts, &ts, nix::sys::stat::UtimensatFlags::NoFollowSymlink)
        .map_err(|e| io::Error::from_raw_os_error(e as i32))
}
