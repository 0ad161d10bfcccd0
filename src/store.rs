use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// 24-character lowercase hex identifier for folder and tale records.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FolderId(String);

impl FolderId {
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        let mut hex = String::with_capacity(24);
        for b in &uuid.as_bytes()[..12] {
            hex.push_str(&format!("{:02x}", b));
        }
        FolderId(hex)
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        if s.len() == 24 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            Ok(FolderId(s.to_string()))
        } else {
            Err(StoreError::NotFound(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character prefix used to shard per-tale directories.
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FolderId({})", self.0)
    }
}

/// Job identifiers recorded on a run so the heartbeat reaper can find its
/// worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub job_id: String,
    pub queue: String,
    pub node_id: String,
    pub container_name: String,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub credential: Option<String>,
}

/// A folder document. Versions, runs and the two per-tale root folders are
/// all folder records; the optional fields below are the closed set the
/// engines read and write, `extra` carries anything else (fork copies it by
/// value).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderRecord {
    pub id: FolderId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_id: Option<FolderId>,
    pub name: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fs_path: Option<PathBuf>,
    #[serde(default)]
    pub is_mapping: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub seq: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub critical_section: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ref_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tale_id: Option<FolderId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub run_version_id: Option<FolderId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub run_status: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub run_meta: Option<RunMeta>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl FolderRecord {
    pub fn new(parent_id: Option<FolderId>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        FolderRecord {
            id: FolderId::generate(),
            parent_id,
            name: name.into(),
            created: now,
            updated: now,
            fs_path: None,
            is_mapping: false,
            seq: None,
            critical_section: None,
            ref_count: None,
            tale_id: None,
            run_version_id: None,
            run_status: None,
            run_meta: None,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Created,
    Updated,
    Name,
}

#[derive(Debug, Clone, Copy)]
pub struct Sort {
    pub field: SortField,
    pub descending: bool,
}

impl Sort {
    pub fn created() -> Self {
        Sort { field: SortField::Created, descending: false }
    }

    pub fn created_desc() -> Self {
        Sort { field: SortField::Created, descending: true }
    }

    pub fn name() -> Self {
        Sort { field: SortField::Name, descending: false }
    }
}

impl Default for Sort {
    fn default() -> Self {
        Sort::created()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("conditional update predicate failed")]
    Conflict,
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
}

/// Folder record store. A single mutex is the atomicity domain: every
/// operation, including the conditional update the critical section is built
/// on, runs entirely under it. Records are optionally written through to a
/// file-per-record JSON directory so separate processes (the CLI in
/// particular) observe the same state.
pub struct FolderStore {
    records: Mutex<HashMap<FolderId, FolderRecord>>,
    persist_dir: Option<PathBuf>,
}

impl FolderStore {
    pub fn in_memory() -> Self {
        FolderStore { records: Mutex::new(HashMap::new()), persist_dir: None }
    }

    /// Open a store backed by `dir`, loading every record already there.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut records = HashMap::new();
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                match fs::read_to_string(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|s| serde_json::from_str::<FolderRecord>(&s).map_err(|e| e.to_string()))
                {
                    Ok(record) => {
                        records.insert(record.id.clone(), record);
                    }
                    Err(e) => log::warn!("Skipping unreadable record {:?}: {}", path, e),
                }
            }
        }

        Ok(FolderStore { records: Mutex::new(records), persist_dir: Some(dir) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<FolderId, FolderRecord>>, StoreError> {
        self.records.lock().map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    pub fn load(&self, id: &FolderId) -> Result<FolderRecord, StoreError> {
        self.lock()?.get(id).cloned().ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn try_load(&self, id: &FolderId) -> Option<FolderRecord> {
        self.lock().ok()?.get(id).cloned()
    }

    pub fn save(&self, record: &FolderRecord) -> Result<(), StoreError> {
        let mut records = self.lock()?;
        records.insert(record.id.clone(), record.clone());
        self.persist(record)
    }

    pub fn remove(&self, id: &FolderId) -> Result<(), StoreError> {
        let mut records = self.lock()?;
        records.remove(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.unpersist(id)
    }

    pub fn find_by_name(&self, parent_id: &FolderId, name: &str) -> Result<Option<FolderRecord>, StoreError> {
        let records = self.lock()?;
        Ok(records
            .values()
            .find(|r| r.parent_id.as_ref() == Some(parent_id) && r.name == name)
            .cloned())
    }

    /// Children of `parent_id`, sorted; `limit == 0` means no limit.
    pub fn child_folders(
        &self,
        parent_id: &FolderId,
        sort: Sort,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FolderRecord>, StoreError> {
        let records = self.lock()?;
        let mut children: Vec<FolderRecord> = records
            .values()
            .filter(|r| r.parent_id.as_ref() == Some(parent_id))
            .cloned()
            .collect();
        drop(records);

        children.sort_by(|a, b| {
            let ord = match sort.field {
                SortField::Created => a.created.cmp(&b.created),
                SortField::Updated => a.updated.cmp(&b.updated),
                SortField::Name => a.name.cmp(&b.name),
            };
            // Ties broken by id so paging is stable.
            let ord = ord.then_with(|| a.id.cmp(&b.id));
            if sort.descending {
                ord.reverse()
            } else {
                ord
            }
        });

        let iter = children.into_iter().skip(offset);
        Ok(if limit > 0 { iter.take(limit).collect() } else { iter.collect() })
    }

    pub fn filter<F>(&self, f: F) -> Result<Vec<FolderRecord>, StoreError>
    where
        F: Fn(&FolderRecord) -> bool,
    {
        Ok(self.lock()?.values().filter(|r| f(r)).cloned().collect())
    }

    /// Apply `apply` to the record and write it back, all under the store
    /// lock. Returns the updated record.
    pub fn update<F>(&self, id: &FolderId, apply: F) -> Result<FolderRecord, StoreError>
    where
        F: FnOnce(&mut FolderRecord),
    {
        let mut records = self.lock()?;
        let record = records.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply(record);
        let snapshot = record.clone();
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    /// Conditional update: apply `apply` only if `predicate` holds for the
    /// current value, atomically. Fails with [`StoreError::Conflict`] when the
    /// predicate does not hold. This is the sole synchronization primitive
    /// behind the per-tale critical section.
    pub fn update_if<P, F>(&self, id: &FolderId, predicate: P, apply: F) -> Result<FolderRecord, StoreError>
    where
        P: FnOnce(&FolderRecord) -> bool,
        F: FnOnce(&mut FolderRecord),
    {
        let mut records = self.lock()?;
        let record = records.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !predicate(record) {
            return Err(StoreError::Conflict);
        }
        apply(record);
        let snapshot = record.clone();
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    /// Refresh a record's `updated` timestamp.
    pub fn touch(&self, id: &FolderId) -> Result<(), StoreError> {
        self.update(id, |r| r.updated = Utc::now()).map(|_| ())
    }

    /// Startup crash recovery: a holder that died mid-operation leaves its
    /// root's `critical_section` flag set. Returns how many flags were
    /// cleared.
    pub fn reset_crashed_critical_sections(&self) -> Result<usize, StoreError> {
        let mut records = self.lock()?;
        let mut cleared = 0;
        let stuck: Vec<FolderId> = records
            .values()
            .filter(|r| r.critical_section == Some(true))
            .map(|r| r.id.clone())
            .collect();
        for id in stuck {
            if let Some(record) = records.get_mut(&id) {
                record.critical_section = Some(false);
                let snapshot = record.clone();
                self.persist(&snapshot)?;
                cleared += 1;
            }
        }
        if cleared > 0 {
            log::warn!("Cleared {} crashed critical section flag(s)", cleared);
        }
        Ok(cleared)
    }

    fn record_path(&self, id: &FolderId) -> Option<PathBuf> {
        self.persist_dir.as_ref().map(|d| d.join(format!("{}.json", id)))
    }

    fn persist(&self, record: &FolderRecord) -> Result<(), StoreError> {
        let Some(path) = self.record_path(&record.id) else {
            return Ok(());
        };
        let contents = serde_json::to_string_pretty(record)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        atomic_write(&path, &contents).map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn unpersist(&self, id: &FolderId) -> Result<(), StoreError> {
        if let Some(path) = self.record_path(id) {
            if path.exists() {
                fs::remove_file(&path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }
        Ok(())
    }
}

/// Write `contents` to `path` via a temp file and rename, then fsync the
/// containing directory so the rename is durable.
pub(crate) fn atomic_write(path: &Path, contents: &str) -> std::io::Result<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, contents)?;
    fs::rename(&temp_path, path)?;
    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

pub(crate) fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let f = fs::File::open(dir)?;
        unsafe {
            libc::fsync(f.as_raw_fd());
        }
    }
    Ok(())
}
