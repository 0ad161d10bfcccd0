use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::store::{atomic_write, FolderId, StoreError};

pub const VERSIONS_ROOT_NAME: &str = "Tale Versions";
pub const RUNS_ROOT_NAME: &str = "Tale Runs";

/// A tale: the user-owned project the engine versions. The document is
/// mostly opaque here; the engines read the workspace path and the two root
/// folder ids, and rewrite `restored_from` plus the opaque metadata blobs on
/// restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tale {
    pub id: FolderId,
    pub title: String,
    pub creator_user_id: String,
    pub workspace_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub versions_root_id: Option<FolderId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub runs_root_id: Option<FolderId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub restored_from: Option<FolderId>,
    /// Opaque project metadata (image config etc).
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Opaque runtime environment document.
    #[serde(default)]
    pub environment: serde_json::Value,
    /// Opaque dataset references.
    #[serde(default)]
    pub data_set: serde_json::Value,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Tale {
    pub fn new(
        title: impl Into<String>,
        creator_user_id: impl Into<String>,
        workspace_path: impl Into<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Tale {
            id: FolderId::generate(),
            title: title.into(),
            creator_user_id: creator_user_id.into(),
            workspace_path: workspace_path.into(),
            versions_root_id: None,
            runs_root_id: None,
            restored_from: None,
            metadata: serde_json::Value::Null,
            environment: serde_json::Value::Null,
            data_set: serde_json::Value::Array(Vec::new()),
            created: now,
            updated: now,
        }
    }
}

/// Tale records, same shape as [`crate::store::FolderStore`]: in-memory map
/// with optional file-per-record write-through.
pub struct TaleStore {
    tales: Mutex<HashMap<FolderId, Tale>>,
    persist_dir: Option<PathBuf>,
}

impl TaleStore {
    pub fn in_memory() -> Self {
        TaleStore { tales: Mutex::new(HashMap::new()), persist_dir: None }
    }

    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut tales = HashMap::new();
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                match fs::read_to_string(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|s| serde_json::from_str::<Tale>(&s).map_err(|e| e.to_string()))
                {
                    Ok(tale) => {
                        tales.insert(tale.id.clone(), tale);
                    }
                    Err(e) => log::warn!("Skipping unreadable tale {:?}: {}", path, e),
                }
            }
        }

        Ok(TaleStore { tales: Mutex::new(tales), persist_dir: Some(dir) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<FolderId, Tale>>, StoreError> {
        self.tales.lock().map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    pub fn load(&self, id: &FolderId) -> Result<Tale, StoreError> {
        self.lock()?.get(id).cloned().ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn save(&self, tale: &Tale) -> Result<(), StoreError> {
        let mut tales = self.lock()?;
        tales.insert(tale.id.clone(), tale.clone());
        self.persist(tale)
    }

    pub fn remove(&self, id: &FolderId) -> Result<(), StoreError> {
        let mut tales = self.lock()?;
        tales.remove(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if let Some(path) = self.tale_path(id) {
            if path.exists() {
                fs::remove_file(&path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }
        Ok(())
    }

    pub fn update<F>(&self, id: &FolderId, apply: F) -> Result<Tale, StoreError>
    where
        F: FnOnce(&mut Tale),
    {
        let mut tales = self.lock()?;
        let tale = tales.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply(tale);
        let snapshot = tale.clone();
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    pub fn touch(&self, id: &FolderId) -> Result<(), StoreError> {
        self.update(id, |t| t.updated = Utc::now()).map(|_| ())
    }

    pub fn list(&self) -> Result<Vec<Tale>, StoreError> {
        let mut tales: Vec<Tale> = self.lock()?.values().cloned().collect();
        tales.sort_by(|a, b| a.created.cmp(&b.created));
        Ok(tales)
    }

    fn tale_path(&self, id: &FolderId) -> Option<PathBuf> {
        self.persist_dir.as_ref().map(|d| d.join(format!("{}.json", id)))
    }

    fn persist(&self, tale: &Tale) -> Result<(), StoreError> {
        let Some(path) = self.tale_path(&tale.id) else {
            return Ok(());
        };
        let contents =
            serde_json::to_string_pretty(tale).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        atomic_write(&path, &contents).map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_update() {
        let store = TaleStore::in_memory();
        let tale = Tale::new("Demo", "u1", "/tmp/ws");
        store.save(&tale).unwrap();

        let loaded = store.load(&tale.id).unwrap();
        assert_eq!(loaded.title, "Demo");
        assert!(loaded.restored_from.is_none());

        let v = FolderId::generate();
        store.update(&tale.id, |t| t.restored_from = Some(v.clone())).unwrap();
        assert_eq!(store.load(&tale.id).unwrap().restored_from, Some(v));
    }

    #[test]
    fn test_persistence_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let tale = {
            let store = TaleStore::open(tmp.path()).unwrap();
            let tale = Tale::new("Persisted", "u1", "/tmp/ws");
            store.save(&tale).unwrap();
            tale
        };

        let reopened = TaleStore::open(tmp.path()).unwrap();
        assert_eq!(reopened.load(&tale.id).unwrap().title, "Persisted");
    }

    #[test]
    fn test_remove_missing() {
        let store = TaleStore::in_memory();
        assert!(matches!(store.remove(&FolderId::generate()), Err(StoreError::NotFound(_))));
    }
}
