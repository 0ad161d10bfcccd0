//! On-disk layout.
//!
//! A tale with id `P` keeps its versions under
//! `<versions_root>/<P[..2]>/<P>/` and its runs under the analogous
//! directory below the runs root; the two-character prefix shards tales so
//! no single directory collects them all. Each per-tale directory carries a
//! `.trash/` sibling for deleted children. A run links back to its version
//! with a relative target of exactly four `..` components, which lets a
//! whole tale tree be relocated or cloned under a different id by rewriting
//! only the final segments of the link.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::store::FolderId;

pub const TRASH_DIR_NAME: &str = ".trash";
pub const WORKSPACE_DIR_NAME: &str = "workspace";
pub const VERSION_LINK_NAME: &str = "version";
pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const ENVIRONMENT_FILE_NAME: &str = "environment.json";
pub const STATUS_FILE_NAME: &str = ".status";

/// `<root>/<id[..2]>/<id>/`
pub fn tale_dir(root: &Path, tale_id: &FolderId) -> PathBuf {
    root.join(tale_id.shard()).join(tale_id.as_str())
}

pub fn trash_dir(tale_dir: &Path) -> PathBuf {
    tale_dir.join(TRASH_DIR_NAME)
}

/// Create the per-tale directory and its `.trash/` under `root`.
pub fn ensure_tale_dir(root: &Path, tale_id: &FolderId) -> io::Result<PathBuf> {
    let dir = tale_dir(root, tale_id);
    fs::create_dir_all(&dir)?;
    fs::create_dir_all(trash_dir(&dir))?;
    Ok(dir)
}

/// Relative target for a run's `version` symlink.
pub fn version_link_target(tale_id: &FolderId, version_id: &FolderId) -> PathBuf {
    PathBuf::from(format!(
        "../../../../versions/{}/{}/{}",
        tale_id.shard(),
        tale_id,
        version_id
    ))
}

pub fn workspace_dir(dir: &Path) -> PathBuf {
    dir.join(WORKSPACE_DIR_NAME)
}

pub fn manifest_file(version_dir: &Path) -> PathBuf {
    version_dir.join(MANIFEST_FILE_NAME)
}

pub fn environment_file(version_dir: &Path) -> PathBuf {
    version_dir.join(ENVIRONMENT_FILE_NAME)
}

pub fn status_file(run_dir: &Path) -> PathBuf {
    run_dir.join(STATUS_FILE_NAME)
}
