#![allow(dead_code)]

use std::fs;
use std::path::Path;

use tempfile::TempDir;
use versionfs::config::Config;
use versionfs::service::VersioningService;
use versionfs::tale::Tale;

pub struct TestEnv {
    pub tmp: TempDir,
    pub service: VersioningService,
}

/// Fresh in-memory service over a temp directory with the standard
/// `versions/`-`runs/`-`meta/` sibling layout.
pub fn setup() -> TestEnv {
    let tmp = tempfile::tempdir().unwrap();
    let service = VersioningService::in_memory(Config::under(tmp.path())).unwrap();
    TestEnv { tmp, service }
}

/// Create a tale whose workspace contains the given files.
pub fn tale_with_workspace(env: &TestEnv, title: &str, files: &[(&str, &str)]) -> Tale {
    let workspace = env.tmp.path().join(format!("ws-{}", title.to_lowercase().replace(' ', "-")));
    fs::create_dir_all(&workspace).unwrap();
    for (rel, contents) in files {
        write_file(&workspace.join(rel), contents);
    }
    env.service.create_tale(title, "user1", &workspace).unwrap()
}

pub fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

/// Names of a directory's entries, sorted.
pub fn dir_names(path: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(path)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
