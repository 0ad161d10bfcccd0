use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Engine configuration: where version trees, run trees and metadata records
/// live on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for per-tale version trees.
    pub versions_root: PathBuf,
    /// Root directory for per-tale run trees.
    pub runs_root: PathBuf,
    /// Directory holding the persisted folder and tale records.
    pub metadata_root: PathBuf,
}

impl Config {
    pub fn new(
        versions_root: impl Into<PathBuf>,
        runs_root: impl Into<PathBuf>,
        metadata_root: impl Into<PathBuf>,
    ) -> Self {
        Config {
            versions_root: versions_root.into(),
            runs_root: runs_root.into(),
            metadata_root: metadata_root.into(),
        }
    }

    /// Standard layout under a base directory: `versions/`, `runs/` and
    /// `meta/` siblings. The run directories link back to their version with
    /// a relative `../../../../versions/...` target, which resolves only when
    /// the two trees are siblings named this way.
    pub fn under(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Config {
            versions_root: base.join("versions"),
            runs_root: base.join("runs"),
            metadata_root: base.join("meta"),
        }
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_json(&contents)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Create the three root directories if they do not exist yet.
    pub fn ensure_roots(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.versions_root)?;
        fs::create_dir_all(&self.runs_root)?;
        fs::create_dir_all(&self.metadata_root)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for (label, path) in [
            ("versions_root", &self.versions_root),
            ("runs_root", &self.runs_root),
            ("metadata_root", &self.metadata_root),
        ] {
            if path.as_os_str().is_empty() {
                errors.push(format!("{} must not be empty", label));
            }
        }
        if self.versions_root == self.runs_root {
            errors.push("versions_root and runs_root must differ".to_string());
        }
        if !self.sibling_layout() {
            // Run directories carry a relative "version" symlink; a
            // non-sibling layout leaves those links dangling.
            log::warn!(
                "versions_root and runs_root are not sibling 'versions'/'runs' \
                 directories; run version links will not resolve"
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn sibling_layout(&self) -> bool {
        self.versions_root.file_name().is_some_and(|n| n == "versions")
            && self.runs_root.file_name().is_some_and(|n| n == "runs")
            && self.versions_root.parent() == self.runs_root.parent()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::under(std::env::temp_dir().join("versionfs"))
    }
}
