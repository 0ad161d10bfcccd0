//! Manifest and environment documents.
//!
//! Every version stores two JSON documents next to its workspace snapshot:
//! `manifest.json` (the project description, including the dataset and the
//! version it belongs to) and `environment.json` (the runtime image). The
//! engine treats both as opaque apart from the handful of fields it needs:
//! the embedded version name (rewritten on rename), the dataset (served by
//! the dataset endpoint) and the restorable project state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;

use crate::error::Result;
use crate::store::FolderId;
use crate::tale::Tale;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VersionRef {
    id: FolderId,
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestDoc {
    tale_id: FolderId,
    title: String,
    #[serde(default)]
    metadata: Value,
    #[serde(default)]
    data_set: Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    version: Option<VersionRef>,
}

/// The project state a version captures, parsed back out of its manifest and
/// environment documents. Compared for equality by the "not modified" check,
/// so version-specific fields (id, name) are deliberately not part of it.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredTale {
    pub title: String,
    pub metadata: Value,
    pub data_set: Value,
    pub environment: Value,
}

/// Producer of the two documents. The real system delegates to an external
/// manifest builder; [`JsonManifestProducer`] is the built-in stand-in.
pub trait ManifestProducer: Send + Sync {
    fn dump_manifest(&self, tale: &Tale, version: Option<(&FolderId, &str)>) -> Result<String>;
    fn dump_environment(&self, tale: &Tale) -> Result<String>;
}

pub struct JsonManifestProducer;

impl ManifestProducer for JsonManifestProducer {
    fn dump_manifest(&self, tale: &Tale, version: Option<(&FolderId, &str)>) -> Result<String> {
        let doc = ManifestDoc {
            tale_id: tale.id.clone(),
            title: tale.title.clone(),
            metadata: tale.metadata.clone(),
            data_set: tale.data_set.clone(),
            version: version.map(|(id, name)| VersionRef { id: id.clone(), name: name.to_string() }),
        };
        serde_json::to_string_pretty(&doc).map_err(|e| invalid_data(e).into())
    }

    fn dump_environment(&self, tale: &Tale) -> Result<String> {
        serde_json::to_string_pretty(&tale.environment).map_err(|e| invalid_data(e).into())
    }
}

/// Parse a version's documents back into restorable project state.
pub fn restore_tale(manifest_json: &str, environment_json: &str) -> Result<RestoredTale> {
    let doc: ManifestDoc = serde_json::from_str(manifest_json).map_err(invalid_data)?;
    let environment: Value = serde_json::from_str(environment_json).map_err(invalid_data)?;
    Ok(RestoredTale { title: doc.title, metadata: doc.metadata, data_set: doc.data_set, environment })
}

/// The same state taken from the live tale record, for comparison against a
/// stored version.
pub fn restored_from_live(tale: &Tale) -> RestoredTale {
    RestoredTale {
        title: tale.title.clone(),
        metadata: tale.metadata.clone(),
        data_set: tale.data_set.clone(),
        environment: tale.environment.clone(),
    }
}

pub fn data_set_from_manifest(manifest_json: &str) -> Result<Value> {
    let doc: ManifestDoc = serde_json::from_str(manifest_json).map_err(invalid_data)?;
    Ok(doc.data_set)
}

/// Rewrite the version name embedded in a manifest (renames keep everything
/// else intact).
pub fn set_version_name(manifest_json: &str, name: &str) -> Result<String> {
    let mut doc: ManifestDoc = serde_json::from_str(manifest_json).map_err(invalid_data)?;
    if let Some(version) = doc.version.as_mut() {
        version.name = name.to_string();
    }
    serde_json::to_string_pretty(&doc).map_err(|e| invalid_data(e).into())
}

fn invalid_data(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tale() -> Tale {
        let mut tale = Tale::new("Demo", "u1", "/tmp/ws");
        tale.metadata = json!({"image": "jupyter", "memLimit": "2g"});
        tale.data_set = json!([{"itemId": "it1", "mountPath": "/data/it1"}]);
        tale.environment = json!({"repo2docker": "1.0"});
        tale
    }

    #[test]
    fn test_dump_and_restore_roundtrip() {
        let tale = tale();
        let producer = JsonManifestProducer;
        let vid = FolderId::generate();

        let manifest = producer.dump_manifest(&tale, Some((&vid, "First Version"))).unwrap();
        let environment = producer.dump_environment(&tale).unwrap();

        let restored = restore_tale(&manifest, &environment).unwrap();
        assert_eq!(restored, restored_from_live(&tale));
    }

    #[test]
    fn test_version_ref_not_part_of_comparison() {
        let tale = tale();
        let producer = JsonManifestProducer;
        let env = producer.dump_environment(&tale).unwrap();

        let a = producer.dump_manifest(&tale, Some((&FolderId::generate(), "v1"))).unwrap();
        let b = producer.dump_manifest(&tale, Some((&FolderId::generate(), "v2"))).unwrap();
        assert_ne!(a, b);
        assert_eq!(restore_tale(&a, &env).unwrap(), restore_tale(&b, &env).unwrap());
    }

    #[test]
    fn test_set_version_name() {
        let tale = tale();
        let producer = JsonManifestProducer;
        let vid = FolderId::generate();
        let manifest = producer.dump_manifest(&tale, Some((&vid, "old name"))).unwrap();

        let rewritten = set_version_name(&manifest, "new name").unwrap();
        assert!(rewritten.contains("new name"));
        assert!(!rewritten.contains("old name"));
        // Everything else untouched.
        assert_eq!(
            restore_tale(&rewritten, &producer.dump_environment(&tale).unwrap()).unwrap(),
            restored_from_live(&tale)
        );
    }

    #[test]
    fn test_data_set_extraction() {
        let tale = tale();
        let producer = JsonManifestProducer;
        let manifest = producer.dump_manifest(&tale, None).unwrap();
        assert_eq!(data_set_from_manifest(&manifest).unwrap(), tale.data_set);
    }

    #[test]
    fn test_garbage_manifest_rejected() {
        assert!(restore_tale("{not json", "{}").is_err());
    }
}
