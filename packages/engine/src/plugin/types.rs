use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::LixError;

/// Manifest registered alongside a plugin's executable blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub key: String,
    pub runtime_version: String,
    pub api_version: String,
    pub detect_changes_glob: String,
    #[serde(default)]
    pub entry: Option<String>,
}

impl PluginManifest {
    pub fn parse_json(raw: &str) -> Result<Self, LixError> {
        let manifest: PluginManifest = serde_json::from_str(raw)
            .map_err(|error| LixError::plugin(format!("invalid plugin manifest: {error}")))?;
        if manifest.key.is_empty() {
            return Err(LixError::plugin("plugin manifest requires a key"));
        }
        if manifest.detect_changes_glob.is_empty() {
            return Err(LixError::plugin(
                "plugin manifest requires a detect_changes_glob",
            ));
        }
        Ok(manifest)
    }

    pub fn entry_or_default(&self) -> &str {
        self.entry.as_deref().unwrap_or("plugin.wasm")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPlugin {
    pub manifest: PluginManifest,
    pub code: Vec<u8>,
}

/// File context handed to plugin callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginFileDescriptor {
    pub id: String,
    pub path: String,
    pub metadata: Option<JsonValue>,
}

/// One entity change reported by `detect_changes`.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginEntityChange {
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub snapshot_content: Option<JsonValue>,
}

/// One live entity handed to `apply_changes`.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginEntityState {
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub snapshot_content: JsonValue,
}

#[cfg(test)]
mod tests {
    use super::PluginManifest;

    #[test]
    fn parses_a_manifest_with_defaults() {
        let manifest = PluginManifest::parse_json(
            r#"{
                "key": "json_pointers",
                "runtime_version": "1",
                "api_version": "0.1.0",
                "detect_changes_glob": "**/*.json"
            }"#,
        )
        .expect("parse manifest");
        assert_eq!(manifest.key, "json_pointers");
        assert_eq!(manifest.entry_or_default(), "plugin.wasm");
    }

    #[test]
    fn rejects_manifests_without_a_glob() {
        let err = PluginManifest::parse_json(
            r#"{"key": "x", "runtime_version": "1", "api_version": "0.1.0", "detect_changes_glob": ""}"#,
        )
        .expect_err("should reject");
        assert_eq!(err.kind, crate::ErrorKind::PluginFailure);
    }
}
