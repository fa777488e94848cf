use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use lix_engine::{
    LixError, PluginEntityChange, PluginEntityState, PluginFileDescriptor, PluginHost,
    PluginInstance, PluginManifest,
};
use serde_json::{json, Map as JsonMap, Value as JsonValue};

pub const JSON_PLUGIN_KEY: &str = "test_json_plugin";
pub const JSON_PROPERTY_SCHEMA_KEY: &str = "json_property";

pub fn manifest() -> PluginManifest {
    PluginManifest {
        key: JSON_PLUGIN_KEY.to_string(),
        runtime_version: "1".to_string(),
        api_version: "0.1.0".to_string(),
        detect_changes_glob: "**/*.json".to_string(),
        entry: None,
    }
}

/// In-process JSON plugin: one entity per top-level property, keyed
/// `<file-stem>.<property>`. `detect_changes` diffs before/after so
/// unchanged properties emit nothing; `apply_changes` rebuilds the object.
pub struct JsonPluginHost;

struct JsonPluginInstance;

#[async_trait(?Send)]
impl PluginHost for JsonPluginHost {
    async fn instantiate(
        &self,
        manifest: &PluginManifest,
        _code: &[u8],
    ) -> Result<Arc<dyn PluginInstance>, LixError> {
        if manifest.key != JSON_PLUGIN_KEY {
            return Err(LixError::plugin(format!(
                "unsupported test plugin key '{}'",
                manifest.key
            )));
        }
        Ok(Arc::new(JsonPluginInstance))
    }
}

fn file_stem(path: &str) -> String {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem.to_string())
        .unwrap_or_else(|| file_name.to_string())
}

fn parse_object(bytes: &[u8]) -> Result<JsonMap<String, JsonValue>, LixError> {
    let value: JsonValue = serde_json::from_slice(bytes)
        .map_err(|error| LixError::plugin(format!("file bytes are not valid JSON: {error}")))?;
    value
        .as_object()
        .cloned()
        .ok_or_else(|| LixError::plugin("file bytes are not a JSON object"))
}

#[async_trait(?Send)]
impl PluginInstance for JsonPluginInstance {
    async fn detect_changes(
        &self,
        descriptor: &PluginFileDescriptor,
        before: Option<&[u8]>,
        after: &[u8],
    ) -> Result<Vec<PluginEntityChange>, LixError> {
        let stem = file_stem(&descriptor.path);
        let after_object = parse_object(after)?;
        let before_object = match before {
            Some(bytes) if !bytes.is_empty() => parse_object(bytes)?,
            _ => JsonMap::new(),
        };

        let mut changes = Vec::new();
        for (property, value) in &after_object {
            if before_object.get(property) == Some(value) {
                continue;
            }
            changes.push(PluginEntityChange {
                entity_id: format!("{stem}.{property}"),
                schema_key: JSON_PROPERTY_SCHEMA_KEY.to_string(),
                schema_version: "1".to_string(),
                snapshot_content: Some(json!({ "path": property, "value": value })),
            });
        }
        for property in before_object.keys() {
            if !after_object.contains_key(property) {
                changes.push(PluginEntityChange {
                    entity_id: format!("{stem}.{property}"),
                    schema_key: JSON_PROPERTY_SCHEMA_KEY.to_string(),
                    schema_version: "1".to_string(),
                    snapshot_content: None,
                });
            }
        }
        Ok(changes)
    }

    async fn apply_changes(
        &self,
        _descriptor: &PluginFileDescriptor,
        entities: &[PluginEntityState],
    ) -> Result<Vec<u8>, LixError> {
        let mut object = BTreeMap::new();
        for entity in entities {
            if entity.schema_key != JSON_PROPERTY_SCHEMA_KEY {
                continue;
            }
            let property = entity
                .snapshot_content
                .get("path")
                .and_then(|value| value.as_str())
                .ok_or_else(|| LixError::plugin("json property entity missing path"))?;
            let value = entity
                .snapshot_content
                .get("value")
                .cloned()
                .unwrap_or(JsonValue::Null);
            object.insert(property.to_string(), value);
        }
        serde_json::to_vec(&object)
            .map_err(|error| LixError::plugin(format!("failed to serialize file: {error}")))
    }
}
