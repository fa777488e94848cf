use serde_json::{json, Value as JsonValue};

use crate::LixError;

pub const GLOBAL_VERSION_ID: &str = "global";
pub const MAIN_VERSION_ID: &str = "main";
pub const MAIN_VERSION_NAME: &str = "main";

/// Storage coordinates of the active-version untracked singleton.
pub const ACTIVE_VERSION_ENTITY_ID: &str = "active";
pub const ACTIVE_VERSION_STORAGE_VERSION_ID: &str = GLOBAL_VERSION_ID;

/// Inheritance chains are bounded; deeper nesting is a modeling error.
pub const MAX_INHERITANCE_DEPTH: usize = 64;

pub fn version_descriptor_snapshot(
    id: &str,
    name: &str,
    inherits_from_version_id: Option<&str>,
) -> JsonValue {
    json!({
        "id": id,
        "name": name,
        "inherits_from_version_id": inherits_from_version_id,
    })
}

pub fn version_tip_snapshot(version_id: &str, commit_id: &str) -> JsonValue {
    json!({
        "id": version_id,
        "commit_id": commit_id,
    })
}

pub fn active_version_snapshot(version_id: &str) -> JsonValue {
    json!({ "version_id": version_id })
}

pub fn parse_active_version_snapshot(snapshot: &JsonValue) -> Result<String, LixError> {
    snapshot
        .get("version_id")
        .and_then(|value| value.as_str())
        .map(|value| value.to_string())
        .ok_or_else(|| LixError::validation("active version snapshot missing version_id"))
}
