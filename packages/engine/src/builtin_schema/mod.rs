use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde_json::Value as JsonValue;

pub const STORED_SCHEMA_KEY: &str = "lix_stored_schema";
pub const KEY_VALUE_SCHEMA_KEY: &str = "lix_key_value";
pub const VERSION_DESCRIPTOR_SCHEMA_KEY: &str = "lix_version_descriptor";
pub const VERSION_TIP_SCHEMA_KEY: &str = "lix_version_tip";
pub const COMMIT_SCHEMA_KEY: &str = "lix_commit";
pub const COMMIT_EDGE_SCHEMA_KEY: &str = "lix_commit_edge";
pub const CHANGE_SET_ELEMENT_SCHEMA_KEY: &str = "lix_change_set_element";
pub const CHANGE_AUTHOR_SCHEMA_KEY: &str = "lix_change_author";
pub const ACCOUNT_SCHEMA_KEY: &str = "lix_account";
pub const ACTIVE_VERSION_SCHEMA_KEY: &str = "lix_active_version";
pub const ACTIVE_ACCOUNT_SCHEMA_KEY: &str = "lix_active_account";
pub const FILE_DESCRIPTOR_SCHEMA_KEY: &str = "lix_file_descriptor";
pub const DIRECTORY_DESCRIPTOR_SCHEMA_KEY: &str = "lix_directory_descriptor";
pub const BINARY_BLOB_REF_SCHEMA_KEY: &str = "lix_binary_blob_ref";

/// File id and plugin key stamped on engine-owned entities.
pub const BUILTIN_FILE_ID: &str = "lix";
pub const BUILTIN_PLUGIN_KEY: &str = "lix";

const BUILTIN_SCHEMA_SOURCES: &[(&str, &str)] = &[
    (STORED_SCHEMA_KEY, include_str!("lix_stored_schema.json")),
    (KEY_VALUE_SCHEMA_KEY, include_str!("lix_key_value.json")),
    (
        VERSION_DESCRIPTOR_SCHEMA_KEY,
        include_str!("lix_version_descriptor.json"),
    ),
    (VERSION_TIP_SCHEMA_KEY, include_str!("lix_version_tip.json")),
    (COMMIT_SCHEMA_KEY, include_str!("lix_commit.json")),
    (COMMIT_EDGE_SCHEMA_KEY, include_str!("lix_commit_edge.json")),
    (
        CHANGE_SET_ELEMENT_SCHEMA_KEY,
        include_str!("lix_change_set_element.json"),
    ),
    (
        CHANGE_AUTHOR_SCHEMA_KEY,
        include_str!("lix_change_author.json"),
    ),
    (ACCOUNT_SCHEMA_KEY, include_str!("lix_account.json")),
    (
        ACTIVE_VERSION_SCHEMA_KEY,
        include_str!("lix_active_version.json"),
    ),
    (
        ACTIVE_ACCOUNT_SCHEMA_KEY,
        include_str!("lix_active_account.json"),
    ),
    (
        FILE_DESCRIPTOR_SCHEMA_KEY,
        include_str!("lix_file_descriptor.json"),
    ),
    (
        DIRECTORY_DESCRIPTOR_SCHEMA_KEY,
        include_str!("lix_directory_descriptor.json"),
    ),
    (
        BINARY_BLOB_REF_SCHEMA_KEY,
        include_str!("lix_binary_blob_ref.json"),
    ),
];

static BUILTIN_SCHEMAS: OnceLock<BTreeMap<&'static str, JsonValue>> = OnceLock::new();

fn builtin_schemas() -> &'static BTreeMap<&'static str, JsonValue> {
    BUILTIN_SCHEMAS.get_or_init(|| {
        BUILTIN_SCHEMA_SOURCES
            .iter()
            .map(|(key, raw)| {
                let parsed: JsonValue = serde_json::from_str(raw)
                    .unwrap_or_else(|error| panic!("builtin schema {key} must be valid JSON: {error}"));
                (*key, parsed)
            })
            .collect()
    })
}

pub fn builtin_schema_keys() -> impl Iterator<Item = &'static str> {
    builtin_schemas().keys().copied()
}

pub fn builtin_schema_definition(schema_key: &str) -> Option<&'static JsonValue> {
    builtin_schemas().get(schema_key)
}

pub fn builtin_schema_version(schema_key: &str) -> Option<&'static str> {
    builtin_schema_definition(schema_key)
        .and_then(|definition| definition.get("x-lix-version"))
        .and_then(|value| value.as_str())
}

#[cfg(test)]
mod tests {
    use super::{builtin_schema_definition, builtin_schema_keys};
    use crate::schema::validate_schema_definition;

    #[test]
    fn every_builtin_definition_is_valid() {
        for key in builtin_schema_keys() {
            let definition = builtin_schema_definition(key).expect("definition exists");
            validate_schema_definition(definition)
                .unwrap_or_else(|error| panic!("builtin schema {key} invalid: {error}"));
            assert_eq!(
                definition.get("x-lix-key").and_then(|v| v.as_str()),
                Some(key)
            );
        }
    }
}
