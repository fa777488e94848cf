use serde_json::Value as JsonValue;

use crate::LixError;

/// A parsed stored-schema definition. The definition itself is JSON Schema
/// (draft 7) extended with `x-lix-*` keywords; everything the engine derives
/// from those keywords is resolved here once.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSchema {
    pub key: String,
    pub version: String,
    pub definition: JsonValue,
    pub primary_key: Vec<String>,
    pub unique_groups: Vec<Vec<String>>,
    pub foreign_keys: Vec<ForeignKeyDefinition>,
    pub immutable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDefinition {
    pub properties: Vec<String>,
    pub referenced_schema_key: String,
    pub referenced_properties: Vec<String>,
}

impl StoredSchema {
    /// Property names that need projected columns on the materialized table:
    /// primary key, unique groups, and the local side of every foreign key.
    pub fn projected_properties(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if !out.iter().any(|existing| existing == name) {
                out.push(name.to_string());
            }
        };
        for name in &self.primary_key {
            push(name);
        }
        for group in &self.unique_groups {
            for name in group {
                push(name);
            }
        }
        for fk in &self.foreign_keys {
            for name in &fk.properties {
                push(name);
            }
        }
        out
    }

    /// `(property, expression)` pairs for `x-lix-default` keywords.
    pub fn default_expressions(&self) -> Vec<(String, String)> {
        let Some(properties) = self
            .definition
            .get("properties")
            .and_then(|value| value.as_object())
        else {
            return Vec::new();
        };
        properties
            .iter()
            .filter_map(|(name, property)| {
                property
                    .get("x-lix-default")
                    .and_then(|value| value.as_str())
                    .map(|expression| (name.clone(), expression.to_string()))
            })
            .collect()
    }
}

pub fn parse_stored_schema_snapshot(snapshot: &JsonValue) -> Result<StoredSchema, LixError> {
    let definition = snapshot
        .get("value")
        .ok_or_else(|| LixError::validation("stored schema snapshot_content missing 'value'"))?;
    parse_schema_definition(definition)
}

pub fn validate_schema_definition(definition: &JsonValue) -> Result<(), LixError> {
    parse_schema_definition(definition).map(|_| ())
}

fn parse_schema_definition(definition: &JsonValue) -> Result<StoredSchema, LixError> {
    let object = definition
        .as_object()
        .ok_or_else(|| LixError::validation("schema definition must be a JSON object"))?;

    let key = object
        .get("x-lix-key")
        .and_then(|value| value.as_str())
        .ok_or_else(|| LixError::validation("schema definition requires string x-lix-key"))?;
    if key.is_empty() || !key.chars().all(is_schema_key_char) {
        return Err(LixError::validation(format!(
            "invalid x-lix-key '{key}': only lowercase alphanumerics and underscores are allowed"
        )));
    }

    let version = object
        .get("x-lix-version")
        .and_then(|value| value.as_str())
        .ok_or_else(|| LixError::validation("schema definition requires string x-lix-version"))?;
    if version.is_empty() || !version.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(LixError::validation(format!(
            "invalid x-lix-version '{version}': must be a monotonic integer rendered as a string"
        )));
    }

    if object.get("type").and_then(|value| value.as_str()) != Some("object") {
        return Err(LixError::validation(
            "schema definition must declare type 'object'",
        ));
    }

    let primary_key = string_array(object.get("x-lix-primary-key"), "x-lix-primary-key")?;
    for name in &primary_key {
        require_property(definition, name, "x-lix-primary-key")?;
    }

    let mut unique_groups = Vec::new();
    if let Some(groups) = object.get("x-lix-unique") {
        let groups = groups
            .as_array()
            .ok_or_else(|| LixError::validation("x-lix-unique must be an array of arrays"))?;
        for group in groups {
            let names = string_array(Some(group), "x-lix-unique")?;
            for name in &names {
                require_property(definition, name, "x-lix-unique")?;
            }
            unique_groups.push(names);
        }
    }

    let mut foreign_keys = Vec::new();
    if let Some(raw_keys) = object.get("x-lix-foreign-keys") {
        let raw_keys = raw_keys
            .as_array()
            .ok_or_else(|| LixError::validation("x-lix-foreign-keys must be an array"))?;
        for (index, raw) in raw_keys.iter().enumerate() {
            let properties = string_array(raw.get("properties"), "x-lix-foreign-keys.properties")?;
            for name in &properties {
                require_property(definition, name, "x-lix-foreign-keys")?;
            }
            let references = raw.get("references").ok_or_else(|| {
                LixError::validation(format!(
                    "foreign key at index {index} missing references object"
                ))
            })?;
            let referenced_schema_key = references
                .get("schemaKey")
                .and_then(|value| value.as_str())
                .ok_or_else(|| {
                    LixError::validation(format!(
                        "foreign key at index {index} references.schemaKey must be a string"
                    ))
                })?
                .to_string();
            let referenced_properties = string_array(
                references.get("properties"),
                "x-lix-foreign-keys.references.properties",
            )?;
            if properties.len() != referenced_properties.len() {
                return Err(LixError::validation(format!(
                    "foreign key at index {index} has mismatched property counts"
                )));
            }
            foreign_keys.push(ForeignKeyDefinition {
                properties,
                referenced_schema_key,
                referenced_properties,
            });
        }
    }

    let immutable = object
        .get("x-lix-immutable")
        .and_then(|value| value.as_bool())
        .unwrap_or(false);

    Ok(StoredSchema {
        key: key.to_string(),
        version: version.to_string(),
        definition: definition.clone(),
        primary_key,
        unique_groups,
        foreign_keys,
        immutable,
    })
}

fn is_schema_key_char(ch: char) -> bool {
    ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_'
}

fn string_array(value: Option<&JsonValue>, context: &str) -> Result<Vec<String>, LixError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let array = value
        .as_array()
        .ok_or_else(|| LixError::validation(format!("{context} must be an array of strings")))?;
    array
        .iter()
        .map(|item| {
            item.as_str().map(|text| text.to_string()).ok_or_else(|| {
                LixError::validation(format!("{context} must be an array of strings"))
            })
        })
        .collect()
}

fn require_property(definition: &JsonValue, name: &str, context: &str) -> Result<(), LixError> {
    let exists = definition
        .get("properties")
        .and_then(|properties| properties.as_object())
        .map(|properties| properties.contains_key(name))
        .unwrap_or(false);
    if !exists {
        return Err(LixError::validation(format!(
            "{context} references missing property \"{name}\""
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{parse_stored_schema_snapshot, validate_schema_definition};
    use serde_json::json;

    #[test]
    fn parses_a_full_definition() {
        let snapshot = json!({
            "value": {
                "x-lix-key": "demo_item",
                "x-lix-version": "1",
                "type": "object",
                "properties": {
                    "id": { "type": "string", "x-lix-default": "lix_uuid_v7()" },
                    "bucket_id": { "type": "string" },
                    "name": { "type": "string" }
                },
                "required": ["id", "name"],
                "additionalProperties": false,
                "x-lix-primary-key": ["id"],
                "x-lix-unique": [["bucket_id", "name"]],
                "x-lix-foreign-keys": [{
                    "properties": ["bucket_id"],
                    "references": { "schemaKey": "demo_bucket", "properties": ["id"] }
                }]
            }
        });

        let schema = parse_stored_schema_snapshot(&snapshot).expect("parse schema");
        assert_eq!(schema.key, "demo_item");
        assert_eq!(schema.version, "1");
        assert_eq!(schema.primary_key, vec!["id"]);
        assert_eq!(
            schema.projected_properties(),
            vec!["id", "bucket_id", "name"]
        );
        assert_eq!(
            schema.default_expressions(),
            vec![("id".to_string(), "lix_uuid_v7()".to_string())]
        );
    }

    #[test]
    fn rejects_primary_key_over_missing_property() {
        let definition = json!({
            "x-lix-key": "demo_item",
            "x-lix-version": "1",
            "type": "object",
            "properties": { "id": { "type": "string" } },
            "x-lix-primary-key": ["missing"]
        });
        let err = validate_schema_definition(&definition).expect_err("should reject");
        assert!(err.to_string().contains("missing property \"missing\""));
    }

    #[test]
    fn rejects_non_numeric_version() {
        let definition = json!({
            "x-lix-key": "demo_item",
            "x-lix-version": "v1",
            "type": "object",
            "properties": {}
        });
        let err = validate_schema_definition(&definition).expect_err("should reject");
        assert!(err.to_string().contains("x-lix-version"));
    }

    #[test]
    fn rejects_uppercase_schema_keys() {
        let definition = json!({
            "x-lix-key": "DemoItem",
            "x-lix-version": "1",
            "type": "object",
            "properties": {}
        });
        assert!(validate_schema_definition(&definition).is_err());
    }
}
