use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use jsonschema::JSONSchema;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::builtin_schema::builtin_schema_definition;
use crate::cel::CelEvaluator;
use crate::exec::Executor;
use crate::functions::{FunctionProvider, SharedFunctionProvider};
use crate::schema::definition::parse_stored_schema_snapshot;
use crate::schema::{SchemaKey, StoredSchema};
use crate::{LixError, Value};

const STORED_SCHEMA_TABLE: &str = "lix_internal_state_materialized_v1_lix_stored_schema";

/// Per-handle cache of parsed stored schemas and their compiled validators.
/// Invalidated whenever the stored-schema table is written.
#[derive(Default)]
pub struct SchemaCache {
    schemas: RwLock<HashMap<SchemaKey, Arc<StoredSchema>>>,
    validators: RwLock<HashMap<SchemaKey, Arc<JSONSchema>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(&self) {
        self.schemas.write().unwrap().clear();
        self.validators.write().unwrap().clear();
    }

    /// Makes a just-written schema visible to later rows of the same execute
    /// before the transaction commits.
    pub fn remember(&self, schema: StoredSchema) {
        let key = SchemaKey::new(schema.key.clone(), schema.version.clone());
        self.schemas.write().unwrap().insert(key, Arc::new(schema));
    }

    pub(crate) async fn load(
        &self,
        exec: &mut Executor<'_>,
        key: &SchemaKey,
    ) -> Result<Arc<StoredSchema>, LixError> {
        if let Some(existing) = self.schemas.read().unwrap().get(key).cloned() {
            return Ok(existing);
        }

        if let Some(definition) = builtin_schema_definition(&key.schema_key) {
            let schema = parse_stored_schema_snapshot(&serde_json::json!({ "value": definition }))?;
            let schema = Arc::new(schema);
            self.schemas
                .write()
                .unwrap()
                .insert(key.clone(), schema.clone());
            return Ok(schema);
        }

        let sql = format!(
            "SELECT snapshot_content FROM \"{STORED_SCHEMA_TABLE}\" \
             WHERE entity_id = $1 AND version_id = 'global' \
               AND is_tombstone = 0 AND snapshot_content IS NOT NULL \
             LIMIT 1"
        );
        let entity_id = format!("{}~{}", key.schema_key, key.schema_version);
        let result = exec.execute_internal(&sql, &[Value::Text(entity_id)]).await?;
        let Some(row) = result.rows.first() else {
            return Err(LixError::not_found(format!(
                "schema '{}' version '{}' is not registered",
                key.schema_key, key.schema_version
            ))
            .with_schema_key(key.schema_key.clone()));
        };
        let schema = parse_snapshot_row(row)?;
        let schema = Arc::new(schema);
        self.schemas
            .write()
            .unwrap()
            .insert(key.clone(), schema.clone());
        Ok(schema)
    }

    pub(crate) async fn load_latest(
        &self,
        exec: &mut Executor<'_>,
        schema_key: &str,
    ) -> Result<Arc<StoredSchema>, LixError> {
        if let Some(definition) = builtin_schema_definition(schema_key) {
            let version = definition
                .get("x-lix-version")
                .and_then(|value| value.as_str())
                .unwrap_or("1");
            return self
                .load(exec, &SchemaKey::new(schema_key, version))
                .await;
        }

        {
            let schemas = self.schemas.read().unwrap();
            let latest = schemas
                .iter()
                .filter(|(key, _)| key.schema_key == schema_key)
                .max_by_key(|(key, _)| key.schema_version.parse::<u64>().unwrap_or(0))
                .map(|(_, schema)| schema.clone());
            if let Some(schema) = latest {
                return Ok(schema);
            }
        }

        let sql = format!(
            "SELECT snapshot_content FROM \"{STORED_SCHEMA_TABLE}\" \
             WHERE entity_id LIKE $1 AND version_id = 'global' \
               AND is_tombstone = 0 AND snapshot_content IS NOT NULL"
        );
        let result = exec
            .execute_internal(&sql, &[Value::Text(format!("{schema_key}~%"))])
            .await?;
        let mut latest: Option<StoredSchema> = None;
        for row in &result.rows {
            let schema = parse_snapshot_row(row)?;
            if schema.key != schema_key {
                continue;
            }
            let version = schema.version.parse::<u64>().unwrap_or(0);
            let current = latest
                .as_ref()
                .map(|existing| existing.version.parse::<u64>().unwrap_or(0));
            if current.map(|existing| version > existing).unwrap_or(true) {
                latest = Some(schema);
            }
        }
        let schema = latest.ok_or_else(|| {
            LixError::not_found(format!("schema '{schema_key}' is not registered"))
                .with_schema_key(schema_key.to_string())
        })?;
        let key = SchemaKey::new(schema.key.clone(), schema.version.clone());
        let schema = Arc::new(schema);
        self.schemas
            .write()
            .unwrap()
            .insert(key, schema.clone());
        Ok(schema)
    }

    fn validator(&self, schema: &StoredSchema) -> Result<Arc<JSONSchema>, LixError> {
        let key = SchemaKey::new(schema.key.clone(), schema.version.clone());
        if let Some(existing) = self.validators.read().unwrap().get(&key).cloned() {
            return Ok(existing);
        }
        let compiled = JSONSchema::options()
            .compile(&schema.definition)
            .map_err(|error| {
                LixError::validation(format!(
                    "failed to compile schema '{}' ({}): {error}",
                    schema.key, schema.version
                ))
            })?;
        let compiled = Arc::new(compiled);
        self.validators
            .write()
            .unwrap()
            .insert(key, compiled.clone());
        Ok(compiled)
    }

    /// Validates a snapshot against a registered schema and checks that the
    /// entity id agrees with the schema's primary key projection.
    pub(crate) fn validate_snapshot(
        &self,
        schema: &StoredSchema,
        entity_id: &str,
        snapshot: &JsonValue,
    ) -> Result<(), LixError> {
        let validator = self.validator(schema)?;
        if let Err(errors) = validator.validate(snapshot) {
            let mut parts = Vec::new();
            for error in errors {
                let path = error.instance_path.to_string();
                let message = error.to_string();
                if path.is_empty() {
                    parts.push(message);
                } else {
                    parts.push(format!("{path} {message}"));
                }
            }
            return Err(LixError::validation(format!(
                "snapshot_content does not match schema '{}' ({}): {}",
                schema.key,
                schema.version,
                parts.join("; ")
            ))
            .with_entity(entity_id.to_string())
            .with_schema_key(schema.key.clone()));
        }

        if !schema.primary_key.is_empty() {
            let expected = primary_key_entity_id(schema, snapshot)?;
            if entity_id != expected {
                return Err(LixError::validation(format!(
                    "entity_id '{entity_id}' does not match primary key projection '{expected}'"
                ))
                .with_entity(entity_id.to_string())
                .with_schema_key(schema.key.clone()));
            }
        }

        Ok(())
    }
}

fn parse_snapshot_row(row: &[Value]) -> Result<StoredSchema, LixError> {
    let raw = row
        .first()
        .and_then(|value| value.as_text())
        .ok_or_else(|| LixError::validation("stored schema row missing snapshot_content"))?;
    let snapshot: JsonValue = serde_json::from_str(raw)
        .map_err(|error| LixError::validation(format!("stored schema snapshot invalid: {error}")))?;
    parse_stored_schema_snapshot(&snapshot)
}

/// The canonical entity id of a row is its primary-key values joined by `~`.
pub fn primary_key_entity_id(
    schema: &StoredSchema,
    snapshot: &JsonValue,
) -> Result<String, LixError> {
    let mut parts = Vec::with_capacity(schema.primary_key.len());
    for property in &schema.primary_key {
        let value = snapshot.get(property).ok_or_else(|| {
            LixError::validation(format!(
                "snapshot for schema '{}' is missing primary key property '{}'",
                schema.key, property
            ))
        })?;
        match value {
            JsonValue::String(text) => parts.push(text.clone()),
            JsonValue::Number(number) => parts.push(number.to_string()),
            other => parts.push(other.to_string()),
        }
    }
    Ok(parts.join("~"))
}

/// Fills absent properties that declare an `x-lix-default` CEL expression.
/// Present properties are never overwritten.
pub fn apply_default_values<P>(
    evaluator: &CelEvaluator,
    functions: &SharedFunctionProvider<P>,
    schema: &StoredSchema,
    snapshot: &JsonValue,
) -> Result<JsonValue, LixError>
where
    P: FunctionProvider + Send + 'static,
{
    let defaults = schema.default_expressions();
    if defaults.is_empty() {
        return Ok(snapshot.clone());
    }

    let mut object: JsonMap<String, JsonValue> = snapshot
        .as_object()
        .cloned()
        .ok_or_else(|| LixError::validation("snapshot_content must be a JSON object"))?;

    for (property, expression) in defaults {
        if object.contains_key(&property) {
            continue;
        }
        let value = evaluator.evaluate_with_functions(&expression, &object, functions.clone())?;
        object.insert(property, value);
    }

    Ok(JsonValue::Object(object))
}

#[cfg(test)]
mod tests {
    use super::{apply_default_values, primary_key_entity_id, SchemaCache};
    use crate::cel::CelEvaluator;
    use crate::functions::{SharedFunctionProvider, SystemFunctionProvider};
    use crate::schema::parse_stored_schema_snapshot;
    use serde_json::json;

    fn demo_schema() -> crate::schema::StoredSchema {
        parse_stored_schema_snapshot(&json!({
            "value": {
                "x-lix-key": "demo_item",
                "x-lix-version": "1",
                "type": "object",
                "properties": {
                    "id": { "type": "string", "x-lix-default": "lix_uuid_v7()" },
                    "name": { "type": "string" }
                },
                "required": ["id", "name"],
                "additionalProperties": false,
                "x-lix-primary-key": ["id"]
            }
        }))
        .expect("parse schema")
    }

    #[test]
    fn validates_matching_snapshot() {
        let cache = SchemaCache::new();
        let schema = demo_schema();
        cache
            .validate_snapshot(&schema, "a", &json!({"id": "a", "name": "first"}))
            .expect("snapshot should validate");
    }

    #[test]
    fn rejects_snapshot_with_wrong_type() {
        let cache = SchemaCache::new();
        let schema = demo_schema();
        let err = cache
            .validate_snapshot(&schema, "a", &json!({"id": "a", "name": 5}))
            .expect_err("snapshot should fail validation");
        assert_eq!(err.kind, crate::ErrorKind::Validation);
    }

    #[test]
    fn rejects_entity_id_mismatching_primary_key() {
        let cache = SchemaCache::new();
        let schema = demo_schema();
        let err = cache
            .validate_snapshot(&schema, "other", &json!({"id": "a", "name": "first"}))
            .expect_err("entity id mismatch should fail");
        assert!(err.to_string().contains("primary key projection"));
    }

    #[test]
    fn applies_defaults_only_for_absent_properties() {
        let schema = demo_schema();
        let evaluator = CelEvaluator::new();
        let functions = SharedFunctionProvider::new(SystemFunctionProvider);
        let filled = apply_default_values(
            &evaluator,
            &functions,
            &schema,
            &json!({"name": "first"}),
        )
        .expect("apply defaults");
        assert!(filled.get("id").and_then(|v| v.as_str()).is_some());

        let untouched = apply_default_values(
            &evaluator,
            &functions,
            &schema,
            &json!({"id": "fixed", "name": "first"}),
        )
        .expect("apply defaults");
        assert_eq!(untouched.get("id"), Some(&json!("fixed")));
    }

    #[test]
    fn joins_composite_primary_keys_with_tilde() {
        let schema = parse_stored_schema_snapshot(&json!({
            "value": {
                "x-lix-key": "demo_edge",
                "x-lix-version": "1",
                "type": "object",
                "properties": {
                    "parent_id": { "type": "string" },
                    "child_id": { "type": "string" }
                },
                "x-lix-primary-key": ["parent_id", "child_id"]
            }
        }))
        .expect("parse schema");
        let entity_id =
            primary_key_entity_id(&schema, &json!({"parent_id": "p", "child_id": "c"}))
                .expect("project entity id");
        assert_eq!(entity_id, "p~c");
    }
}
