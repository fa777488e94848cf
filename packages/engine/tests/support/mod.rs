pub mod json_plugin;

use std::sync::Arc;

use lix_engine::{boot, BootArgs, Engine, SqliteBackend, SqliteConfig, Value};
use serde_json::json;

use self::json_plugin::JsonPluginHost;

pub async fn open_engine() -> Engine {
    let backend = SqliteBackend::open(SqliteConfig::in_memory()).expect("open sqlite backend");
    boot(BootArgs::new(Box::new(backend)).with_plugin_host(Arc::new(JsonPluginHost)))
        .await
        .expect("boot engine")
}

pub async fn open_deterministic_engine() -> Engine {
    let backend = SqliteBackend::open(SqliteConfig::in_memory()).expect("open sqlite backend");
    boot(
        BootArgs::new(Box::new(backend))
            .with_plugin_host(Arc::new(JsonPluginHost))
            .with_key_value("lix_deterministic_mode", json!({ "enabled": true })),
    )
    .await
    .expect("boot deterministic engine")
}

pub fn text(value: &Value) -> String {
    match value {
        Value::Text(text) => text.clone(),
        other => panic!("expected text value, got {other:?}"),
    }
}

pub fn integer(value: &Value) -> i64 {
    match value {
        Value::Integer(number) => *number,
        other => panic!("expected integer value, got {other:?}"),
    }
}

pub fn blob(value: &Value) -> Vec<u8> {
    match value {
        Value::Blob(bytes) => bytes.clone(),
        other => panic!("expected blob value, got {other:?}"),
    }
}

/// Registers a small object schema commonly used by the state tests.
pub async fn register_demo_schema(engine: &Engine) {
    engine
        .execute(
            "INSERT INTO lix_state (schema_key, snapshot_content) VALUES (\
             'lix_stored_schema',\
             '{\"value\":{\"x-lix-key\":\"demo_item\",\"x-lix-version\":\"1\",\
             \"type\":\"object\",\"properties\":{\"id\":{\"type\":\"string\"},\
             \"value\":{\"type\":\"string\"}},\"required\":[\"id\",\"value\"],\
             \"additionalProperties\":false,\"x-lix-primary-key\":[\"id\"]}}'\
             )",
            &[],
        )
        .await
        .expect("register demo schema");
}

/// Registers the pointer schema emitted by the in-process JSON plugin.
pub async fn register_json_property_schema(engine: &Engine) {
    engine
        .execute(
            "INSERT INTO lix_state (schema_key, snapshot_content) VALUES (\
             'lix_stored_schema',\
             '{\"value\":{\"x-lix-key\":\"json_property\",\"x-lix-version\":\"1\",\
             \"type\":\"object\",\"properties\":{\"path\":{\"type\":\"string\"},\
             \"value\":{}},\"required\":[\"path\",\"value\"],\
             \"additionalProperties\":false}}'\
             )",
            &[],
        )
        .await
        .expect("register json property schema");
}

pub async fn install_json_plugin(engine: &Engine) {
    register_json_property_schema(engine).await;
    engine
        .install_plugin(json_plugin::manifest(), Vec::new())
        .await
        .expect("install json plugin");
}

pub async fn insert_demo_item(engine: &Engine, entity_id: &str, value: &str) {
    engine
        .execute(
            "INSERT INTO lix_state (entity_id, schema_key, snapshot_content) VALUES (?1, 'demo_item', ?2)",
            &[
                Value::Text(entity_id.to_string()),
                Value::Text(format!("{{\"id\":\"{entity_id}\",\"value\":\"{value}\"}}")),
            ],
        )
        .await
        .expect("insert demo item");
}
