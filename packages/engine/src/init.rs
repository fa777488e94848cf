use serde_json::json;

use crate::builtin_schema::{builtin_schema_definition, builtin_schema_keys};
use crate::schema::parse_stored_schema_snapshot;
use crate::schema_registry::{rebuild_vtable_view_sql, register_schema_sql_statements};
use crate::storage::{
    BINARY_BLOB_MANIFEST_CHUNK_TABLE, BINARY_BLOB_MANIFEST_TABLE, BINARY_CHUNK_STORE_TABLE,
    BINARY_FILE_VERSION_REF_TABLE, CHANGE_TABLE, COMMIT_GRAPH_TABLE, FILE_DATA_CACHE_TABLE,
    FILE_HISTORY_CACHE_TABLE, FILE_PATH_CACHE_TABLE, MATERIALIZATION_ROOT_TABLE,
    NO_CONTENT_SNAPSHOT_ID, PLUGIN_TABLE, SNAPSHOT_TABLE,
};
use crate::{LixBackend, LixError, SqlDialect};

fn blob_type(dialect: SqlDialect) -> &'static str {
    match dialect {
        SqlDialect::Sqlite => "BLOB",
        SqlDialect::Postgres => "BYTEA",
    }
}

/// Idempotent internal DDL, run at every open before anything else touches
/// the backend.
pub(crate) fn init_statements(dialect: SqlDialect) -> Vec<String> {
    let blob = blob_type(dialect);
    let mut statements = vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {SNAPSHOT_TABLE} (\
             id TEXT PRIMARY KEY,\
             content TEXT\
             )"
        ),
        format!(
            "INSERT INTO {SNAPSHOT_TABLE} (id, content) VALUES ('{NO_CONTENT_SNAPSHOT_ID}', NULL) \
             ON CONFLICT (id) DO NOTHING"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {CHANGE_TABLE} (\
             id TEXT PRIMARY KEY,\
             entity_id TEXT NOT NULL,\
             schema_key TEXT NOT NULL,\
             schema_version TEXT NOT NULL,\
             file_id TEXT NOT NULL,\
             plugin_key TEXT NOT NULL,\
             snapshot_id TEXT NOT NULL,\
             metadata TEXT,\
             created_at TEXT NOT NULL\
             )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_lix_internal_change_entity \
             ON {CHANGE_TABLE} (entity_id, schema_key)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_lix_internal_change_file \
             ON {CHANGE_TABLE} (file_id)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS lix_internal_state_untracked (\
             entity_id TEXT NOT NULL,\
             schema_key TEXT NOT NULL,\
             file_id TEXT NOT NULL,\
             version_id TEXT NOT NULL,\
             plugin_key TEXT NOT NULL,\
             schema_version TEXT NOT NULL,\
             snapshot_content TEXT,\
             created_at TEXT NOT NULL,\
             updated_at TEXT NOT NULL,\
             PRIMARY KEY (entity_id, schema_key, file_id, version_id)\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {COMMIT_GRAPH_TABLE} (\
             root_commit_id TEXT NOT NULL,\
             commit_id TEXT NOT NULL,\
             depth INTEGER NOT NULL,\
             PRIMARY KEY (root_commit_id, commit_id)\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {MATERIALIZATION_ROOT_TABLE} (\
             root_commit_id TEXT PRIMARY KEY,\
             max_depth INTEGER\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {FILE_DATA_CACHE_TABLE} (\
             file_id TEXT NOT NULL,\
             version_id TEXT NOT NULL,\
             data {blob} NOT NULL,\
             plugin_key TEXT NOT NULL,\
             updated_at TEXT NOT NULL,\
             PRIMARY KEY (file_id, version_id)\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {FILE_PATH_CACHE_TABLE} (\
             version_id TEXT NOT NULL,\
             path TEXT NOT NULL,\
             file_id TEXT NOT NULL,\
             updated_at TEXT NOT NULL,\
             PRIMARY KEY (version_id, path)\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {FILE_HISTORY_CACHE_TABLE} (\
             file_id TEXT NOT NULL,\
             root_commit_id TEXT NOT NULL,\
             depth INTEGER NOT NULL,\
             commit_id TEXT NOT NULL,\
             data {blob} NOT NULL,\
             created_at TEXT NOT NULL,\
             refreshed_at TEXT NOT NULL,\
             PRIMARY KEY (file_id, root_commit_id, depth)\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {PLUGIN_TABLE} (\
             key TEXT PRIMARY KEY,\
             manifest_json TEXT NOT NULL,\
             code {blob} NOT NULL,\
             installed_at TEXT NOT NULL\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {BINARY_CHUNK_STORE_TABLE} (\
             chunk_hash TEXT PRIMARY KEY,\
             codec TEXT NOT NULL,\
             payload {blob} NOT NULL,\
             size_bytes INTEGER NOT NULL,\
             created_at TEXT NOT NULL\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {BINARY_BLOB_MANIFEST_TABLE} (\
             blob_hash TEXT PRIMARY KEY,\
             size_bytes INTEGER NOT NULL,\
             chunk_count INTEGER NOT NULL,\
             created_at TEXT NOT NULL\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {BINARY_BLOB_MANIFEST_CHUNK_TABLE} (\
             blob_hash TEXT NOT NULL REFERENCES {BINARY_BLOB_MANIFEST_TABLE} (blob_hash),\
             ordinal INTEGER NOT NULL,\
             chunk_hash TEXT NOT NULL REFERENCES {BINARY_CHUNK_STORE_TABLE} (chunk_hash),\
             size_bytes INTEGER NOT NULL,\
             PRIMARY KEY (blob_hash, ordinal)\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {BINARY_FILE_VERSION_REF_TABLE} (\
             file_id TEXT NOT NULL,\
             version_id TEXT NOT NULL,\
             blob_hash TEXT NOT NULL REFERENCES {BINARY_BLOB_MANIFEST_TABLE} (blob_hash),\
             size_bytes INTEGER NOT NULL,\
             updated_at TEXT NOT NULL,\
             PRIMARY KEY (file_id, version_id)\
             )"
        ),
    ];

    for schema_key in builtin_schema_keys() {
        let definition = builtin_schema_definition(schema_key)
            .expect("builtin schema keys enumerate existing definitions");
        let schema = parse_stored_schema_snapshot(&json!({ "value": definition }))
            .expect("builtin schema definitions are valid");
        statements.extend(
            register_schema_sql_statements(&schema, dialect)
                .expect("builtin schema DDL is well formed"),
        );
    }

    statements.extend(rebuild_vtable_view_sql(
        &builtin_schema_keys()
            .map(|key| key.to_string())
            .collect::<Vec<_>>(),
    ));

    statements
}

pub(crate) async fn init_backend(backend: &dyn LixBackend) -> Result<(), LixError> {
    for statement in init_statements(backend.dialect()) {
        backend.execute(&statement, &[]).await?;
    }
    Ok(())
}
