use crate::schema::StoredSchema;
use crate::{LixError, SqlDialect};

pub const MATERIALIZED_PREFIX: &str = "lix_internal_state_materialized_v1_";
pub const VTABLE_VIEW: &str = "lix_internal_state_vtable";
pub const UNTRACKED_TABLE: &str = "lix_internal_state_untracked";

pub fn materialized_table_name(schema_key: &str) -> String {
    format!("{MATERIALIZED_PREFIX}{schema_key}")
}

/// DDL for one schema's materialized table: the shared column set, STORED
/// generated projections for the schema's key fields, UNIQUE constraints per
/// `x-lix-unique` group scoped by version, and the standard index set.
/// Foreign keys run in materialized mode and are enforced by the commit
/// generator rather than by backend constraints.
pub fn register_schema_sql_statements(
    schema: &StoredSchema,
    dialect: SqlDialect,
) -> Result<Vec<String>, LixError> {
    let table_name = materialized_table_name(&schema.key);
    let table_ident = quote_ident(&table_name);

    let mut columns = vec![
        "entity_id TEXT NOT NULL".to_string(),
        "schema_key TEXT NOT NULL".to_string(),
        "schema_version TEXT NOT NULL".to_string(),
        "file_id TEXT NOT NULL".to_string(),
        "version_id TEXT NOT NULL".to_string(),
        "plugin_key TEXT NOT NULL".to_string(),
        "snapshot_content TEXT".to_string(),
        "change_id TEXT".to_string(),
        "commit_id TEXT".to_string(),
        "metadata TEXT".to_string(),
        "is_tombstone INTEGER NOT NULL DEFAULT 0".to_string(),
        "created_at TEXT NOT NULL".to_string(),
        "updated_at TEXT NOT NULL".to_string(),
    ];

    for property in schema.projected_properties() {
        let column = quote_ident(&projected_column_name(&property));
        let expression = json_text_extract_expr(dialect, &property);
        columns.push(format!(
            "{column} TEXT GENERATED ALWAYS AS ({expression}) STORED"
        ));
    }

    let mut constraints = vec!["PRIMARY KEY (entity_id, file_id, version_id)".to_string()];
    for group in &schema.unique_groups {
        let mut parts = group
            .iter()
            .map(|property| quote_ident(&projected_column_name(property)))
            .collect::<Vec<_>>();
        parts.push("version_id".to_string());
        constraints.push(format!("UNIQUE ({})", parts.join(", ")));
    }

    let mut statements = vec![format!(
        "CREATE TABLE IF NOT EXISTS {table} ({columns}, {constraints})",
        table = table_ident,
        columns = columns.join(", "),
        constraints = constraints.join(", "),
    )];

    statements.push(format!(
        "CREATE INDEX IF NOT EXISTS {index} ON {table} (version_id, file_id, entity_id)",
        index = quote_ident(&index_name(&schema.key, "vfe")),
        table = table_ident,
    ));
    statements.push(format!(
        "CREATE INDEX IF NOT EXISTS {index} ON {table} (version_id, entity_id)",
        index = quote_ident(&index_name(&schema.key, "ve")),
        table = table_ident,
    ));
    statements.push(format!(
        "CREATE INDEX IF NOT EXISTS {index} ON {table} (file_id, version_id)",
        index = quote_ident(&index_name(&schema.key, "fv")),
        table = table_ident,
    ));
    statements.push(format!(
        "CREATE INDEX IF NOT EXISTS {index} \
         ON {table} (version_id, file_id, entity_id) \
         WHERE is_tombstone = 0 AND snapshot_content IS NOT NULL",
        index = quote_ident(&index_name(&schema.key, "live_vfe")),
        table = table_ident,
    ));

    Ok(statements)
}

/// Rebuilds the vtable view as the union of every registered materialized
/// table plus the untracked overlay. Untracked rows surface with
/// `untracked = 1` and a fixed `'untracked'` commit id.
pub fn rebuild_vtable_view_sql(schema_keys: &[String]) -> Vec<String> {
    let mut selects = Vec::with_capacity(schema_keys.len() + 1);
    for schema_key in schema_keys {
        let table = quote_ident(&materialized_table_name(schema_key));
        selects.push(format!(
            "SELECT entity_id, schema_key, schema_version, file_id, version_id, plugin_key, \
             snapshot_content, change_id, commit_id, metadata, is_tombstone, 0 AS untracked, \
             created_at, updated_at FROM {table}"
        ));
    }
    selects.push(format!(
        "SELECT entity_id, schema_key, schema_version, file_id, version_id, plugin_key, \
         snapshot_content, NULL AS change_id, 'untracked' AS commit_id, NULL AS metadata, \
         0 AS is_tombstone, 1 AS untracked, created_at, updated_at FROM {UNTRACKED_TABLE}"
    ));

    vec![
        format!("DROP VIEW IF EXISTS {VTABLE_VIEW}"),
        format!(
            "CREATE VIEW {VTABLE_VIEW} AS {}",
            selects.join(" UNION ALL ")
        ),
    ]
}

pub fn projected_column_name(property: &str) -> String {
    format!("prop_{property}")
}

fn index_name(schema_key: &str, suffix: &str) -> String {
    format!("idx_{MATERIALIZED_PREFIX}{schema_key}_{suffix}")
}

pub fn quote_ident(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{escaped}\"")
}

pub fn json_text_extract_expr(dialect: SqlDialect, key: &str) -> String {
    match dialect {
        SqlDialect::Sqlite => format!("json_extract(snapshot_content, '$.{key}')"),
        SqlDialect::Postgres => format!("(snapshot_content::jsonb ->> '{key}')"),
    }
}
