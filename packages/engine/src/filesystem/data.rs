use serde_json::Value as JsonValue;

use crate::binary;
use crate::builtin_schema::{
    BINARY_BLOB_REF_SCHEMA_KEY, DIRECTORY_DESCRIPTOR_SCHEMA_KEY, FILE_DESCRIPTOR_SCHEMA_KEY,
    VERSION_DESCRIPTOR_SCHEMA_KEY,
};
use crate::exec::Executor;
use crate::plugin::{PluginEntityState, PluginFileDescriptor, PluginRegistry};
use crate::schema_registry::{materialized_table_name, projected_column_name, quote_ident};
use crate::sql::contracts::{FileDataRequirement, VersionScope};
use crate::sql::escape_sql_string;
use crate::sql::planner::file_read::build_file_query;
use crate::sql::planner::state_read::{
    build_effective_state_query, ScanProjection, ScanScope, StatePushdown,
};
use crate::storage::{FILE_DATA_CACHE_TABLE, FILE_PATH_CACHE_TABLE};
use crate::version::GLOBAL_VERSION_ID;
use crate::vtable_write::WriteContext;
use crate::{LixError, Value};

/// Descriptor-level facts about one file in one version.
#[derive(Debug, Clone)]
pub(crate) struct FileView {
    pub(crate) id: String,
    pub(crate) path: String,
    pub(crate) metadata: Option<JsonValue>,
}

/// Makes sure every file the statement can touch has bytes in the file-data
/// cache before the lowered SQL runs.
pub(crate) async fn ensure_file_data(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    plugins: &PluginRegistry,
    requirement: &FileDataRequirement,
) -> Result<(), LixError> {
    let versions = resolve_versions(exec, ctx, &requirement.version).await?;
    for version_id in versions {
        let files = resolve_files(exec, ctx, requirement, &version_id).await?;
        for file in files {
            let cached = cached_file_data(exec, &file.id, &version_id).await?;
            if cached.is_none() {
                let _ = materialize_file_data(exec, ctx, plugins, &file, &version_id).await?;
            }
        }
    }
    Ok(())
}

async fn resolve_versions(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    scope: &VersionScope,
) -> Result<Vec<String>, LixError> {
    match scope {
        VersionScope::Active => Ok(vec![ctx.active_version_id.clone()]),
        VersionScope::Versions(values) if !values.is_empty() => Ok(values.clone()),
        VersionScope::Versions(_) => {
            let table = quote_ident(&materialized_table_name(VERSION_DESCRIPTOR_SCHEMA_KEY));
            let id_column = quote_ident(&projected_column_name("id"));
            let result = exec
                .execute(
                    &format!(
                        "SELECT {id_column} FROM {table} \
                         WHERE version_id = '{GLOBAL_VERSION_ID}' AND is_tombstone = 0 \
                           AND snapshot_content IS NOT NULL"
                    ),
                    &[],
                )
                .await?;
            Ok(result
                .rows
                .iter()
                .filter_map(|row| row.first().and_then(|value| value.as_text()))
                .map(|text| text.to_string())
                .collect())
        }
    }
}

async fn resolve_files(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    requirement: &FileDataRequirement,
    version_id: &str,
) -> Result<Vec<FileView>, LixError> {
    if let Some(path) = &requirement.path_equals {
        if let Some(file_id) = cached_path_lookup(exec, version_id, path).await? {
            if let Some(file) = load_file_view(exec, ctx, &file_id, version_id).await? {
                return Ok(vec![file]);
            }
        }
        return Ok(find_file_by_path(exec, ctx, path, version_id)
            .await?
            .into_iter()
            .collect());
    }
    if let Some(file_id) = &requirement.file_id_equals {
        return Ok(load_file_view(exec, ctx, file_id, version_id)
            .await?
            .into_iter()
            .collect());
    }
    list_file_views(exec, ctx, version_id).await
}

fn version_scan_scope(version_id: &str) -> ScanScope {
    ScanScope::VersionValues(vec![format!("'{}'", escape_sql_string(version_id))])
}

/// Loads id/path/metadata for one file through the same lowering the read
/// path uses, so inherited descriptors resolve identically.
pub(crate) async fn load_file_view(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    file_id: &str,
    version_id: &str,
) -> Result<Option<FileView>, LixError> {
    let scope = version_scan_scope(version_id);
    let id_literal = format!("'{}'", escape_sql_string(file_id));
    let sql = build_file_query(&scope, Some(&id_literal), &ctx.catalog)
        .map_err(LixError::from)?;
    let result = exec
        .execute(
            &format!("SELECT id, path, metadata FROM ({sql}) AS f LIMIT 1"),
            &[],
        )
        .await?;
    parse_file_view_row(result.rows.first())
}

pub(crate) async fn find_file_by_path(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    path: &str,
    version_id: &str,
) -> Result<Option<FileView>, LixError> {
    let scope = version_scan_scope(version_id);
    let sql = build_file_query(&scope, None, &ctx.catalog).map_err(LixError::from)?;
    let result = exec
        .execute_internal(
            &format!("SELECT id, path, metadata FROM ({sql}) AS f WHERE f.path = $1 LIMIT 1"),
            &[Value::Text(path.to_string())],
        )
        .await?;
    let view = parse_file_view_row(result.rows.first())?;
    if let Some(view) = &view {
        upsert_path_cache(exec, version_id, &view.path, &view.id).await?;
    }
    Ok(view)
}

async fn list_file_views(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    version_id: &str,
) -> Result<Vec<FileView>, LixError> {
    let scope = version_scan_scope(version_id);
    let sql = build_file_query(&scope, None, &ctx.catalog).map_err(LixError::from)?;
    let result = exec
        .execute(&format!("SELECT id, path, metadata FROM ({sql}) AS f"), &[])
        .await?;
    let mut views = Vec::with_capacity(result.rows.len());
    for row in &result.rows {
        if let Some(view) = parse_file_view_row(Some(row))? {
            views.push(view);
        }
    }
    Ok(views)
}

fn parse_file_view_row(row: Option<&Vec<Value>>) -> Result<Option<FileView>, LixError> {
    let Some(row) = row else {
        return Ok(None);
    };
    let id = row
        .first()
        .and_then(|value| value.as_text())
        .ok_or_else(|| LixError::planner_invariant("file view row missing id"))?
        .to_string();
    let path = row
        .get(1)
        .and_then(|value| value.as_text())
        .ok_or_else(|| LixError::planner_invariant("file view row missing path"))?
        .to_string();
    let metadata = match row.get(2) {
        Some(Value::Text(text)) => serde_json::from_str(text).ok(),
        _ => None,
    };
    Ok(Some(FileView { id, path, metadata }))
}

/// Computes the bytes of one file in one version and caches them: plugin
/// `apply_changes` over the file's live entities, or the binary CAS for
/// files without a matching plugin.
pub(crate) async fn materialize_file_data(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    plugins: &PluginRegistry,
    file: &FileView,
    version_id: &str,
) -> Result<Vec<u8>, LixError> {
    let plugin = plugins.select_for_path(exec, &file.path).await?;
    let (bytes, plugin_key) = match plugin {
        Some(plugin) => {
            let entities = load_file_entities(exec, ctx, &file.id, version_id).await?;
            let descriptor = PluginFileDescriptor {
                id: file.id.clone(),
                path: file.path.clone(),
                metadata: file.metadata.clone(),
            };
            let bytes = plugins
                .apply_changes(&plugin, &descriptor, &entities)
                .await?;
            (bytes, plugin.manifest.key.clone())
        }
        None => {
            let blob_hash = binary::current_blob_hash(exec, &file.id, version_id).await?;
            let bytes = match blob_hash {
                Some(blob_hash) => binary::read_blob(exec, &blob_hash).await?,
                None => {
                    // Inherited binary files keep their bytes under the
                    // ancestor version's reference.
                    match inherited_blob_hash(exec, ctx, &file.id, version_id).await? {
                        Some(blob_hash) => binary::read_blob(exec, &blob_hash).await?,
                        None => Vec::new(),
                    }
                }
            };
            (bytes, "lix_binary_fallback".to_string())
        }
    };

    upsert_file_data_cache(exec, ctx, &file.id, version_id, &bytes, &plugin_key).await?;
    upsert_path_cache(exec, version_id, &file.path, &file.id).await?;
    Ok(bytes)
}

/// The effective `lix_binary_blob_ref` entity carries the blob hash for
/// files stored through the fallback, including inherited visibility.
async fn inherited_blob_hash(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    file_id: &str,
    version_id: &str,
) -> Result<Option<String>, LixError> {
    let mut pushdown = StatePushdown::default();
    pushdown.schema_key_literal = Some(BINARY_BLOB_REF_SCHEMA_KEY.to_string());
    pushdown
        .source
        .push(format!("s.schema_key = '{BINARY_BLOB_REF_SCHEMA_KEY}'"));
    pushdown.source.push(format!(
        "s.entity_id = '{}'",
        escape_sql_string(file_id)
    ));
    let scan = build_effective_state_query(
        &version_scan_scope(version_id),
        &pushdown,
        ScanProjection::Full,
        &ctx.catalog,
    )
    .map_err(LixError::from)?;
    let result = exec
        .execute(
            &format!("SELECT snapshot_content FROM ({scan}) AS t LIMIT 1"),
            &[],
        )
        .await?;
    let Some(raw) = result
        .rows
        .first()
        .and_then(|row| row.first())
        .and_then(|value| value.as_text())
    else {
        return Ok(None);
    };
    let snapshot: JsonValue = serde_json::from_str(raw)
        .map_err(|error| LixError::validation(format!("blob ref snapshot invalid: {error}")))?;
    Ok(snapshot
        .get("blob_hash")
        .and_then(|value| value.as_str())
        .map(|text| text.to_string()))
}

/// Live entities belonging to a file (everything except descriptors and the
/// engine's blob-ref bookkeeping), as plugin input.
pub(crate) async fn load_file_entities(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    file_id: &str,
    version_id: &str,
) -> Result<Vec<PluginEntityState>, LixError> {
    let mut pushdown = StatePushdown::default();
    pushdown.source.push(format!(
        "s.file_id = '{}'",
        escape_sql_string(file_id)
    ));
    let scan = build_effective_state_query(
        &version_scan_scope(version_id),
        &pushdown,
        ScanProjection::Full,
        &ctx.catalog,
    )
    .map_err(LixError::from)?;
    let sql = format!(
        "SELECT entity_id, schema_key, schema_version, snapshot_content FROM ({scan}) AS t \
         WHERE t.schema_key NOT IN ('{FILE_DESCRIPTOR_SCHEMA_KEY}', \
           '{DIRECTORY_DESCRIPTOR_SCHEMA_KEY}', '{BINARY_BLOB_REF_SCHEMA_KEY}') \
         ORDER BY t.entity_id"
    );
    let result = exec.execute(&sql, &[]).await?;

    let mut entities = Vec::with_capacity(result.rows.len());
    for row in &result.rows {
        let entity_id = row
            .first()
            .and_then(|value| value.as_text())
            .ok_or_else(|| LixError::planner_invariant("entity row missing entity_id"))?;
        let schema_key = row
            .get(1)
            .and_then(|value| value.as_text())
            .ok_or_else(|| LixError::planner_invariant("entity row missing schema_key"))?;
        let schema_version = row
            .get(2)
            .and_then(|value| value.as_text())
            .ok_or_else(|| LixError::planner_invariant("entity row missing schema_version"))?;
        let Some(raw) = row.get(3).and_then(|value| value.as_text()) else {
            continue;
        };
        let snapshot: JsonValue = serde_json::from_str(raw).map_err(|error| {
            LixError::validation(format!("entity snapshot invalid JSON: {error}"))
        })?;
        entities.push(PluginEntityState {
            entity_id: entity_id.to_string(),
            schema_key: schema_key.to_string(),
            schema_version: schema_version.to_string(),
            snapshot_content: snapshot,
        });
    }
    Ok(entities)
}

pub(crate) async fn cached_file_data(
    exec: &mut Executor<'_>,
    file_id: &str,
    version_id: &str,
) -> Result<Option<Vec<u8>>, LixError> {
    let result = exec
        .execute_internal(
            &format!(
                "SELECT data FROM {FILE_DATA_CACHE_TABLE} \
                 WHERE file_id = $1 AND version_id = $2 LIMIT 1"
            ),
            &[
                Value::Text(file_id.to_string()),
                Value::Text(version_id.to_string()),
            ],
        )
        .await?;
    Ok(match result.rows.first().and_then(|row| row.first()) {
        Some(Value::Blob(bytes)) => Some(bytes.clone()),
        _ => None,
    })
}

pub(crate) async fn upsert_file_data_cache(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    file_id: &str,
    version_id: &str,
    data: &[u8],
    plugin_key: &str,
) -> Result<(), LixError> {
    let now = ctx.functions.timestamp();
    exec.execute_internal(
        &format!(
            "INSERT INTO {FILE_DATA_CACHE_TABLE} \
             (file_id, version_id, data, plugin_key, updated_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (file_id, version_id) DO UPDATE SET \
               data = excluded.data, \
               plugin_key = excluded.plugin_key, \
               updated_at = excluded.updated_at"
        ),
        &[
            Value::Text(file_id.to_string()),
            Value::Text(version_id.to_string()),
            Value::Blob(data.to_vec()),
            Value::Text(plugin_key.to_string()),
            Value::Text(now),
        ],
    )
    .await?;
    Ok(())
}

pub(crate) async fn upsert_path_cache(
    exec: &mut Executor<'_>,
    version_id: &str,
    path: &str,
    file_id: &str,
) -> Result<(), LixError> {
    exec.execute_internal(
        &format!(
            "INSERT INTO {FILE_PATH_CACHE_TABLE} (version_id, path, file_id, updated_at) \
             VALUES ($1, $2, $3, '') \
             ON CONFLICT (version_id, path) DO UPDATE SET \
               file_id = excluded.file_id"
        ),
        &[
            Value::Text(version_id.to_string()),
            Value::Text(path.to_string()),
            Value::Text(file_id.to_string()),
        ],
    )
    .await?;
    Ok(())
}

async fn cached_path_lookup(
    exec: &mut Executor<'_>,
    version_id: &str,
    path: &str,
) -> Result<Option<String>, LixError> {
    let result = exec
        .execute_internal(
            &format!(
                "SELECT file_id FROM {FILE_PATH_CACHE_TABLE} \
                 WHERE version_id = $1 AND path = $2 LIMIT 1"
            ),
            &[
                Value::Text(version_id.to_string()),
                Value::Text(path.to_string()),
            ],
        )
        .await?;
    Ok(result
        .rows
        .first()
        .and_then(|row| row.first())
        .and_then(|value| value.as_text())
        .map(|text| text.to_string()))
}

/// Descriptor-affecting writes drop the byte cache for the touched files and
/// the whole path cache for the touched versions (renames make narrower
/// invalidation unsound).
pub(crate) async fn invalidate_file_caches(
    exec: &mut Executor<'_>,
    targets: &[(String, String)],
) -> Result<(), LixError> {
    for (file_id, version_id) in targets {
        exec.execute_internal(
            &format!(
                "DELETE FROM {FILE_DATA_CACHE_TABLE} WHERE file_id = $1 AND version_id = $2"
            ),
            &[
                Value::Text(file_id.clone()),
                Value::Text(version_id.clone()),
            ],
        )
        .await?;
    }
    let mut seen_versions = std::collections::BTreeSet::new();
    for (_, version_id) in targets {
        if seen_versions.insert(version_id.clone()) {
            exec.execute_internal(
                &format!("DELETE FROM {FILE_PATH_CACHE_TABLE} WHERE version_id = $1"),
                &[Value::Text(version_id.clone())],
            )
            .await?;
        }
    }
    Ok(())
}
