use serde_json::{json, Value as JsonValue};

use crate::binary;
use crate::builtin_schema::{
    builtin_schema_version, BINARY_BLOB_REF_SCHEMA_KEY, DIRECTORY_DESCRIPTOR_SCHEMA_KEY,
    FILE_DESCRIPTOR_SCHEMA_KEY,
};
use crate::commit::DomainChangeInput;
use crate::exec::Executor;
use crate::filesystem::data::{
    cached_file_data, find_file_by_path, invalidate_file_caches, load_file_entities,
    materialize_file_data, upsert_file_data_cache, upsert_path_cache, FileView,
};
use crate::filesystem::path::{
    ancestor_directory_paths, directory_name_from_path, normalize_directory_path, parse_file_path,
};
use crate::hash::content_hash_hex;
use crate::plugin::{PluginFileDescriptor, PluginRegistry};
use crate::schema::SchemaKey;
use crate::sql::contracts::{
    DetectedFileDomainChange, DirectoryMutation, FileFilter, FileInsertRow, FileMutation,
    VersionScope,
};
use crate::sql::escape_sql_string;
use crate::sql::planner::state_read::{
    build_effective_state_query, ScanProjection, ScanScope, StatePushdown,
};
use crate::vtable_write::{load_effective_rows, upsert_untracked_row, PendingCommit, WriteContext};
use crate::{LixError, Value};

const BINARY_FALLBACK_PLUGIN_KEY: &str = "lix_binary_fallback";

/// Resolves a directory path, creating missing ancestors in order. The
/// resolved set lives on the pending commit, shared by every statement of
/// the execute: existing directories (including ones visible through
/// inheritance and ones created earlier in the same execute) are reused,
/// never duplicated.
async fn ensure_directory(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    pending: &mut PendingCommit,
    version_id: &str,
    directory_path: &str,
) -> Result<String, LixError> {
    let normalized = normalize_directory_path(directory_path)?;
    if let Some(existing) = pending
        .resolved_directories
        .get(&(version_id.to_string(), normalized.clone()))
    {
        return Ok(existing.clone());
    }

    let mut ancestors = ancestor_directory_paths(&normalized);
    ancestors.push(normalized.clone());

    let mut parent_id: Option<String> = None;
    let mut resolved_id = String::new();
    for ancestor in ancestors {
        let key = (version_id.to_string(), ancestor.clone());
        if let Some(existing) = pending.resolved_directories.get(&key) {
            parent_id = Some(existing.clone());
            resolved_id = existing.clone();
            continue;
        }

        let name = directory_name_from_path(&ancestor)
            .ok_or_else(|| LixError::validation(format!("invalid directory path '{ancestor}'")))?;
        let existing = find_directory(exec, ctx, version_id, parent_id.as_deref(), &name).await?;
        let id = match existing {
            Some(id) => id,
            None => {
                let id = ctx.functions.uuid_v7();
                pending.domain_changes.push(DomainChangeInput {
                    id: ctx.functions.uuid_v7(),
                    entity_id: id.clone(),
                    schema_key: DIRECTORY_DESCRIPTOR_SCHEMA_KEY.to_string(),
                    schema_version: builtin_schema_version(DIRECTORY_DESCRIPTOR_SCHEMA_KEY)
                        .unwrap_or("1")
                        .to_string(),
                    file_id: crate::builtin_schema::BUILTIN_FILE_ID.to_string(),
                    plugin_key: crate::builtin_schema::BUILTIN_PLUGIN_KEY.to_string(),
                    snapshot_content: Some(json!({
                        "id": id,
                        "parent_id": parent_id,
                        "name": name,
                    })),
                    metadata: None,
                    created_at: ctx.functions.timestamp(),
                    version_id: version_id.to_string(),
                });
                id
            }
        };
        pending.resolved_directories.insert(key, id.clone());
        parent_id = Some(id.clone());
        resolved_id = id;
    }
    Ok(resolved_id)
}

pub(crate) async fn apply_file_mutation(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    plugins: &PluginRegistry,
    mutation: &FileMutation,
    pending: &mut PendingCommit,
) -> Result<u64, LixError> {
    match mutation {
        FileMutation::Insert { rows } => apply_file_insert(exec, ctx, plugins, rows, pending).await,
        FileMutation::Update {
            scope,
            filter,
            set_path,
            set_data,
            set_metadata,
            set_hidden,
        } => {
            apply_file_update(
                exec, ctx, plugins, scope, filter, set_path, set_data, set_metadata, set_hidden,
                pending,
            )
            .await
        }
        FileMutation::Delete { scope, filter } => {
            apply_file_delete(exec, ctx, scope, filter, pending).await
        }
    }
}

async fn apply_file_insert(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    plugins: &PluginRegistry,
    rows: &[FileInsertRow],
    pending: &mut PendingCommit,
) -> Result<u64, LixError> {
    let mut affected = 0u64;

    for row in rows {
        let parsed = parse_file_path(&row.path)?;
        let version_id = row
            .version_id
            .clone()
            .unwrap_or_else(|| ctx.active_version_id.clone());

        let directory_id = match &parsed.directory_path {
            Some(directory_path) => {
                Some(ensure_directory(exec, ctx, pending, &version_id, directory_path).await?)
            }
            None => None,
        };

        let collision = find_file_in_directory(
            exec,
            ctx,
            &version_id,
            directory_id.as_deref(),
            &parsed.name,
            parsed.extension.as_deref(),
        )
        .await?;
        if collision.is_some() {
            return Err(LixError::constraint(format!(
                "a file already exists at '{}'",
                parsed.normalized_path
            ))
            .with_version_id(version_id.clone()));
        }

        let file_id = row.id.clone().unwrap_or_else(|| ctx.functions.uuid_v7());
        let descriptor_snapshot = json!({
            "id": file_id,
            "directory_id": directory_id,
            "name": parsed.name,
            "extension": parsed.extension,
            "metadata": row.metadata,
            "hidden": row.hidden,
        });

        if row.untracked {
            upsert_untracked_row(
                exec,
                ctx,
                &file_id,
                FILE_DESCRIPTOR_SCHEMA_KEY,
                builtin_schema_version(FILE_DESCRIPTOR_SCHEMA_KEY).unwrap_or("1"),
                &file_id,
                &version_id,
                crate::builtin_schema::BUILTIN_PLUGIN_KEY,
                Some(&descriptor_snapshot),
            )
            .await?;
        } else {
            pending.domain_changes.push(DomainChangeInput {
                id: ctx.functions.uuid_v7(),
                entity_id: file_id.clone(),
                schema_key: FILE_DESCRIPTOR_SCHEMA_KEY.to_string(),
                schema_version: builtin_schema_version(FILE_DESCRIPTOR_SCHEMA_KEY)
                    .unwrap_or("1")
                    .to_string(),
                file_id: file_id.clone(),
                plugin_key: crate::builtin_schema::BUILTIN_PLUGIN_KEY.to_string(),
                snapshot_content: Some(descriptor_snapshot),
                metadata: None,
                created_at: ctx.functions.timestamp(),
                version_id: version_id.clone(),
            });
        }

        if let Some(data) = &row.data {
            write_file_bytes(
                exec,
                ctx,
                plugins,
                &FileView {
                    id: file_id.clone(),
                    path: parsed.normalized_path.clone(),
                    metadata: row.metadata.clone(),
                },
                &version_id,
                None,
                data,
                row.untracked,
                pending,
            )
            .await?;
        }

        upsert_path_cache(exec, &version_id, &parsed.normalized_path, &file_id).await?;
        affected += 1;
    }
    Ok(affected)
}

#[allow(clippy::too_many_arguments)]
async fn apply_file_update(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    plugins: &PluginRegistry,
    scope: &VersionScope,
    filter: &FileFilter,
    set_path: &Option<String>,
    set_data: &Option<Vec<u8>>,
    set_metadata: &Option<Option<JsonValue>>,
    set_hidden: &Option<bool>,
    pending: &mut PendingCommit,
) -> Result<u64, LixError> {
    let targets = resolve_file_targets(exec, ctx, scope, filter).await?;
    let mut affected = 0u64;

    for target in targets {
        affected += 1;
        let version_id = target.version_id.clone();
        let mut descriptor = target
            .snapshot_content
            .clone()
            .ok_or_else(|| LixError::planner_invariant("file descriptor row has no snapshot"))?;
        let old_path = compose_descriptor_path(exec, ctx, &descriptor, &version_id).await?;
        let mut descriptor_changed = false;
        let mut renamed_path: Option<String> = None;

        if let Some(new_path) = set_path {
            let parsed = parse_file_path(new_path)?;
            if parsed.normalized_path != old_path {
                let directory_id = match &parsed.directory_path {
                    Some(directory_path) => Some(
                        ensure_directory(exec, ctx, pending, &version_id, directory_path).await?,
                    ),
                    None => None,
                };
                let collision = find_file_in_directory(
                    exec,
                    ctx,
                    &version_id,
                    directory_id.as_deref(),
                    &parsed.name,
                    parsed.extension.as_deref(),
                )
                .await?;
                if collision.map(|id| id != target.entity_id).unwrap_or(false) {
                    return Err(LixError::constraint(format!(
                        "a file already exists at '{}'",
                        parsed.normalized_path
                    ))
                    .with_version_id(version_id.clone()));
                }
                descriptor["directory_id"] = json!(directory_id);
                descriptor["name"] = json!(parsed.name);
                descriptor["extension"] = json!(parsed.extension);
                descriptor_changed = true;
                renamed_path = Some(parsed.normalized_path);
            }
        }
        if let Some(metadata) = set_metadata {
            descriptor["metadata"] = metadata.clone().unwrap_or(JsonValue::Null);
            descriptor_changed = true;
        }
        if let Some(hidden) = set_hidden {
            descriptor["hidden"] = json!(hidden);
            descriptor_changed = true;
        }

        if descriptor_changed {
            pending.domain_changes.push(DomainChangeInput {
                id: ctx.functions.uuid_v7(),
                entity_id: target.entity_id.clone(),
                schema_key: FILE_DESCRIPTOR_SCHEMA_KEY.to_string(),
                schema_version: target.schema_version.clone(),
                file_id: target.entity_id.clone(),
                plugin_key: target.plugin_key.clone(),
                snapshot_content: Some(descriptor.clone()),
                metadata: None,
                created_at: ctx.functions.timestamp(),
                version_id: version_id.clone(),
            });
            // Invalidate before any byte rewrite below so a fresh cache row
            // written for the new bytes survives. The renamed path comes
            // from the parsed input: freshly created ancestor directories
            // are still pending and not yet queryable.
            invalidate_file_caches(
                exec,
                &[(target.entity_id.clone(), version_id.clone())],
            )
            .await?;
            let new_path = renamed_path.clone().unwrap_or_else(|| old_path.clone());
            upsert_path_cache(exec, &version_id, &new_path, &target.entity_id).await?;
        }

        if let Some(data) = set_data {
            let current_path = renamed_path.clone().unwrap_or_else(|| old_path.clone());
            let view = FileView {
                id: target.entity_id.clone(),
                path: current_path,
                metadata: descriptor.get("metadata").cloned().filter(|v| !v.is_null()),
            };
            let before = match cached_file_data(exec, &target.entity_id, &version_id).await? {
                Some(bytes) => Some(bytes),
                None => Some(materialize_file_data(exec, ctx, plugins, &view, &version_id).await?),
            };
            write_file_bytes(
                exec,
                ctx,
                plugins,
                &view,
                &version_id,
                before.as_deref(),
                data,
                target.untracked,
                pending,
            )
            .await?;
        }
    }

    Ok(affected)
}

async fn apply_file_delete(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    scope: &VersionScope,
    filter: &FileFilter,
    pending: &mut PendingCommit,
) -> Result<u64, LixError> {
    let targets = resolve_file_targets(exec, ctx, scope, filter).await?;
    let mut affected = 0u64;
    let mut invalidation_targets = Vec::new();

    for target in targets {
        affected += 1;
        let version_id = target.version_id.clone();

        // Tombstone the descriptor; the parent version's row (for inherited
        // files) stays untouched.
        pending.domain_changes.push(DomainChangeInput {
            id: ctx.functions.uuid_v7(),
            entity_id: target.entity_id.clone(),
            schema_key: FILE_DESCRIPTOR_SCHEMA_KEY.to_string(),
            schema_version: target.schema_version.clone(),
            file_id: target.entity_id.clone(),
            plugin_key: target.plugin_key.clone(),
            snapshot_content: None,
            metadata: None,
            created_at: ctx.functions.timestamp(),
            version_id: version_id.clone(),
        });

        for entity in load_file_entities(exec, ctx, &target.entity_id, &version_id).await? {
            pending.domain_changes.push(DomainChangeInput {
                id: ctx.functions.uuid_v7(),
                entity_id: entity.entity_id,
                schema_key: entity.schema_key,
                schema_version: entity.schema_version,
                file_id: target.entity_id.clone(),
                plugin_key: target.plugin_key.clone(),
                snapshot_content: None,
                metadata: None,
                created_at: ctx.functions.timestamp(),
                version_id: version_id.clone(),
            });
        }

        if let Some(blob_ref) =
            effective_blob_ref_row(exec, ctx, &target.entity_id, &version_id).await?
        {
            pending.domain_changes.push(DomainChangeInput {
                id: ctx.functions.uuid_v7(),
                entity_id: blob_ref.0,
                schema_key: BINARY_BLOB_REF_SCHEMA_KEY.to_string(),
                schema_version: blob_ref.1,
                file_id: target.entity_id.clone(),
                plugin_key: BINARY_FALLBACK_PLUGIN_KEY.to_string(),
                snapshot_content: None,
                metadata: None,
                created_at: ctx.functions.timestamp(),
                version_id: version_id.clone(),
            });
        }

        invalidation_targets.push((target.entity_id.clone(), version_id));
    }

    if !invalidation_targets.is_empty() {
        invalidate_file_caches(exec, &invalidation_targets).await?;
    }
    Ok(affected)
}

pub(crate) async fn apply_directory_mutation(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    mutation: &DirectoryMutation,
    pending: &mut PendingCommit,
) -> Result<u64, LixError> {
    match mutation {
        DirectoryMutation::Insert { rows } => {
            let mut affected = 0u64;
            for row in rows {
                let version_id = row
                    .version_id
                    .clone()
                    .unwrap_or_else(|| ctx.active_version_id.clone());
                ensure_directory(exec, ctx, pending, &version_id, &row.path).await?;
                affected += 1;
            }
            Ok(affected)
        }
        DirectoryMutation::Delete { scope, filter } => {
            apply_directory_delete(exec, ctx, scope, filter, pending).await
        }
    }
}

async fn apply_directory_delete(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    scope: &VersionScope,
    filter: &FileFilter,
    pending: &mut PendingCommit,
) -> Result<u64, LixError> {
    let version_ids = match scope {
        VersionScope::Active => vec![ctx.active_version_id.clone()],
        VersionScope::Versions(values) => values.clone(),
    };

    let mut affected = 0u64;
    for version_id in &version_ids {
        let mut directory_ids = Vec::new();
        if let Some(ids) = &filter.id_in {
            directory_ids.extend(ids.clone());
        }
        if let Some(paths) = &filter.path_in {
            for path in paths {
                if let Some(id) = resolve_directory_by_path(exec, ctx, version_id, path).await? {
                    directory_ids.push(id);
                }
            }
        }

        for directory_id in directory_ids {
            if directory_has_children(exec, ctx, version_id, &directory_id).await? {
                return Err(LixError::constraint(format!(
                    "directory '{directory_id}' is not empty"
                ))
                .with_version_id(version_id.clone()));
            }
            pending.domain_changes.push(DomainChangeInput {
                id: ctx.functions.uuid_v7(),
                entity_id: directory_id,
                schema_key: DIRECTORY_DESCRIPTOR_SCHEMA_KEY.to_string(),
                schema_version: builtin_schema_version(DIRECTORY_DESCRIPTOR_SCHEMA_KEY)
                    .unwrap_or("1")
                    .to_string(),
                file_id: crate::builtin_schema::BUILTIN_FILE_ID.to_string(),
                plugin_key: crate::builtin_schema::BUILTIN_PLUGIN_KEY.to_string(),
                snapshot_content: None,
                metadata: None,
                created_at: ctx.functions.timestamp(),
                version_id: version_id.clone(),
            });
            affected += 1;
        }
    }
    Ok(affected)
}

/// Routes new bytes through the matching plugin (semantic changes) or the
/// binary CAS (blob ref change, skipped entirely for identical bytes), then
/// refreshes the data cache.
#[allow(clippy::too_many_arguments)]
async fn write_file_bytes(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    plugins: &PluginRegistry,
    file: &FileView,
    version_id: &str,
    before: Option<&[u8]>,
    after: &[u8],
    untracked: bool,
    pending: &mut PendingCommit,
) -> Result<(), LixError> {
    let plugin = plugins.select_for_path(exec, &file.path).await?;
    match plugin {
        Some(plugin) => {
            let descriptor = PluginFileDescriptor {
                id: file.id.clone(),
                path: file.path.clone(),
                metadata: file.metadata.clone(),
            };
            // Normalize the plugin's output into the typed batch before it
            // enters the tracked write flow.
            let detected: Vec<DetectedFileDomainChange> = plugins
                .detect_changes(&plugin, &descriptor, before, after)
                .await?
                .into_iter()
                .map(|change| DetectedFileDomainChange {
                    entity_id: change.entity_id,
                    schema_key: change.schema_key,
                    schema_version: change.schema_version,
                    snapshot_content: change.snapshot_content,
                })
                .collect();

            for change in detected {
                // Every detected change flows through the same validation as
                // direct state writes.
                let schema = ctx
                    .schema_cache
                    .load(
                        exec,
                        &SchemaKey::new(change.schema_key.clone(), change.schema_version.clone()),
                    )
                    .await?;
                if let Some(snapshot) = &change.snapshot_content {
                    ctx.schema_cache
                        .validate_snapshot(&schema, &change.entity_id, snapshot)?;
                }
                if untracked {
                    upsert_untracked_row(
                        exec,
                        ctx,
                        &change.entity_id,
                        &change.schema_key,
                        &change.schema_version,
                        &file.id,
                        version_id,
                        &plugin.manifest.key,
                        change.snapshot_content.as_ref(),
                    )
                    .await?;
                } else {
                    pending.domain_changes.push(DomainChangeInput {
                        id: ctx.functions.uuid_v7(),
                        entity_id: change.entity_id,
                        schema_key: change.schema_key,
                        schema_version: change.schema_version,
                        file_id: file.id.clone(),
                        plugin_key: plugin.manifest.key.clone(),
                        snapshot_content: change.snapshot_content,
                        metadata: None,
                        created_at: ctx.functions.timestamp(),
                        version_id: version_id.to_string(),
                    });
                }
            }

            upsert_file_data_cache(exec, ctx, &file.id, version_id, after, &plugin.manifest.key)
                .await?;
        }
        None => {
            let new_hash = content_hash_hex(after);
            let current = binary::current_blob_hash(exec, &file.id, version_id).await?;
            if current.as_deref() != Some(new_hash.as_str()) {
                let now = ctx.functions.timestamp();
                let persisted =
                    binary::persist_blob(exec, &file.id, version_id, after, &now).await?;
                pending.domain_changes.push(DomainChangeInput {
                    id: ctx.functions.uuid_v7(),
                    entity_id: file.id.clone(),
                    schema_key: BINARY_BLOB_REF_SCHEMA_KEY.to_string(),
                    schema_version: builtin_schema_version(BINARY_BLOB_REF_SCHEMA_KEY)
                        .unwrap_or("1")
                        .to_string(),
                    file_id: file.id.clone(),
                    plugin_key: BINARY_FALLBACK_PLUGIN_KEY.to_string(),
                    snapshot_content: Some(json!({
                        "id": file.id,
                        "blob_hash": persisted.blob_hash,
                        "size_bytes": persisted.size_bytes,
                    })),
                    metadata: None,
                    created_at: now,
                    version_id: version_id.to_string(),
                });
            }

            upsert_file_data_cache(
                exec,
                ctx,
                &file.id,
                version_id,
                after,
                BINARY_FALLBACK_PLUGIN_KEY,
            )
            .await?;
        }
    }
    Ok(())
}

/// Loads the effective descriptor rows a filesystem UPDATE/DELETE touches.
/// Ids that match nothing are skipped, which makes absent-id deletes no-ops.
async fn resolve_file_targets(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    scope: &VersionScope,
    filter: &FileFilter,
) -> Result<Vec<crate::vtable_write::EffectiveRow>, LixError> {
    let mut ids: Vec<String> = filter.id_in.clone().unwrap_or_default();
    if let Some(paths) = &filter.path_in {
        let version_ids = match scope {
            VersionScope::Active => vec![ctx.active_version_id.clone()],
            VersionScope::Versions(values) => values.clone(),
        };
        for version_id in &version_ids {
            for path in paths {
                if let Some(view) = find_file_by_path(exec, ctx, path, version_id).await? {
                    ids.push(view.id);
                }
            }
        }
    }
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let id_list = ids
        .iter()
        .map(|id| format!("'{}'", escape_sql_string(id)))
        .collect::<Vec<_>>()
        .join(", ");
    let filter_sql = format!(
        "schema_key = '{FILE_DESCRIPTOR_SCHEMA_KEY}' AND entity_id IN ({id_list})"
    );
    load_effective_rows(exec, ctx, scope, Some(&filter_sql), None).await
}

async fn compose_descriptor_path(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    descriptor: &JsonValue,
    version_id: &str,
) -> Result<String, LixError> {
    let name = descriptor
        .get("name")
        .and_then(|value| value.as_str())
        .ok_or_else(|| LixError::planner_invariant("file descriptor missing name"))?;
    let extension = descriptor.get("extension").and_then(|value| value.as_str());
    let file_name = match extension {
        Some(extension) => format!("{name}.{extension}"),
        None => name.to_string(),
    };
    match descriptor.get("directory_id").and_then(|value| value.as_str()) {
        Some(directory_id) => {
            let directory_path = directory_path_for_id(exec, ctx, version_id, directory_id)
                .await?
                .ok_or_else(|| {
                    LixError::not_found(format!("directory '{directory_id}' is not visible"))
                        .with_version_id(version_id.to_string())
                })?;
            Ok(format!("{directory_path}{file_name}"))
        }
        None => Ok(format!("/{file_name}")),
    }
}

fn directory_scan_sql(ctx: &WriteContext<'_>, version_id: &str) -> Result<String, LixError> {
    let mut pushdown = StatePushdown::default();
    pushdown.schema_key_literal = Some(DIRECTORY_DESCRIPTOR_SCHEMA_KEY.to_string());
    pushdown
        .source
        .push(format!("s.schema_key = '{DIRECTORY_DESCRIPTOR_SCHEMA_KEY}'"));
    build_effective_state_query(
        &ScanScope::VersionValues(vec![format!("'{}'", escape_sql_string(version_id))]),
        &pushdown,
        ScanProjection::Full,
        &ctx.catalog,
    )
    .map_err(LixError::from)
}

async fn find_directory(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    version_id: &str,
    parent_id: Option<&str>,
    name: &str,
) -> Result<Option<String>, LixError> {
    let scan = directory_scan_sql(ctx, version_id)?;
    let name_expr =
        crate::schema_registry::json_text_extract_expr(ctx.catalog.dialect, "name");
    let parent_expr =
        crate::schema_registry::json_text_extract_expr(ctx.catalog.dialect, "parent_id");
    let sql = format!(
        "SELECT entity_id FROM ({scan}) AS t \
         WHERE {name_expr} = $1 AND COALESCE({parent_expr}, '') = $2 LIMIT 1"
    );
    let result = exec
        .execute_internal(
            &sql,
            &[
                Value::Text(name.to_string()),
                Value::Text(parent_id.unwrap_or_default().to_string()),
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

async fn resolve_directory_by_path(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    version_id: &str,
    path: &str,
) -> Result<Option<String>, LixError> {
    let normalized = normalize_directory_path(path)?;
    let mut parent_id: Option<String> = None;
    let mut ancestors = ancestor_directory_paths(&normalized);
    ancestors.push(normalized);
    for ancestor in ancestors {
        let name = directory_name_from_path(&ancestor)
            .ok_or_else(|| LixError::validation(format!("invalid directory path '{ancestor}'")))?;
        match find_directory(exec, ctx, version_id, parent_id.as_deref(), &name).await? {
            Some(id) => parent_id = Some(id),
            None => return Ok(None),
        }
    }
    Ok(parent_id)
}

async fn directory_path_for_id(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    version_id: &str,
    directory_id: &str,
) -> Result<Option<String>, LixError> {
    let scan = directory_scan_sql(ctx, version_id)?;
    let name_expr =
        crate::schema_registry::json_text_extract_expr(ctx.catalog.dialect, "name");
    let parent_expr =
        crate::schema_registry::json_text_extract_expr(ctx.catalog.dialect, "parent_id");

    let mut segments: Vec<String> = Vec::new();
    let mut current = Some(directory_id.to_string());
    // Parent chains are finite; a cycle would mean corrupted descriptors.
    let mut remaining_hops = 256;
    while let Some(id) = current {
        remaining_hops -= 1;
        if remaining_hops == 0 {
            return Err(LixError::validation(
                "directory parent chain exceeds supported depth",
            ));
        }
        let sql = format!(
            "SELECT {name_expr}, {parent_expr} FROM ({scan}) AS t \
             WHERE t.entity_id = $1 LIMIT 1"
        );
        let result = exec
            .execute_internal(&sql, &[Value::Text(id)])
            .await?;
        let Some(row) = result.rows.first() else {
            return Ok(None);
        };
        let name = row
            .first()
            .and_then(|value| value.as_text())
            .ok_or_else(|| LixError::planner_invariant("directory row missing name"))?;
        segments.push(name.to_string());
        current = row
            .get(1)
            .and_then(|value| value.as_text())
            .map(|text| text.to_string());
    }
    segments.reverse();
    Ok(Some(format!("/{}/", segments.join("/"))))
}

async fn find_file_in_directory(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    version_id: &str,
    directory_id: Option<&str>,
    name: &str,
    extension: Option<&str>,
) -> Result<Option<String>, LixError> {
    let mut pushdown = StatePushdown::default();
    pushdown.schema_key_literal = Some(FILE_DESCRIPTOR_SCHEMA_KEY.to_string());
    pushdown
        .source
        .push(format!("s.schema_key = '{FILE_DESCRIPTOR_SCHEMA_KEY}'"));
    let scan = build_effective_state_query(
        &ScanScope::VersionValues(vec![format!("'{}'", escape_sql_string(version_id))]),
        &pushdown,
        ScanProjection::Full,
        &ctx.catalog,
    )
    .map_err(LixError::from)?;

    let dialect = ctx.catalog.dialect;
    let directory_expr = crate::schema_registry::json_text_extract_expr(dialect, "directory_id");
    let name_expr = crate::schema_registry::json_text_extract_expr(dialect, "name");
    let extension_expr = crate::schema_registry::json_text_extract_expr(dialect, "extension");
    let sql = format!(
        "SELECT entity_id FROM ({scan}) AS t \
         WHERE COALESCE({directory_expr}, '') = $1 \
           AND {name_expr} = $2 \
           AND COALESCE({extension_expr}, '') = $3 \
         LIMIT 1"
    );
    let result = exec
        .execute_internal(
            &sql,
            &[
                Value::Text(directory_id.unwrap_or_default().to_string()),
                Value::Text(name.to_string()),
                Value::Text(extension.unwrap_or_default().to_string()),
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

async fn directory_has_children(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    version_id: &str,
    directory_id: &str,
) -> Result<bool, LixError> {
    let dialect = ctx.catalog.dialect;

    let file_scan = {
        let mut pushdown = StatePushdown::default();
        pushdown.schema_key_literal = Some(FILE_DESCRIPTOR_SCHEMA_KEY.to_string());
        pushdown
            .source
            .push(format!("s.schema_key = '{FILE_DESCRIPTOR_SCHEMA_KEY}'"));
        build_effective_state_query(
            &ScanScope::VersionValues(vec![format!("'{}'", escape_sql_string(version_id))]),
            &pushdown,
            ScanProjection::Full,
            &ctx.catalog,
        )
        .map_err(LixError::from)?
    };
    let directory_expr = crate::schema_registry::json_text_extract_expr(dialect, "directory_id");
    let files = exec
        .execute_internal(
            &format!(
                "SELECT 1 FROM ({file_scan}) AS t WHERE {directory_expr} = $1 LIMIT 1"
            ),
            &[Value::Text(directory_id.to_string())],
        )
        .await?;
    if !files.rows.is_empty() {
        return Ok(true);
    }

    let dir_scan = directory_scan_sql(ctx, version_id)?;
    let parent_expr = crate::schema_registry::json_text_extract_expr(dialect, "parent_id");
    let children = exec
        .execute_internal(
            &format!("SELECT 1 FROM ({dir_scan}) AS t WHERE {parent_expr} = $1 LIMIT 1"),
            &[Value::Text(directory_id.to_string())],
        )
        .await?;
    Ok(!children.rows.is_empty())
}

async fn effective_blob_ref_row(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    file_id: &str,
    version_id: &str,
) -> Result<Option<(String, String)>, LixError> {
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
        &ScanScope::VersionValues(vec![format!("'{}'", escape_sql_string(version_id))]),
        &pushdown,
        ScanProjection::Full,
        &ctx.catalog,
    )
    .map_err(LixError::from)?;
    let result = exec
        .execute(
            &format!("SELECT entity_id, schema_version FROM ({scan}) AS t LIMIT 1"),
            &[],
        )
        .await?;
    Ok(result.rows.first().map(|row| {
        (
            row.first()
                .and_then(|value| value.as_text())
                .unwrap_or_default()
                .to_string(),
            row.get(1)
                .and_then(|value| value.as_text())
                .unwrap_or("1")
                .to_string(),
        )
    }))
}
