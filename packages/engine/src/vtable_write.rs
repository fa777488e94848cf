use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::builtin_schema::{
    builtin_schema_version, ACTIVE_VERSION_SCHEMA_KEY, BUILTIN_FILE_ID, BUILTIN_PLUGIN_KEY,
    STORED_SCHEMA_KEY, VERSION_DESCRIPTOR_SCHEMA_KEY, VERSION_TIP_SCHEMA_KEY,
};
use crate::cel::CelEvaluator;
use crate::commit::{
    generate_commit, DomainChangeInput, GenerateCommitArgs, GenerateCommitResult, VersionContext,
};
use crate::deterministic::RuntimeFunctionProvider;
use crate::exec::Executor;
use crate::functions::SharedFunctionProvider;
use crate::hash::{canonical_json, snapshot_content_hash};
use crate::schema::{
    apply_default_values, parse_stored_schema_snapshot, SchemaCache, SchemaKey, StoredSchema,
};
use crate::schema_registry::{
    json_text_extract_expr, materialized_table_name, quote_ident, UNTRACKED_TABLE,
};
use crate::sql::contracts::{
    MutationOperation, StateInsertRow, StateMutation, VersionInsertRow, VersionScope,
};
use crate::sql::escape_sql_string;
use crate::sql::planner::state_read::{
    build_effective_state_query, ScanProjection, ScanScope, StatePushdown,
};
use crate::sql::planner::CatalogSnapshot;
use crate::storage::{CHANGE_TABLE, NO_CONTENT_SNAPSHOT_ID, SNAPSHOT_TABLE};
use crate::version::{
    active_version_snapshot, version_descriptor_snapshot, version_tip_snapshot,
    ACTIVE_VERSION_ENTITY_ID, ACTIVE_VERSION_STORAGE_VERSION_ID, GLOBAL_VERSION_ID,
};
use crate::{LixError, Value};

/// Shared context for one execute's write flow.
pub(crate) struct WriteContext<'a> {
    pub(crate) schema_cache: &'a SchemaCache,
    pub(crate) cel: &'a CelEvaluator,
    pub(crate) functions: SharedFunctionProvider<RuntimeFunctionProvider>,
    pub(crate) catalog: CatalogSnapshot,
    pub(crate) active_version_id: String,
    pub(crate) active_account_id: Option<String>,
}

/// Domain changes and schema registrations accumulated by the statements of
/// one execute; turned into a commit at the boundary. Directory ids resolved
/// by the filesystem planner are shared here, keyed by
/// `(version_id, directory_path)`, so no lookup runs twice and pending
/// creations are visible to later statements of the same execute.
#[derive(Default)]
pub(crate) struct PendingCommit {
    pub(crate) domain_changes: Vec<DomainChangeInput>,
    pub(crate) registered_schemas: Vec<StoredSchema>,
    pub(crate) resolved_directories: BTreeMap<(String, String), String>,
}

/// One row of the effective-state projection, as read back for expansion.
#[derive(Debug, Clone)]
pub(crate) struct EffectiveRow {
    pub(crate) entity_id: String,
    pub(crate) schema_key: String,
    pub(crate) schema_version: String,
    pub(crate) file_id: String,
    pub(crate) version_id: String,
    pub(crate) plugin_key: String,
    pub(crate) snapshot_content: Option<JsonValue>,
    pub(crate) metadata: Option<JsonValue>,
    pub(crate) untracked: bool,
    pub(crate) inherited_from_version_id: Option<String>,
}

pub(crate) async fn apply_state_mutation(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    mutation: &StateMutation,
    pending: &mut PendingCommit,
) -> Result<u64, LixError> {
    match mutation.operation {
        MutationOperation::Insert => apply_state_insert(exec, ctx, mutation, pending).await,
        MutationOperation::Update => apply_state_update(exec, ctx, mutation, pending).await,
        MutationOperation::Delete => apply_state_delete(exec, ctx, mutation, pending).await,
    }
}

async fn apply_state_insert(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    mutation: &StateMutation,
    pending: &mut PendingCommit,
) -> Result<u64, LixError> {
    let mut affected = 0u64;
    for row in &mutation.rows {
        let resolved = resolve_insert_row(exec, ctx, row, &mutation.scope).await?;
        if resolved.untracked {
            upsert_untracked_row(
                exec,
                ctx,
                &resolved.entity_id,
                &resolved.schema_key,
                &resolved.schema_version,
                &resolved.file_id,
                &resolved.version_id,
                &resolved.plugin_key,
                resolved.snapshot_content.as_ref(),
            )
            .await?;
        } else {
            pending.domain_changes.push(DomainChangeInput {
                id: ctx.functions.uuid_v7(),
                entity_id: resolved.entity_id,
                schema_key: resolved.schema_key,
                schema_version: resolved.schema_version,
                file_id: resolved.file_id,
                plugin_key: resolved.plugin_key,
                snapshot_content: resolved.snapshot_content,
                metadata: resolved.metadata,
                created_at: ctx.functions.timestamp(),
                version_id: resolved.version_id,
            });
            if let Some(schema) = resolved.registered_schema {
                pending.registered_schemas.push(schema);
            }
        }
        affected += 1;
    }
    Ok(affected)
}

struct ResolvedInsert {
    entity_id: String,
    schema_key: String,
    schema_version: String,
    file_id: String,
    version_id: String,
    plugin_key: String,
    snapshot_content: Option<JsonValue>,
    metadata: Option<JsonValue>,
    untracked: bool,
    registered_schema: Option<StoredSchema>,
}

async fn resolve_insert_row(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    row: &StateInsertRow,
    scope: &VersionScope,
) -> Result<ResolvedInsert, LixError> {
    let version_id = row
        .version_id
        .clone()
        .or_else(|| match scope {
            VersionScope::Versions(values) => values.first().cloned(),
            VersionScope::Active => None,
        })
        .unwrap_or_else(|| ctx.active_version_id.clone());

    // Stored schema rows register a new materialized table as a side effect.
    if row.schema_key == STORED_SCHEMA_KEY {
        let snapshot = row.snapshot_content.clone().ok_or_else(|| {
            LixError::validation("stored schema writes require snapshot_content")
                .with_schema_key(STORED_SCHEMA_KEY)
        })?;
        let schema = parse_stored_schema_snapshot(&snapshot)?;
        let entity_id = format!("{}~{}", schema.key, schema.version);
        if let Some(explicit) = &row.entity_id {
            if explicit != &entity_id {
                return Err(LixError::validation(format!(
                    "stored schema entity_id must be '{entity_id}'"
                ))
                .with_entity(explicit.clone()));
            }
        }
        return Ok(ResolvedInsert {
            entity_id,
            schema_key: STORED_SCHEMA_KEY.to_string(),
            schema_version: builtin_schema_version(STORED_SCHEMA_KEY)
                .unwrap_or("1")
                .to_string(),
            file_id: BUILTIN_FILE_ID.to_string(),
            version_id: GLOBAL_VERSION_ID.to_string(),
            plugin_key: BUILTIN_PLUGIN_KEY.to_string(),
            snapshot_content: Some(snapshot),
            metadata: row.metadata.clone(),
            untracked: row.untracked,
            registered_schema: Some(schema),
        });
    }

    let schema = match &row.schema_version {
        Some(version) => {
            ctx.schema_cache
                .load(exec, &SchemaKey::new(row.schema_key.clone(), version.clone()))
                .await?
        }
        None => ctx.schema_cache.load_latest(exec, &row.schema_key).await?,
    };

    let snapshot_content = match &row.snapshot_content {
        Some(snapshot) => Some(apply_default_values(
            ctx.cel,
            &ctx.functions,
            &schema,
            snapshot,
        )?),
        None => None,
    };

    let entity_id = match (&row.entity_id, &snapshot_content) {
        (Some(entity_id), _) => entity_id.clone(),
        (None, Some(snapshot)) if !schema.primary_key.is_empty() => {
            crate::schema::primary_key_entity_id(&schema, snapshot)?
        }
        _ => {
            return Err(LixError::validation(
                "state inserts require an entity_id or a primary-key projection",
            )
            .with_schema_key(schema.key.clone()));
        }
    };

    if let Some(snapshot) = &snapshot_content {
        ctx.schema_cache
            .validate_snapshot(&schema, &entity_id, snapshot)?;
        enforce_foreign_keys(exec, ctx, &schema, snapshot, &version_id).await?;
    }

    Ok(ResolvedInsert {
        entity_id,
        schema_key: schema.key.clone(),
        schema_version: schema.version.clone(),
        file_id: row.file_id.clone().unwrap_or_else(|| BUILTIN_FILE_ID.to_string()),
        version_id,
        plugin_key: row
            .plugin_key
            .clone()
            .unwrap_or_else(|| BUILTIN_PLUGIN_KEY.to_string()),
        snapshot_content,
        metadata: row.metadata.clone(),
        untracked: row.untracked,
        registered_schema: None,
    })
}

async fn apply_state_update(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    mutation: &StateMutation,
    pending: &mut PendingCommit,
) -> Result<u64, LixError> {
    let rows = load_effective_rows(
        exec,
        ctx,
        &mutation.scope,
        mutation.filter.as_deref(),
        mutation.untracked_filter,
    )
    .await?;

    let mut affected = 0u64;
    for row in rows {
        affected += 1;

        let mut new_snapshot = row.snapshot_content.clone();
        let mut new_metadata = row.metadata.clone();
        let mut new_plugin_key = row.plugin_key.clone();
        for (column, value) in &mutation.assignments {
            match column.as_str() {
                "snapshot_content" => {
                    new_snapshot = if value.is_null() { None } else { Some(value.clone()) };
                }
                "metadata" => {
                    new_metadata = if value.is_null() { None } else { Some(value.clone()) };
                }
                "plugin_key" => {
                    new_plugin_key = value
                        .as_str()
                        .map(|text| text.to_string())
                        .unwrap_or(new_plugin_key);
                }
                "untracked" => {
                    return Err(LixError::validation(
                        "rows cannot move between tracked and untracked via UPDATE",
                    ));
                }
                other => {
                    return Err(LixError::validation(format!(
                        "column '{other}' cannot be assigned on state surfaces"
                    )));
                }
            }
        }

        if row.untracked {
            // Physical untracked writes target the stored row, which for an
            // inherited hit lives under the parent version.
            let stored_version = row
                .inherited_from_version_id
                .clone()
                .unwrap_or_else(|| row.version_id.clone());
            upsert_untracked_row(
                exec,
                ctx,
                &row.entity_id,
                &row.schema_key,
                &row.schema_version,
                &row.file_id,
                &stored_version,
                &new_plugin_key,
                new_snapshot.as_ref(),
            )
            .await?;
            continue;
        }

        // An update that changes nothing appends no change.
        let unchanged = match (&row.snapshot_content, &new_snapshot) {
            (Some(old), Some(new)) => canonical_json(old) == canonical_json(new),
            (None, None) => true,
            _ => false,
        } && new_metadata == row.metadata
            && new_plugin_key == row.plugin_key;
        if unchanged {
            continue;
        }

        let schema = ctx
            .schema_cache
            .load(
                exec,
                &SchemaKey::new(row.schema_key.clone(), row.schema_version.clone()),
            )
            .await?;
        if schema.immutable {
            return Err(LixError::validation(format!(
                "schema '{}' is immutable and cannot be updated",
                schema.key
            ))
            .with_schema_key(schema.key.clone()));
        }
        if let Some(snapshot) = &new_snapshot {
            ctx.schema_cache
                .validate_snapshot(&schema, &row.entity_id, snapshot)?;
            enforce_foreign_keys(exec, ctx, &schema, snapshot, &row.version_id).await?;
        }
        if row.schema_key == STORED_SCHEMA_KEY {
            if let Some(snapshot) = &new_snapshot {
                let schema = parse_stored_schema_snapshot(snapshot)?;
                pending.registered_schemas.push(schema);
            }
        }

        pending.domain_changes.push(DomainChangeInput {
            id: ctx.functions.uuid_v7(),
            entity_id: row.entity_id,
            schema_key: row.schema_key,
            schema_version: row.schema_version,
            file_id: row.file_id,
            plugin_key: new_plugin_key,
            snapshot_content: new_snapshot,
            metadata: new_metadata,
            created_at: ctx.functions.timestamp(),
            version_id: row.version_id,
        });
    }
    Ok(affected)
}

async fn apply_state_delete(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    mutation: &StateMutation,
    pending: &mut PendingCommit,
) -> Result<u64, LixError> {
    let rows = load_effective_rows(
        exec,
        ctx,
        &mutation.scope,
        mutation.filter.as_deref(),
        mutation.untracked_filter,
    )
    .await?;

    let mut affected = 0u64;
    for row in rows {
        affected += 1;
        if row.untracked {
            delete_untracked_row(exec, &row).await?;
            continue;
        }

        let schema_key = SchemaKey::new(row.schema_key.clone(), row.schema_version.clone());
        let schema = ctx.schema_cache.load(exec, &schema_key).await?;
        if schema.immutable {
            return Err(LixError::validation(format!(
                "schema '{}' is immutable and cannot be deleted",
                schema.key
            ))
            .with_schema_key(schema.key.clone()));
        }

        // Deleting an inherited row writes the tombstone into the child
        // version, leaving the parent untouched.
        pending.domain_changes.push(DomainChangeInput {
            id: ctx.functions.uuid_v7(),
            entity_id: row.entity_id,
            schema_key: row.schema_key,
            schema_version: row.schema_version,
            file_id: row.file_id,
            plugin_key: row.plugin_key,
            snapshot_content: None,
            metadata: None,
            created_at: ctx.functions.timestamp(),
            version_id: row.version_id,
        });
    }
    Ok(affected)
}

pub(crate) async fn apply_version_insert(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    rows: &[VersionInsertRow],
    pending: &mut PendingCommit,
) -> Result<u64, LixError> {
    let mut affected = 0u64;
    for row in rows {
        let id = row.id.clone().unwrap_or_else(|| ctx.functions.uuid_v7());
        let name = row.name.clone().unwrap_or_else(|| id.clone());
        let inherits = match (&row.inherits_from_version_id, id.as_str()) {
            (Some(parent), _) => Some(parent.clone()),
            (None, GLOBAL_VERSION_ID) => None,
            (None, _) => Some(GLOBAL_VERSION_ID.to_string()),
        };

        let now = ctx.functions.timestamp();
        pending.domain_changes.push(DomainChangeInput {
            id: ctx.functions.uuid_v7(),
            entity_id: id.clone(),
            schema_key: VERSION_DESCRIPTOR_SCHEMA_KEY.to_string(),
            schema_version: builtin_schema_version(VERSION_DESCRIPTOR_SCHEMA_KEY)
                .unwrap_or("1")
                .to_string(),
            file_id: BUILTIN_FILE_ID.to_string(),
            plugin_key: BUILTIN_PLUGIN_KEY.to_string(),
            snapshot_content: Some(version_descriptor_snapshot(
                &id,
                &name,
                inherits.as_deref(),
            )),
            metadata: None,
            created_at: now.clone(),
            version_id: GLOBAL_VERSION_ID.to_string(),
        });

        // New versions start at their parent's tip.
        if let Some(parent) = &inherits {
            if let Some(parent_tip) = resolve_version_tip(exec, ctx, parent).await? {
                pending.domain_changes.push(DomainChangeInput {
                    id: ctx.functions.uuid_v7(),
                    entity_id: id.clone(),
                    schema_key: VERSION_TIP_SCHEMA_KEY.to_string(),
                    schema_version: builtin_schema_version(VERSION_TIP_SCHEMA_KEY)
                        .unwrap_or("1")
                        .to_string(),
                    file_id: BUILTIN_FILE_ID.to_string(),
                    plugin_key: BUILTIN_PLUGIN_KEY.to_string(),
                    snapshot_content: Some(version_tip_snapshot(&id, &parent_tip)),
                    metadata: None,
                    created_at: now,
                    version_id: GLOBAL_VERSION_ID.to_string(),
                });
            }
        }
        affected += 1;
    }
    Ok(affected)
}

pub(crate) async fn apply_active_version_update(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    version_id: &str,
) -> Result<u64, LixError> {
    let exists = version_descriptor_exists(exec, ctx, version_id).await?;
    if !exists {
        return Err(LixError::not_found(format!(
            "version '{version_id}' does not exist"
        ))
        .with_version_id(version_id.to_string()));
    }

    upsert_untracked_row(
        exec,
        ctx,
        ACTIVE_VERSION_ENTITY_ID,
        ACTIVE_VERSION_SCHEMA_KEY,
        builtin_schema_version(ACTIVE_VERSION_SCHEMA_KEY).unwrap_or("1"),
        BUILTIN_FILE_ID,
        ACTIVE_VERSION_STORAGE_VERSION_ID,
        BUILTIN_PLUGIN_KEY,
        Some(&active_version_snapshot(version_id)),
    )
    .await?;
    Ok(1)
}

/// Turns the accumulated domain changes into a commit: snapshot rows, change
/// rows, meta changes, and materialized upserts, all inside the open
/// transaction. Returns the new tip per committed version.
pub(crate) async fn commit_pending(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    pending: PendingCommit,
) -> Result<BTreeMap<String, String>, LixError> {
    if pending.domain_changes.is_empty() {
        return Ok(BTreeMap::new());
    }

    let mut versions = BTreeMap::new();
    for change in &pending.domain_changes {
        if versions.contains_key(&change.version_id) {
            continue;
        }
        let parents = resolve_version_tip(exec, ctx, &change.version_id)
            .await?
            .map(|tip| vec![tip])
            .unwrap_or_default();
        versions.insert(
            change.version_id.clone(),
            VersionContext {
                parent_commit_ids: parents,
            },
        );
    }

    let args = GenerateCommitArgs {
        timestamp: ctx.functions.timestamp(),
        active_accounts: ctx.active_account_id.iter().cloned().collect(),
        changes: pending.domain_changes,
        versions,
    };
    let functions = ctx.functions.clone();
    let result = generate_commit(args, move || functions.uuid_v7())?;
    apply_commit_result(exec, &result).await?;
    Ok(result.commit_ids)
}

async fn apply_commit_result(
    exec: &mut Executor<'_>,
    result: &GenerateCommitResult,
) -> Result<(), LixError> {
    // Snapshots are content addressed: writing the same payload twice lands
    // on the existing row.
    for change in &result.changes {
        let (snapshot_id, content) = match &change.snapshot_content {
            Some(content) => (snapshot_content_hash(content), Some(canonical_json(content))),
            None => (NO_CONTENT_SNAPSHOT_ID.to_string(), None),
        };
        if let Some(content) = content {
            exec.execute_internal(
                &format!(
                    "INSERT INTO {SNAPSHOT_TABLE} (id, content) VALUES ($1, $2) \
                     ON CONFLICT (id) DO NOTHING"
                ),
                &[Value::Text(snapshot_id.clone()), Value::Text(content)],
            )
            .await?;
        }

        exec.execute_internal(
            &format!(
                "INSERT INTO {CHANGE_TABLE} \
                 (id, entity_id, schema_key, schema_version, file_id, plugin_key, snapshot_id, \
                  metadata, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
            ),
            &[
                Value::Text(change.id.clone()),
                Value::Text(change.entity_id.clone()),
                Value::Text(change.schema_key.clone()),
                Value::Text(change.schema_version.clone()),
                Value::Text(change.file_id.clone()),
                Value::Text(change.plugin_key.clone()),
                Value::Text(snapshot_id),
                change
                    .metadata
                    .as_ref()
                    .map(|metadata| Value::Text(metadata.to_string()))
                    .unwrap_or(Value::Null),
                Value::Text(change.created_at.clone()),
            ],
        )
        .await?;
    }

    for row in &result.materialized {
        let table = quote_ident(&materialized_table_name(&row.change.schema_key));
        exec.execute_internal(
            &format!(
                "INSERT INTO {table} \
                 (entity_id, schema_key, schema_version, file_id, version_id, plugin_key, \
                  snapshot_content, change_id, commit_id, metadata, is_tombstone, created_at, \
                  updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
                 ON CONFLICT (entity_id, file_id, version_id) DO UPDATE SET \
                   schema_version = excluded.schema_version, \
                   plugin_key = excluded.plugin_key, \
                   snapshot_content = excluded.snapshot_content, \
                   change_id = excluded.change_id, \
                   commit_id = excluded.commit_id, \
                   metadata = excluded.metadata, \
                   is_tombstone = excluded.is_tombstone, \
                   updated_at = excluded.updated_at"
            ),
            &[
                Value::Text(row.change.entity_id.clone()),
                Value::Text(row.change.schema_key.clone()),
                Value::Text(row.change.schema_version.clone()),
                Value::Text(row.change.file_id.clone()),
                Value::Text(row.version_id.clone()),
                Value::Text(row.change.plugin_key.clone()),
                row.change
                    .snapshot_content
                    .as_ref()
                    .map(|content| Value::Text(content.to_string()))
                    .unwrap_or(Value::Null),
                Value::Text(row.change.id.clone()),
                Value::Text(row.commit_id.clone()),
                row.change
                    .metadata
                    .as_ref()
                    .map(|metadata| Value::Text(metadata.to_string()))
                    .unwrap_or(Value::Null),
                Value::Integer(row.is_tombstone as i64),
                Value::Text(row.change.created_at.clone()),
                Value::Text(row.change.created_at.clone()),
            ],
        )
        .await?;
    }

    Ok(())
}

/// Reads the effective rows a state UPDATE/DELETE touches, using the same
/// canonical scan the read path uses.
pub(crate) async fn load_effective_rows(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    scope: &VersionScope,
    filter: Option<&str>,
    untracked_filter: Option<bool>,
) -> Result<Vec<EffectiveRow>, LixError> {
    let scan_scope = scan_scope_for(scope);
    let scan = build_effective_state_query(
        &scan_scope,
        &StatePushdown::default(),
        ScanProjection::Full,
        &ctx.catalog,
    )
    .map_err(LixError::from)?;

    let mut predicates = Vec::new();
    if let Some(filter) = filter {
        predicates.push(format!("({filter})"));
    }
    if let Some(untracked) = untracked_filter {
        predicates.push(format!("untracked = {}", untracked as i64));
    }
    let where_clause = if predicates.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", predicates.join(" AND "))
    };

    let sql = format!(
        "SELECT entity_id, schema_key, schema_version, file_id, version_id, plugin_key, \
         snapshot_content, metadata, untracked, inherited_from_version_id \
         FROM ({scan}) AS t{where_clause}"
    );
    let result = exec.execute(&sql, &[]).await?;

    let mut rows = Vec::with_capacity(result.rows.len());
    for row in &result.rows {
        rows.push(EffectiveRow {
            entity_id: text_at(row, 0, "entity_id")?,
            schema_key: text_at(row, 1, "schema_key")?,
            schema_version: text_at(row, 2, "schema_version")?,
            file_id: text_at(row, 3, "file_id")?,
            version_id: text_at(row, 4, "version_id")?,
            plugin_key: text_at(row, 5, "plugin_key")?,
            snapshot_content: json_at(row, 6)?,
            metadata: json_at(row, 7)?,
            untracked: row
                .get(8)
                .and_then(Value::as_integer)
                .unwrap_or(0)
                != 0,
            inherited_from_version_id: row
                .get(9)
                .and_then(|value| value.as_text())
                .map(|text| text.to_string()),
        });
    }
    Ok(rows)
}

pub(crate) fn scan_scope_for(scope: &VersionScope) -> ScanScope {
    match scope {
        VersionScope::Active => ScanScope::Active,
        VersionScope::Versions(values) => ScanScope::VersionValues(
            values
                .iter()
                .map(|value| format!("'{}'", escape_sql_string(value)))
                .collect(),
        ),
    }
}

pub(crate) async fn resolve_version_tip(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    version_id: &str,
) -> Result<Option<String>, LixError> {
    let table = quote_ident(&materialized_table_name(VERSION_TIP_SCHEMA_KEY));
    let commit_id_expr = json_text_extract_expr(ctx.catalog.dialect, "commit_id");
    let sql = format!(
        "SELECT {commit_id_expr} FROM {table} \
         WHERE entity_id = $1 AND version_id = '{GLOBAL_VERSION_ID}' \
           AND is_tombstone = 0 AND snapshot_content IS NOT NULL \
         LIMIT 1"
    );
    let result = exec
        .execute_internal(&sql, &[Value::Text(version_id.to_string())])
        .await?;
    Ok(result
        .rows
        .first()
        .and_then(|row| row.first())
        .and_then(|value| value.as_text())
        .map(|text| text.to_string()))
}

async fn version_descriptor_exists(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    version_id: &str,
) -> Result<bool, LixError> {
    let table = quote_ident(&materialized_table_name(VERSION_DESCRIPTOR_SCHEMA_KEY));
    let sql = format!(
        "SELECT 1 FROM {table} \
         WHERE entity_id = $1 AND version_id = '{GLOBAL_VERSION_ID}' \
           AND is_tombstone = 0 AND snapshot_content IS NOT NULL \
         LIMIT 1"
    );
    let result = exec
        .execute_internal(&sql, &[Value::Text(version_id.to_string())])
        .await?;
    Ok(!result.rows.is_empty())
}

/// Materialized-mode foreign keys: the referenced entity must be visible in
/// the writing version or in the global version. Inherited-only visibility is
/// intentionally not consulted here; the write planner resolves inherited
/// references before they reach this check.
async fn enforce_foreign_keys(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    schema: &StoredSchema,
    snapshot: &JsonValue,
    version_id: &str,
) -> Result<(), LixError> {
    for foreign_key in &schema.foreign_keys {
        let mut values = Vec::with_capacity(foreign_key.properties.len());
        let mut any_null = false;
        for property in &foreign_key.properties {
            match snapshot.get(property) {
                Some(JsonValue::Null) | None => {
                    any_null = true;
                    break;
                }
                Some(value) => values.push(match value {
                    JsonValue::String(text) => text.clone(),
                    other => other.to_string(),
                }),
            }
        }
        if any_null {
            continue;
        }

        let table = quote_ident(&materialized_table_name(&foreign_key.referenced_schema_key));
        let mut predicates = Vec::new();
        let mut params = vec![
            Value::Text(version_id.to_string()),
        ];
        for (index, property) in foreign_key.referenced_properties.iter().enumerate() {
            let expr = json_text_extract_expr(ctx.catalog.dialect, property);
            predicates.push(format!("{expr} = ${}", index + 2));
            params.push(Value::Text(values[index].clone()));
        }
        let sql = format!(
            "SELECT 1 FROM {table} \
             WHERE version_id IN ($1, '{GLOBAL_VERSION_ID}') \
               AND is_tombstone = 0 AND snapshot_content IS NOT NULL \
               AND {} LIMIT 1",
            predicates.join(" AND ")
        );
        let result = exec.execute_internal(&sql, &params).await?;
        if result.rows.is_empty() {
            return Err(LixError::constraint(format!(
                "foreign key violation: schema '{}' references missing {}({})",
                schema.key,
                foreign_key.referenced_schema_key,
                foreign_key.referenced_properties.join(", ")
            ))
            .with_schema_key(schema.key.clone())
            .with_version_id(version_id.to_string()));
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn upsert_untracked_row(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    entity_id: &str,
    schema_key: &str,
    schema_version: &str,
    file_id: &str,
    version_id: &str,
    plugin_key: &str,
    snapshot_content: Option<&JsonValue>,
) -> Result<(), LixError> {
    let now = ctx.functions.timestamp();
    exec.execute_internal(
        &format!(
            "INSERT INTO {UNTRACKED_TABLE} \
             (entity_id, schema_key, file_id, version_id, plugin_key, schema_version, \
              snapshot_content, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (entity_id, schema_key, file_id, version_id) DO UPDATE SET \
               plugin_key = excluded.plugin_key, \
               schema_version = excluded.schema_version, \
               snapshot_content = excluded.snapshot_content, \
               updated_at = excluded.updated_at"
        ),
        &[
            Value::Text(entity_id.to_string()),
            Value::Text(schema_key.to_string()),
            Value::Text(file_id.to_string()),
            Value::Text(version_id.to_string()),
            Value::Text(plugin_key.to_string()),
            Value::Text(schema_version.to_string()),
            snapshot_content
                .map(|content| Value::Text(content.to_string()))
                .unwrap_or(Value::Null),
            Value::Text(now.clone()),
            Value::Text(now),
        ],
    )
    .await?;
    Ok(())
}

async fn delete_untracked_row(
    exec: &mut Executor<'_>,
    row: &EffectiveRow,
) -> Result<(), LixError> {
    let stored_version = row
        .inherited_from_version_id
        .clone()
        .unwrap_or_else(|| row.version_id.clone());
    exec.execute_internal(
        &format!(
            "DELETE FROM {UNTRACKED_TABLE} \
             WHERE entity_id = $1 AND schema_key = $2 AND file_id = $3 AND version_id = $4"
        ),
        &[
            Value::Text(row.entity_id.clone()),
            Value::Text(row.schema_key.clone()),
            Value::Text(row.file_id.clone()),
            Value::Text(stored_version),
        ],
    )
    .await?;
    Ok(())
}

fn text_at(row: &[Value], index: usize, column: &str) -> Result<String, LixError> {
    row.get(index)
        .and_then(|value| value.as_text())
        .map(|text| text.to_string())
        .ok_or_else(|| {
            LixError::planner_invariant(format!(
                "effective-state expansion row missing text column '{column}'"
            ))
        })
}

fn json_at(row: &[Value], index: usize) -> Result<Option<JsonValue>, LixError> {
    match row.get(index) {
        Some(Value::Text(text)) => serde_json::from_str(text).map(Some).map_err(|error| {
            LixError::validation(format!("stored snapshot_content is invalid JSON: {error}"))
        }),
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(LixError::planner_invariant(format!(
            "unexpected snapshot_content cell: {other:?}"
        ))),
    }
}
