use std::collections::BTreeSet;
use std::sync::Mutex;

use serde_json::Value as JsonValue;

use crate::binary;
use crate::builtin_schema::{
    BINARY_BLOB_REF_SCHEMA_KEY, CHANGE_SET_ELEMENT_SCHEMA_KEY, COMMIT_EDGE_SCHEMA_KEY,
    COMMIT_SCHEMA_KEY, DIRECTORY_DESCRIPTOR_SCHEMA_KEY, FILE_DESCRIPTOR_SCHEMA_KEY,
};
use crate::exec::Executor;
use crate::plugin::{PluginEntityState, PluginFileDescriptor, PluginRegistry};
use crate::schema_registry::{
    json_text_extract_expr, materialized_table_name, projected_column_name, quote_ident,
};
use crate::sql::contracts::HistoryRootScope;
use crate::sql::escape_sql_string;
use crate::storage::{
    CHANGE_TABLE, COMMIT_GRAPH_TABLE, FILE_HISTORY_CACHE_TABLE, MATERIALIZATION_ROOT_TABLE,
    SNAPSHOT_TABLE,
};
use crate::version::GLOBAL_VERSION_ID;
use crate::vtable_write::{resolve_version_tip, WriteContext};
use crate::{ErrorKind, LixError, Value};

/// In-process advisory locks keyed by root commit, so at most one timeline
/// build runs per root at a time. A second caller for a root that is already
/// building skips the build; the idempotent marker makes that safe.
#[derive(Default)]
pub(crate) struct MaintenanceLocks {
    in_flight: Mutex<BTreeSet<String>>,
}

impl MaintenanceLocks {
    pub(crate) fn try_acquire(&self, root_commit_id: &str) -> Option<MaintenanceGuard<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap();
        if !in_flight.insert(root_commit_id.to_string()) {
            return None;
        }
        Some(MaintenanceGuard {
            locks: self,
            root_commit_id: root_commit_id.to_string(),
        })
    }
}

pub(crate) struct MaintenanceGuard<'a> {
    locks: &'a MaintenanceLocks,
    root_commit_id: String,
}

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        self.locks
            .in_flight
            .lock()
            .unwrap()
            .remove(&self.root_commit_id);
    }
}

fn maintenance_error(error: LixError) -> LixError {
    if error.kind == ErrorKind::Maintenance {
        error
    } else {
        LixError::maintenance(error.to_string())
    }
}

/// Materializes the commit-ancestry timeline for a root, bounded by
/// `max_depth` (`None` = unbounded). Idempotent: a completion marker records
/// how deep each root has been walked, and re-runs that are already covered
/// insert nothing.
pub(crate) async fn ensure_timeline(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    locks: &MaintenanceLocks,
    root_scope: &HistoryRootScope,
    max_depth: Option<i64>,
) -> Result<Option<String>, LixError> {
    let root_commit_id = match root_scope {
        HistoryRootScope::Commit(commit_id) => commit_id.clone(),
        HistoryRootScope::ActiveVersionTip => {
            match resolve_version_tip(exec, ctx, &ctx.active_version_id).await? {
                Some(tip) => tip,
                None => return Ok(None),
            }
        }
    };

    let covered = timeline_coverage(exec, &root_commit_id).await?;
    let already_covered = match (covered, max_depth) {
        (Some(None), _) => true,
        (Some(Some(existing)), Some(requested)) => existing >= requested,
        (Some(Some(_)), None) => false,
        (None, _) => false,
    };
    if already_covered {
        return Ok(Some(root_commit_id));
    }

    let Some(_guard) = locks.try_acquire(&root_commit_id) else {
        return Ok(Some(root_commit_id));
    };

    build_timeline(exec, &root_commit_id, max_depth)
        .await
        .map_err(maintenance_error)?;
    Ok(Some(root_commit_id))
}

async fn timeline_coverage(
    exec: &mut Executor<'_>,
    root_commit_id: &str,
) -> Result<Option<Option<i64>>, LixError> {
    let result = exec
        .execute_internal(
            &format!(
                "SELECT max_depth FROM {MATERIALIZATION_ROOT_TABLE} \
                 WHERE root_commit_id = $1 LIMIT 1"
            ),
            &[Value::Text(root_commit_id.to_string())],
        )
        .await?;
    Ok(result.rows.first().map(|row| match row.first() {
        Some(Value::Integer(depth)) => Some(*depth),
        _ => None,
    }))
}

async fn build_timeline(
    exec: &mut Executor<'_>,
    root_commit_id: &str,
    max_depth: Option<i64>,
) -> Result<(), LixError> {
    let edge_table = quote_ident(&materialized_table_name(COMMIT_EDGE_SCHEMA_KEY));
    let child_column = quote_ident(&projected_column_name("child_id"));
    let parent_column = quote_ident(&projected_column_name("parent_id"));
    let root_literal = format!("'{}'", escape_sql_string(root_commit_id));
    let depth_bound = max_depth.unwrap_or(i64::MAX);

    // The ancestry walk and insert run as one statement; MIN(depth) keeps
    // merge commits at their shortest distance from the root.
    let sql = format!(
        "INSERT INTO {COMMIT_GRAPH_TABLE} (root_commit_id, commit_id, depth) \
         SELECT {root_literal}, commit_id, MIN(depth) FROM ( \
           WITH RECURSIVE ancestry(commit_id, depth) AS ( \
             SELECT {root_literal}, 0 \
             UNION ALL \
             SELECT e.{parent_column}, a.depth + 1 \
             FROM ancestry a \
             JOIN {edge_table} e ON e.{child_column} = a.commit_id \
             WHERE e.version_id = '{GLOBAL_VERSION_ID}' \
               AND e.is_tombstone = 0 \
               AND e.snapshot_content IS NOT NULL \
               AND a.depth < {depth_bound} \
           ) \
           SELECT commit_id, depth FROM ancestry \
         ) AS walk \
         WHERE commit_id IS NOT NULL \
         GROUP BY commit_id \
         ON CONFLICT (root_commit_id, commit_id) DO NOTHING"
    );
    exec.execute(&sql, &[]).await?;

    exec.execute_internal(
        &format!(
            "INSERT INTO {MATERIALIZATION_ROOT_TABLE} (root_commit_id, max_depth) \
             VALUES ($1, $2) \
             ON CONFLICT (root_commit_id) DO UPDATE SET max_depth = excluded.max_depth"
        ),
        &[
            Value::Text(root_commit_id.to_string()),
            match max_depth {
                Some(depth) => Value::Integer(depth),
                None => Value::Null,
            },
        ],
    )
    .await?;
    Ok(())
}

/// Commit membership join shared by the reconstruction queries.
fn membership_sql(ctx: &WriteContext<'_>) -> String {
    let cse_table = quote_ident(&materialized_table_name(CHANGE_SET_ELEMENT_SCHEMA_KEY));
    let commit_table = quote_ident(&materialized_table_name(COMMIT_SCHEMA_KEY));
    let cse_change_id = quote_ident(&projected_column_name("change_id"));
    let cse_change_set_id = quote_ident(&projected_column_name("change_set_id"));
    let commit_id = quote_ident(&projected_column_name("id"));
    let commit_change_set_expr = json_text_extract_expr(ctx.catalog.dialect, "change_set_id")
        .replace("snapshot_content", "co.snapshot_content");
    format!(
        "(SELECT cse.{cse_change_id} AS change_id, co.{commit_id} AS commit_id \
          FROM {cse_table} cse \
          JOIN {commit_table} co ON {commit_change_set_expr} = cse.{cse_change_set_id} \
          WHERE cse.version_id = '{GLOBAL_VERSION_ID}' AND cse.is_tombstone = 0 \
            AND cse.snapshot_content IS NOT NULL \
            AND co.version_id = '{GLOBAL_VERSION_ID}' AND co.is_tombstone = 0 \
            AND co.snapshot_content IS NOT NULL)"
    )
}

/// Refreshes `lix_internal_file_history_cache` for a `(file, root, depth)`
/// scope: every depth at which a file changed gets its reconstructed bytes.
pub(crate) async fn refresh_file_history(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    plugins: &PluginRegistry,
    root_commit_id: &str,
    max_depth: Option<i64>,
    file_ids: &[String],
) -> Result<(), LixError> {
    let files = if file_ids.is_empty() {
        timeline_file_ids(exec, ctx, root_commit_id).await?
    } else {
        file_ids.to_vec()
    };

    for file_id in files {
        let touched = file_touched_depths(exec, ctx, root_commit_id, &file_id, max_depth).await?;
        for (depth, commit_id, created_at) in touched {
            let already = exec
                .execute_internal(
                    &format!(
                        "SELECT 1 FROM {FILE_HISTORY_CACHE_TABLE} \
                         WHERE file_id = $1 AND root_commit_id = $2 AND depth = $3 LIMIT 1"
                    ),
                    &[
                        Value::Text(file_id.clone()),
                        Value::Text(root_commit_id.to_string()),
                        Value::Integer(depth),
                    ],
                )
                .await?;
            if !already.rows.is_empty() {
                continue;
            }

            let bytes =
                reconstruct_file_at_depth(exec, ctx, plugins, root_commit_id, &file_id, depth)
                    .await
                    .map_err(maintenance_error)?;
            let Some(bytes) = bytes else {
                continue;
            };

            exec.execute_internal(
                &format!(
                    "INSERT INTO {FILE_HISTORY_CACHE_TABLE} \
                     (file_id, root_commit_id, depth, commit_id, data, created_at, refreshed_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7) \
                     ON CONFLICT (file_id, root_commit_id, depth) DO UPDATE SET \
                       commit_id = excluded.commit_id, \
                       data = excluded.data, \
                       created_at = excluded.created_at, \
                       refreshed_at = excluded.refreshed_at"
                ),
                &[
                    Value::Text(file_id.clone()),
                    Value::Text(root_commit_id.to_string()),
                    Value::Integer(depth),
                    Value::Text(commit_id),
                    Value::Blob(bytes),
                    Value::Text(created_at),
                    Value::Text(ctx.functions.timestamp()),
                ],
            )
            .await?;
        }
    }
    Ok(())
}

async fn timeline_file_ids(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    root_commit_id: &str,
) -> Result<Vec<String>, LixError> {
    let membership = membership_sql(ctx);
    let sql = format!(
        "SELECT DISTINCT c.file_id \
         FROM {CHANGE_TABLE} c \
         JOIN {membership} m ON m.change_id = c.id \
         JOIN {COMMIT_GRAPH_TABLE} g ON g.commit_id = m.commit_id \
         WHERE g.root_commit_id = $1 \
           AND c.schema_key = '{FILE_DESCRIPTOR_SCHEMA_KEY}'"
    );
    let result = exec
        .execute_internal(&sql, &[Value::Text(root_commit_id.to_string())])
        .await?;
    Ok(result
        .rows
        .iter()
        .filter_map(|row| row.first().and_then(|value| value.as_text()))
        .map(|text| text.to_string())
        .collect())
}

async fn file_touched_depths(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    root_commit_id: &str,
    file_id: &str,
    max_depth: Option<i64>,
) -> Result<Vec<(i64, String, String)>, LixError> {
    let membership = membership_sql(ctx);
    let depth_filter = max_depth
        .map(|depth| format!(" AND g.depth <= {depth}"))
        .unwrap_or_default();
    let sql = format!(
        "SELECT g.depth, g.commit_id, MAX(c.created_at) \
         FROM {CHANGE_TABLE} c \
         JOIN {membership} m ON m.change_id = c.id \
         JOIN {COMMIT_GRAPH_TABLE} g ON g.commit_id = m.commit_id \
         WHERE g.root_commit_id = $1 AND c.file_id = $2{depth_filter} \
         GROUP BY g.depth, g.commit_id \
         ORDER BY g.depth"
    );
    let result = exec
        .execute_internal(
            &sql,
            &[
                Value::Text(root_commit_id.to_string()),
                Value::Text(file_id.to_string()),
            ],
        )
        .await?;
    Ok(result
        .rows
        .iter()
        .filter_map(|row| {
            let depth = row.first().and_then(Value::as_integer)?;
            let commit_id = row.get(1).and_then(|value| value.as_text())?.to_string();
            let created_at = row
                .get(2)
                .and_then(|value| value.as_text())
                .unwrap_or_default()
                .to_string();
            Some((depth, commit_id, created_at))
        })
        .collect())
}

/// Entity states of a file as of the commit at `depth`: per entity, the
/// change nearest to the root that is at or beyond that depth.
async fn file_states_at_depth(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    root_commit_id: &str,
    file_id: &str,
    depth: i64,
) -> Result<Vec<(String, String, String, Option<JsonValue>)>, LixError> {
    let membership = membership_sql(ctx);
    let sql = format!(
        "SELECT entity_id, schema_key, schema_version, content FROM ( \
           SELECT c.entity_id AS entity_id, c.schema_key AS schema_key, \
                  c.schema_version AS schema_version, sn.content AS content, \
                  ROW_NUMBER() OVER ( \
                    PARTITION BY c.entity_id, c.schema_key \
                    ORDER BY g.depth ASC, c.created_at DESC, c.id DESC \
                  ) AS rn \
           FROM {CHANGE_TABLE} c \
           JOIN {SNAPSHOT_TABLE} sn ON sn.id = c.snapshot_id \
           JOIN {membership} m ON m.change_id = c.id \
           JOIN {COMMIT_GRAPH_TABLE} g ON g.commit_id = m.commit_id \
           WHERE g.root_commit_id = $1 AND c.file_id = $2 AND g.depth >= $3 \
         ) AS latest WHERE rn = 1"
    );
    let result = exec
        .execute_internal(
            &sql,
            &[
                Value::Text(root_commit_id.to_string()),
                Value::Text(file_id.to_string()),
                Value::Integer(depth),
            ],
        )
        .await?;

    let mut states = Vec::with_capacity(result.rows.len());
    for row in &result.rows {
        let entity_id = row
            .first()
            .and_then(|value| value.as_text())
            .unwrap_or_default()
            .to_string();
        let schema_key = row
            .get(1)
            .and_then(|value| value.as_text())
            .unwrap_or_default()
            .to_string();
        let schema_version = row
            .get(2)
            .and_then(|value| value.as_text())
            .unwrap_or("1")
            .to_string();
        let content = match row.get(3) {
            Some(Value::Text(text)) => Some(serde_json::from_str(text).map_err(|error| {
                LixError::maintenance(format!("historical snapshot invalid JSON: {error}"))
            })?),
            _ => None,
        };
        states.push((entity_id, schema_key, schema_version, content));
    }
    Ok(states)
}

/// Bytes of a file as of the commit at `depth`, or `None` when the file did
/// not exist there (no live descriptor).
async fn reconstruct_file_at_depth(
    exec: &mut Executor<'_>,
    ctx: &WriteContext<'_>,
    plugins: &PluginRegistry,
    root_commit_id: &str,
    file_id: &str,
    depth: i64,
) -> Result<Option<Vec<u8>>, LixError> {
    let states = file_states_at_depth(exec, ctx, root_commit_id, file_id, depth).await?;

    let descriptor = states.iter().find_map(|(entity_id, schema_key, _, content)| {
        if schema_key == FILE_DESCRIPTOR_SCHEMA_KEY && entity_id == file_id {
            content.clone()
        } else {
            None
        }
    });
    let Some(descriptor) = descriptor else {
        return Ok(None);
    };

    let name = descriptor
        .get("name")
        .and_then(|value| value.as_str())
        .unwrap_or_default();
    let extension = descriptor.get("extension").and_then(|value| value.as_str());
    let historical_path = match extension {
        Some(extension) => format!("/{name}.{extension}"),
        None => format!("/{name}"),
    };

    let plugin = plugins.select_for_path(exec, &historical_path).await?;
    match plugin {
        Some(plugin) => {
            let entities: Vec<PluginEntityState> = states
                .iter()
                .filter(|(_, schema_key, _, content)| {
                    content.is_some()
                        && schema_key != FILE_DESCRIPTOR_SCHEMA_KEY
                        && schema_key != DIRECTORY_DESCRIPTOR_SCHEMA_KEY
                        && schema_key != BINARY_BLOB_REF_SCHEMA_KEY
                })
                .map(|(entity_id, schema_key, schema_version, content)| PluginEntityState {
                    entity_id: entity_id.clone(),
                    schema_key: schema_key.clone(),
                    schema_version: schema_version.clone(),
                    snapshot_content: content.clone().unwrap_or(JsonValue::Null),
                })
                .collect();
            let plugin_descriptor = PluginFileDescriptor {
                id: file_id.to_string(),
                path: historical_path,
                metadata: descriptor.get("metadata").cloned().filter(|v| !v.is_null()),
            };
            let bytes = plugins
                .apply_changes(&plugin, &plugin_descriptor, &entities)
                .await?;
            Ok(Some(bytes))
        }
        None => {
            let blob_hash = states.iter().find_map(|(_, schema_key, _, content)| {
                if schema_key == BINARY_BLOB_REF_SCHEMA_KEY {
                    content
                        .as_ref()
                        .and_then(|snapshot| snapshot.get("blob_hash"))
                        .and_then(|value| value.as_str())
                        .map(|text| text.to_string())
                } else {
                    None
                }
            });
            match blob_hash {
                Some(blob_hash) => Ok(Some(binary::read_blob(exec, &blob_hash).await?)),
                None => Ok(None),
            }
        }
    }
}
