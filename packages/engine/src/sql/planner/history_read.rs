use sqlparser::ast::{BinaryOperator, Expr, Query, Select, SetExpr, TableFactor};

use crate::builtin_schema::{
    ACTIVE_VERSION_SCHEMA_KEY, CHANGE_SET_ELEMENT_SCHEMA_KEY, COMMIT_SCHEMA_KEY,
    VERSION_TIP_SCHEMA_KEY,
};
use crate::schema_registry::{
    json_text_extract_expr, materialized_table_name, projected_column_name, quote_ident,
    UNTRACKED_TABLE,
};
use crate::sql::ast_utils::{
    default_alias, extract_column, extract_equality, join_conjunction, literal_text,
    object_name_matches, parse_single_query, placeholder_token, split_conjunction,
};
use crate::sql::contracts::{HistoryRequirements, HistoryRootScope, PlannerError};
use crate::sql::escape_sql_string;
use crate::sql::params::{resolve_placeholder_index, PlaceholderState};
use crate::storage::{CHANGE_TABLE, COMMIT_GRAPH_TABLE, FILE_HISTORY_CACHE_TABLE, SNAPSHOT_TABLE};
use crate::version::{
    ACTIVE_VERSION_ENTITY_ID, ACTIVE_VERSION_STORAGE_VERSION_ID, GLOBAL_VERSION_ID,
};
use crate::{SqlDialect, Value};

use super::CatalogSnapshot;

pub(crate) const STATE_HISTORY_VIEW: &str = "lix_state_history";
pub(crate) const ENTITY_HISTORY_VIEW: &str = "entity_history";
pub(crate) const FILE_HISTORY_VIEW: &str = "lix_file_history";

pub(crate) struct HistoryRewrite {
    pub(crate) query: Query,
    pub(crate) requirements: HistoryRequirements,
}

/// Rewrites history surfaces (`lix_state_history`, `entity_history`,
/// `lix_file_history`) into scans over the change log joined with the
/// materialized commit-ancestry timeline, and reports the timeline scope the
/// runner must materialize first. History scope comes exclusively from the
/// WHERE clause; placeholders inside it are resolved here, against the host
/// parameters, and never rebound.
pub(crate) fn rewrite_history_query(
    query: &Query,
    params: &[Value],
    catalog: &CatalogSnapshot,
) -> Result<Option<HistoryRewrite>, PlannerError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Ok(None);
    };
    let surface = history_surface(select);
    let Some(surface) = surface else {
        return Ok(None);
    };

    let mut new_query = query.clone();
    let SetExpr::Select(select) = new_query.body.as_mut() else {
        return Ok(None);
    };
    let select = select.as_mut();

    let relation_name = history_relation_alias(select, surface);
    let allow_unqualified = select.from.len() == 1 && select.from[0].joins.is_empty();
    let mut scope = HistoryScope::default();
    take_history_scope(
        &mut select.selection,
        &relation_name,
        allow_unqualified,
        params,
        surface,
        &mut scope,
    )?;

    let sql = match surface {
        HistorySurface::State | HistorySurface::Entity => {
            build_state_history_query(&scope, catalog.dialect)
        }
        HistorySurface::File => build_file_history_query(&scope, catalog.dialect),
    };
    let derived = parse_single_query(&sql)?;

    replace_history_relation(select, surface, derived)?;

    let requirements = HistoryRequirements {
        root_scope: Some(
            scope
                .root_commit
                .clone()
                .map(HistoryRootScope::Commit)
                .unwrap_or(HistoryRootScope::ActiveVersionTip),
        ),
        max_depth: scope.max_depth,
        refresh_file_history: matches!(surface, HistorySurface::File),
        file_ids: scope.file_ids.clone(),
    };

    Ok(Some(HistoryRewrite {
        query: new_query,
        requirements,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistorySurface {
    State,
    Entity,
    File,
}

impl HistorySurface {
    fn view_name(self) -> &'static str {
        match self {
            HistorySurface::State => STATE_HISTORY_VIEW,
            HistorySurface::Entity => ENTITY_HISTORY_VIEW,
            HistorySurface::File => FILE_HISTORY_VIEW,
        }
    }
}

#[derive(Debug, Default)]
struct HistoryScope {
    root_commit: Option<String>,
    max_depth: Option<i64>,
    /// Equality pushdowns rendered against the inner change scan.
    pushdowns: Vec<String>,
    file_ids: Vec<String>,
}

fn history_surface(select: &Select) -> Option<HistorySurface> {
    for table in &select.from {
        if let TableFactor::Table { name, .. } = &table.relation {
            if object_name_matches(name, STATE_HISTORY_VIEW) {
                return Some(HistorySurface::State);
            }
            if object_name_matches(name, ENTITY_HISTORY_VIEW) {
                return Some(HistorySurface::Entity);
            }
            if object_name_matches(name, FILE_HISTORY_VIEW) {
                return Some(HistorySurface::File);
            }
        }
    }
    None
}

fn history_relation_alias(select: &Select, surface: HistorySurface) -> String {
    for table in &select.from {
        if let TableFactor::Table { name, alias, .. } = &table.relation {
            if object_name_matches(name, surface.view_name()) {
                return alias
                    .as_ref()
                    .map(|value| value.name.value.clone())
                    .unwrap_or_else(|| surface.view_name().to_string());
            }
        }
    }
    surface.view_name().to_string()
}

fn replace_history_relation(
    select: &mut Select,
    surface: HistorySurface,
    derived: Query,
) -> Result<(), PlannerError> {
    for table in &mut select.from {
        let TableFactor::Table { name, alias, .. } = &table.relation else {
            continue;
        };
        if !object_name_matches(name, surface.view_name()) {
            continue;
        }
        let derived_alias = alias
            .clone()
            .or_else(|| Some(default_alias(surface.view_name())));
        table.relation = TableFactor::Derived {
            lateral: false,
            subquery: Box::new(derived),
            alias: derived_alias,
        };
        return Ok(());
    }
    Err(PlannerError::invariant(
        "history relation disappeared during rewrite",
    ))
}

/// Pulls `root_commit_id`, `depth` bounds, and entity/schema/file equality
/// predicates out of the WHERE clause. Placeholder operands are resolved to
/// their host parameter value so the emitted scan carries literals only.
fn take_history_scope(
    selection: &mut Option<Expr>,
    relation_name: &str,
    allow_unqualified: bool,
    params: &[Value],
    surface: HistorySurface,
    scope: &mut HistoryScope,
) -> Result<(), PlannerError> {
    let Some(selection_expr) = selection.take() else {
        return Ok(());
    };

    let mut remaining = Vec::new();
    for predicate in split_conjunction(selection_expr) {
        if let Some((column, _)) = extract_equality(&predicate, relation_name, allow_unqualified) {
            if column == "root_commit_id" {
                scope.root_commit = Some(resolve_scope_value(&predicate, params)?);
                continue;
            }
            if column == "depth" {
                let value = resolve_scope_value(&predicate, params)?;
                scope.max_depth = Some(parse_depth(&value)?);
                scope.pushdowns.push(format!("depth = {value}"));
                continue;
            }
            let is_pushable = match surface {
                HistorySurface::State | HistorySurface::Entity => {
                    matches!(column.as_str(), "entity_id" | "schema_key" | "file_id")
                }
                HistorySurface::File => matches!(column.as_str(), "id" | "file_id"),
            };
            if is_pushable {
                let value = resolve_scope_value(&predicate, params)?;
                let rendered = format!("'{}'", escape_sql_string(&value));
                let target = match (surface, column.as_str()) {
                    (HistorySurface::File, _) => {
                        scope.file_ids.push(value);
                        "file_id".to_string()
                    }
                    (_, other) => other.to_string(),
                };
                scope.pushdowns.push(format!("{target} = {rendered}"));
                continue;
            }
        }

        if let Some((max_depth, rendered)) = extract_depth_bound(&predicate, relation_name, allow_unqualified, params)?
        {
            scope.max_depth = Some(max_depth);
            scope.pushdowns.push(rendered);
            continue;
        }

        remaining.push(predicate);
    }
    *selection = join_conjunction(remaining);
    Ok(())
}

/// `depth <= N` / `depth < N` bounds.
fn extract_depth_bound(
    predicate: &Expr,
    relation_name: &str,
    allow_unqualified: bool,
    params: &[Value],
) -> Result<Option<(i64, String)>, PlannerError> {
    let Expr::BinaryOp { left, op, right } = predicate else {
        return Ok(None);
    };
    let strict = match op {
        BinaryOperator::LtEq => false,
        BinaryOperator::Lt => true,
        _ => return Ok(None),
    };
    let Some(column) = extract_column(left, relation_name, allow_unqualified) else {
        return Ok(None);
    };
    if column != "depth" {
        return Ok(None);
    }
    let value = resolve_value_expr(right, params)?;
    let bound = parse_depth(&value)?;
    let max_depth = if strict { bound - 1 } else { bound };
    let operator = if strict { "<" } else { "<=" };
    Ok(Some((max_depth, format!("depth {operator} {value}"))))
}

fn resolve_scope_value(predicate: &Expr, params: &[Value]) -> Result<String, PlannerError> {
    let Expr::BinaryOp { left, right, .. } = predicate else {
        return Err(PlannerError::invariant(
            "history scope predicate is not a comparison",
        ));
    };
    // The column side never resolves; try both operands.
    match resolve_value_expr(right, params) {
        Ok(value) => Ok(value),
        Err(_) => resolve_value_expr(left, params),
    }
}

/// Literal or placeholder operand to a plain string.
fn resolve_value_expr(expr: &Expr, params: &[Value]) -> Result<String, PlannerError> {
    if let Some(text) = literal_text(expr) {
        return Ok(text);
    }
    if let Expr::Value(value) = expr {
        if let sqlparser::ast::Value::Number(number, _) = &value.value {
            return Ok(number.clone());
        }
    }
    if let Some(token) = placeholder_token(expr) {
        let mut state = PlaceholderState::new();
        let index = resolve_placeholder_index(&token, params.len(), &mut state)
            .map_err(PlannerError::from)?;
        return match &params[index] {
            Value::Text(text) => Ok(text.clone()),
            Value::Integer(value) => Ok(value.to_string()),
            other => Err(PlannerError::unsupported(format!(
                "history scope parameter must be text or integer, got {other:?}"
            ))),
        };
    }
    Err(PlannerError::unsupported(format!(
        "history scope must be an explicit constant or bound parameter, got {expr}"
    )))
}

fn parse_depth(value: &str) -> Result<i64, PlannerError> {
    value.parse::<i64>().map_err(|_| {
        PlannerError::unsupported(format!("history depth bound must be an integer, got '{value}'"))
    })
}

/// Scalar subquery resolving the active version's tip commit.
pub(crate) fn active_version_tip_sql(dialect: SqlDialect) -> String {
    let tip_table = quote_ident(&materialized_table_name(VERSION_TIP_SCHEMA_KEY));
    let tip_id = quote_ident(&projected_column_name("id"));
    let commit_id_expr = json_text_extract_expr(dialect, "commit_id");
    let version_id_expr = json_text_extract_expr(dialect, "version_id");
    format!(
        "(SELECT {commit_id_expr} FROM {tip_table} \
          WHERE version_id = '{GLOBAL_VERSION_ID}' AND is_tombstone = 0 \
            AND snapshot_content IS NOT NULL \
            AND {tip_id} = ( \
              SELECT {version_id_expr} FROM {UNTRACKED_TABLE} \
              WHERE schema_key = '{ACTIVE_VERSION_SCHEMA_KEY}' \
                AND entity_id = '{ACTIVE_VERSION_ENTITY_ID}' \
                AND version_id = '{ACTIVE_VERSION_STORAGE_VERSION_ID}' \
                AND snapshot_content IS NOT NULL \
              ORDER BY updated_at DESC LIMIT 1))"
    )
}

/// Commit membership: change id → owning commit id, derived from the
/// change-set element and commit snapshots in the global version.
fn commit_membership_sql(dialect: SqlDialect) -> String {
    let cse_table = quote_ident(&materialized_table_name(CHANGE_SET_ELEMENT_SCHEMA_KEY));
    let commit_table = quote_ident(&materialized_table_name(COMMIT_SCHEMA_KEY));
    let cse_change_id = quote_ident(&projected_column_name("change_id"));
    let cse_change_set_id = quote_ident(&projected_column_name("change_set_id"));
    let commit_id = quote_ident(&projected_column_name("id"));
    let commit_change_set_expr = json_text_extract_expr(dialect, "change_set_id")
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

fn root_commit_sql(scope: &HistoryScope, dialect: SqlDialect) -> String {
    match &scope.root_commit {
        Some(commit_id) => format!("'{}'", escape_sql_string(commit_id)),
        None => active_version_tip_sql(dialect),
    }
}

fn build_state_history_query(scope: &HistoryScope, dialect: SqlDialect) -> String {
    let membership = commit_membership_sql(dialect);
    let root = root_commit_sql(scope, dialect);
    let extra = scope
        .pushdowns
        .iter()
        .map(|predicate| format!(" AND history.{predicate}"))
        .collect::<String>();
    format!(
        "SELECT entity_id, schema_key, schema_version, file_id, plugin_key, snapshot_content, \
         metadata, change_id, commit_id, root_commit_id, depth, created_at \
         FROM ( \
           SELECT \
             c.entity_id AS entity_id, \
             c.schema_key AS schema_key, \
             c.schema_version AS schema_version, \
             c.file_id AS file_id, \
             c.plugin_key AS plugin_key, \
             sn.content AS snapshot_content, \
             c.metadata AS metadata, \
             c.id AS change_id, \
             m.commit_id AS commit_id, \
             g.root_commit_id AS root_commit_id, \
             g.depth AS depth, \
             c.created_at AS created_at \
           FROM {CHANGE_TABLE} c \
           JOIN {SNAPSHOT_TABLE} sn ON sn.id = c.snapshot_id \
           JOIN {membership} m ON m.change_id = c.id \
           JOIN {COMMIT_GRAPH_TABLE} g ON g.commit_id = m.commit_id \
           WHERE g.root_commit_id = {root} \
         ) AS history \
         WHERE 1 = 1{extra}"
    )
}

fn build_file_history_query(scope: &HistoryScope, dialect: SqlDialect) -> String {
    let root = match &scope.root_commit {
        Some(commit_id) => format!("'{}'", escape_sql_string(commit_id)),
        None => active_version_tip_sql(dialect),
    };
    let extra = scope
        .pushdowns
        .iter()
        .map(|predicate| format!(" AND history.{predicate}"))
        .collect::<String>();
    format!(
        "SELECT file_id, root_commit_id, depth, commit_id, data, created_at \
         FROM ( \
           SELECT file_id, root_commit_id, depth, commit_id, data, created_at \
           FROM {FILE_HISTORY_CACHE_TABLE} \
           WHERE root_commit_id = {root} \
         ) AS history \
         WHERE 1 = 1{extra}"
    )
}

#[cfg(test)]
mod tests {
    use super::{rewrite_history_query, CatalogSnapshot};
    use crate::sql::contracts::HistoryRootScope;
    use crate::{SqlDialect, Value};
    use sqlparser::ast::Statement;
    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;
    use std::collections::BTreeSet;

    fn catalog() -> CatalogSnapshot {
        CatalogSnapshot {
            dialect: SqlDialect::Sqlite,
            registered_schema_keys: BTreeSet::new(),
        }
    }

    fn parse_query(sql: &str) -> sqlparser::ast::Query {
        let mut statements = Parser::parse_sql(&GenericDialect {}, sql).expect("valid SQL");
        assert_eq!(statements.len(), 1);
        match statements.remove(0) {
            Statement::Query(query) => *query,
            _ => panic!("expected query"),
        }
    }

    #[test]
    fn explicit_root_scope_is_extracted_and_lowered_as_a_literal() {
        let query = parse_query(
            "SELECT snapshot_content FROM lix_state_history \
             WHERE entity_id = 'e' AND root_commit_id = 'c3' ORDER BY created_at DESC LIMIT 1",
        );
        let rewrite = rewrite_history_query(&query, &[], &catalog())
            .expect("rewrite should succeed")
            .expect("history surface should match");
        let sql = rewrite.query.to_string();
        assert!(sql.contains("g.root_commit_id = 'c3'"));
        assert!(sql.contains("entity_id = 'e'"));
        assert_eq!(
            rewrite.requirements.root_scope,
            Some(HistoryRootScope::Commit("c3".to_string()))
        );
    }

    #[test]
    fn placeholder_root_scope_resolves_against_host_params() {
        let query = parse_query(
            "SELECT snapshot_content FROM lix_state_history WHERE root_commit_id = ?1",
        );
        let rewrite = rewrite_history_query(
            &query,
            &[Value::Text("c9".to_string())],
            &catalog(),
        )
        .expect("rewrite should succeed")
        .expect("history surface should match");
        assert_eq!(
            rewrite.requirements.root_scope,
            Some(HistoryRootScope::Commit("c9".to_string()))
        );
        // The consumed placeholder must not survive anywhere in the plan.
        assert!(!rewrite.query.to_string().contains("?1"));
    }

    #[test]
    fn missing_root_scope_demands_the_active_tip() {
        let query = parse_query("SELECT * FROM lix_state_history WHERE entity_id = 'e'");
        let rewrite = rewrite_history_query(&query, &[], &catalog())
            .expect("rewrite should succeed")
            .expect("history surface should match");
        assert_eq!(
            rewrite.requirements.root_scope,
            Some(HistoryRootScope::ActiveVersionTip)
        );
        assert_eq!(rewrite.requirements.max_depth, None);
        assert!(rewrite.query.to_string().contains("lix_version_tip"));
    }

    #[test]
    fn depth_bound_limits_materialization() {
        let query = parse_query(
            "SELECT * FROM lix_state_history WHERE root_commit_id = 'c1' AND depth <= 3",
        );
        let rewrite = rewrite_history_query(&query, &[], &catalog())
            .expect("rewrite should succeed")
            .expect("history surface should match");
        assert_eq!(rewrite.requirements.max_depth, Some(3));
        assert!(rewrite.query.to_string().contains("depth <= 3"));
    }

    #[test]
    fn file_history_reads_the_file_history_cache() {
        let query = parse_query(
            "SELECT data FROM lix_file_history WHERE id = 'f1' AND root_commit_id = 'c1'",
        );
        let rewrite = rewrite_history_query(&query, &[], &catalog())
            .expect("rewrite should succeed")
            .expect("history surface should match");
        assert!(rewrite.requirements.refresh_file_history);
        let sql = rewrite.query.to_string();
        assert!(sql.contains("lix_internal_file_history_cache"));
        assert!(sql.contains("file_id = 'f1'"));
    }
}
