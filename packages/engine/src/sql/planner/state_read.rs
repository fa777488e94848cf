use sqlparser::ast::{
    Expr, GroupByExpr, Query, Select, SetExpr, TableFactor, TableWithJoins,
};

use crate::builtin_schema::{ACTIVE_VERSION_SCHEMA_KEY, VERSION_DESCRIPTOR_SCHEMA_KEY};
use crate::schema_registry::{
    json_text_extract_expr, materialized_table_name, quote_ident, UNTRACKED_TABLE, VTABLE_VIEW,
};
use crate::sql::ast_utils::{
    default_alias, extract_column, extract_equality, join_conjunction, literal_text,
    object_name_matches, parse_single_query, split_conjunction,
};
use crate::sql::contracts::PlannerError;
use crate::version::{
    ACTIVE_VERSION_ENTITY_ID, ACTIVE_VERSION_STORAGE_VERSION_ID, GLOBAL_VERSION_ID,
    MAX_INHERITANCE_DEPTH,
};
use crate::SqlDialect;

use super::CatalogSnapshot;

pub(crate) const STATE_VIEW: &str = "lix_state";
pub(crate) const STATE_BY_VERSION_VIEW: &str = "lix_state_by_version";
pub(crate) const ENTITY_VIEW: &str = "entity";
pub(crate) const ENTITY_BY_VERSION_VIEW: &str = "entity_by_version";

/// Version scope of one effective-state scan, rendered as SQL value
/// expressions (literals or normalized placeholders).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ScanScope {
    Active,
    VersionValues(Vec<String>),
    AllVersions,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct StatePushdown {
    /// Predicates applied to the candidate scan, before ranking.
    pub(crate) source: Vec<String>,
    /// Predicates applied after winner selection (`plugin_key`), preserving
    /// row-choice semantics.
    pub(crate) ranked: Vec<String>,
    /// Present when `schema_key = '<literal>'` was pushed down; used to
    /// narrow the scan to one materialized table.
    pub(crate) schema_key_literal: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanProjection {
    Full,
    Count,
}

/// Rewrites `lix_state`, `lix_state_by_version`, `entity`, and
/// `entity_by_version` references into the canonical ranked scan. Returns
/// `None` when the query does not touch a state surface.
pub(crate) fn rewrite_query(
    query: &Query,
    catalog: &CatalogSnapshot,
) -> Result<Option<Query>, PlannerError> {
    let mut changed = false;
    let mut new_query = query.clone();
    new_query.body = Box::new(rewrite_set_expr(*new_query.body, catalog, &mut changed)?);
    if changed {
        Ok(Some(new_query))
    } else {
        Ok(None)
    }
}

fn rewrite_set_expr(
    expr: SetExpr,
    catalog: &CatalogSnapshot,
    changed: &mut bool,
) -> Result<SetExpr, PlannerError> {
    Ok(match expr {
        SetExpr::Select(select) => {
            let mut select = *select;
            rewrite_select(&mut select, catalog, changed)?;
            SetExpr::Select(Box::new(select))
        }
        SetExpr::Query(query) => {
            let mut query = *query;
            query.body = Box::new(rewrite_set_expr(*query.body, catalog, changed)?);
            SetExpr::Query(Box::new(query))
        }
        SetExpr::SetOperation {
            op,
            set_quantifier,
            left,
            right,
        } => SetExpr::SetOperation {
            op,
            set_quantifier,
            left: Box::new(rewrite_set_expr(*left, catalog, changed)?),
            right: Box::new(rewrite_set_expr(*right, catalog, changed)?),
        },
        other => other,
    })
}

fn rewrite_select(
    select: &mut Select,
    catalog: &CatalogSnapshot,
    changed: &mut bool,
) -> Result<(), PlannerError> {
    let count_fast_path = select_supports_count_fast_path(select);
    let allow_unqualified = select.from.len() == 1 && select.from[0].joins.is_empty();
    for table in &mut select.from {
        rewrite_table_with_joins(
            table,
            &mut select.selection,
            catalog,
            allow_unqualified,
            count_fast_path,
            changed,
        )?;
    }
    Ok(())
}

fn rewrite_table_with_joins(
    table: &mut TableWithJoins,
    selection: &mut Option<Expr>,
    catalog: &CatalogSnapshot,
    allow_unqualified: bool,
    count_fast_path: bool,
    changed: &mut bool,
) -> Result<(), PlannerError> {
    rewrite_table_factor(
        &mut table.relation,
        selection,
        catalog,
        allow_unqualified,
        count_fast_path,
        changed,
    )?;
    for join in &mut table.joins {
        rewrite_table_factor(&mut join.relation, selection, catalog, false, false, changed)?;
    }
    Ok(())
}

fn rewrite_table_factor(
    relation: &mut TableFactor,
    selection: &mut Option<Expr>,
    catalog: &CatalogSnapshot,
    allow_unqualified: bool,
    count_fast_path: bool,
    changed: &mut bool,
) -> Result<(), PlannerError> {
    match relation {
        TableFactor::Table { name, alias, .. } => {
            let surface = [
                STATE_VIEW,
                STATE_BY_VERSION_VIEW,
                ENTITY_VIEW,
                ENTITY_BY_VERSION_VIEW,
            ]
            .into_iter()
            .find(|surface| object_name_matches(name, surface));
            let Some(surface) = surface else {
                return Ok(());
            };

            let relation_name = alias
                .as_ref()
                .map(|value| value.name.value.clone())
                .unwrap_or_else(|| surface.to_string());
            let by_version = matches!(surface, STATE_BY_VERSION_VIEW | ENTITY_BY_VERSION_VIEW);
            let (scope, pushdown) =
                take_pushdowns(selection, &relation_name, allow_unqualified, by_version);

            let projection = if count_fast_path && selection.is_none() && pushdown.ranked.is_empty()
            {
                ScanProjection::Count
            } else {
                ScanProjection::Full
            };

            let sql =
                build_effective_state_query(&scope, &pushdown, projection, catalog)?;
            let derived_query = parse_single_query(&sql)?;
            let derived_alias = alias.clone().or_else(|| Some(default_alias(surface)));
            *relation = TableFactor::Derived {
                lateral: false,
                subquery: Box::new(derived_query),
                alias: derived_alias,
            };
            *changed = true;
        }
        TableFactor::Derived { subquery, .. } => {
            if let Some(rewritten) = rewrite_query(subquery, catalog)? {
                *subquery = Box::new(rewritten);
                *changed = true;
            }
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            rewrite_table_with_joins(
                table_with_joins,
                selection,
                catalog,
                allow_unqualified,
                count_fast_path,
                changed,
            )?;
        }
        _ => {}
    }
    Ok(())
}

fn select_supports_count_fast_path(select: &Select) -> bool {
    if select.projection.len() != 1 {
        return false;
    }
    let projection_normalized = select.projection[0]
        .to_string()
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    if projection_normalized != "count(*)" {
        return false;
    }

    if select.distinct.is_some()
        || select.top.is_some()
        || select.having.is_some()
        || !select.named_window.is_empty()
        || select.qualify.is_some()
        || !select.sort_by.is_empty()
    {
        return false;
    }
    match &select.group_by {
        GroupByExpr::Expressions(exprs, modifiers) => {
            if !exprs.is_empty() || !modifiers.is_empty() {
                return false;
            }
        }
        GroupByExpr::All(_) => return false,
    }

    select.from.len() == 1 && select.from[0].joins.is_empty()
}

/// Splits the WHERE conjunction into version scope, source pushdowns, and
/// post-rank pushdowns. Consumed predicates are removed from the selection so
/// no placeholder inside them can bind twice.
fn take_pushdowns(
    selection: &mut Option<Expr>,
    relation_name: &str,
    allow_unqualified: bool,
    by_version: bool,
) -> (ScanScope, StatePushdown) {
    let mut scope = if by_version {
        ScanScope::AllVersions
    } else {
        ScanScope::Active
    };
    let Some(selection_expr) = selection.take() else {
        return (scope, StatePushdown::default());
    };

    let mut pushdown = StatePushdown::default();
    let mut remaining = Vec::new();
    for predicate in split_conjunction(selection_expr) {
        if by_version {
            if let Some(values) = extract_version_scope(&predicate, relation_name, allow_unqualified)
            {
                scope = ScanScope::VersionValues(values);
                continue;
            }
        }

        let Some((column, value_sql)) =
            extract_equality(&predicate, relation_name, allow_unqualified)
        else {
            remaining.push(predicate);
            continue;
        };

        match column.as_str() {
            "entity_id" | "schema_key" | "file_id" => {
                if column == "schema_key" {
                    pushdown.schema_key_literal = literal_text(equality_value_expr(&predicate));
                }
                pushdown.source.push(format!("s.{column} = {value_sql}"));
            }
            "plugin_key" => {
                pushdown
                    .ranked
                    .push(format!("ranked.{column} = {value_sql}"));
            }
            _ => remaining.push(predicate),
        }
    }
    *selection = join_conjunction(remaining);
    (scope, pushdown)
}

/// The value operand of an equality, for literal sniffing.
fn equality_value_expr(predicate: &Expr) -> &Expr {
    match predicate {
        Expr::BinaryOp { left, right, .. } => {
            if literal_text(right).is_some() {
                right
            } else {
                left
            }
        }
        other => other,
    }
}

fn extract_version_scope(
    predicate: &Expr,
    relation_name: &str,
    allow_unqualified: bool,
) -> Option<Vec<String>> {
    if let Some((column, value_sql)) =
        extract_equality(predicate, relation_name, allow_unqualified)
    {
        if column == "version_id" {
            return Some(vec![value_sql]);
        }
        return None;
    }

    if let Expr::InList {
        expr,
        list,
        negated: false,
    } = predicate
    {
        let column = extract_column(expr, relation_name, allow_unqualified)?;
        if column == "version_id" {
            return Some(list.iter().map(|item| item.to_string()).collect());
        }
    }
    None
}

/// The canonical effective-state lowering: a recursive version chain over
/// the descriptor table, candidates joined by chain membership, ranked by
/// `(depth ASC, untracked DESC)` per `(root, entity, schema, file)`, winners
/// filtered to non-tombstones. The count projection replaces the rank window
/// with a grouped liveness aggregate.
pub(crate) fn build_effective_state_query(
    scope: &ScanScope,
    pushdown: &StatePushdown,
    projection: ScanProjection,
    catalog: &CatalogSnapshot,
) -> Result<String, PlannerError> {
    let scope_root = scope_root_sql(scope, catalog.dialect);
    let version_chain = version_chain_sql(catalog.dialect);
    let source = candidate_source_sql(pushdown, catalog);
    let source_where = if pushdown.source.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", pushdown.source.join(" AND "))
    };
    let ranked_where = if pushdown.ranked.is_empty() {
        String::new()
    } else {
        format!(" AND {}", pushdown.ranked.join(" AND "))
    };

    let sql = match projection {
        ScanProjection::Full => format!(
            "SELECT entity_id, schema_key, schema_version, file_id, version_id, plugin_key, \
             snapshot_content, change_id, commit_id, metadata, is_tombstone, untracked, \
             inherited_from_version_id, created_at, updated_at \
             FROM ( \
               WITH RECURSIVE scope_root(root_version_id) AS ({scope_root}), \
               {version_chain} \
               SELECT \
                 s.entity_id AS entity_id, \
                 s.schema_key AS schema_key, \
                 s.schema_version AS schema_version, \
                 s.file_id AS file_id, \
                 vc.root_version_id AS version_id, \
                 s.plugin_key AS plugin_key, \
                 s.snapshot_content AS snapshot_content, \
                 s.change_id AS change_id, \
                 s.commit_id AS commit_id, \
                 s.metadata AS metadata, \
                 s.is_tombstone AS is_tombstone, \
                 s.untracked AS untracked, \
                 CASE WHEN vc.depth = 0 THEN NULL ELSE s.version_id END AS inherited_from_version_id, \
                 s.created_at AS created_at, \
                 s.updated_at AS updated_at, \
                 ROW_NUMBER() OVER ( \
                   PARTITION BY vc.root_version_id, s.entity_id, s.schema_key, s.file_id \
                   ORDER BY vc.depth ASC, s.untracked DESC, s.created_at DESC, s.change_id DESC \
                 ) AS rn \
               FROM {source} s \
               JOIN version_chain vc ON vc.version_id = s.version_id\
               {source_where} \
             ) AS ranked \
             WHERE ranked.rn = 1 AND ranked.snapshot_content IS NOT NULL{ranked_where}"
        ),
        ScanProjection::Count => format!(
            "SELECT entity_id FROM ( \
               WITH RECURSIVE scope_root(root_version_id) AS ({scope_root}), \
               {version_chain} \
               SELECT s.entity_id AS entity_id \
               FROM {source} s \
               JOIN version_chain vc ON vc.version_id = s.version_id\
               {source_where} \
               GROUP BY vc.root_version_id, s.entity_id, s.schema_key, s.file_id \
               HAVING MIN(vc.depth * 4 + (1 - s.untracked) * 2 + \
                 CASE WHEN s.snapshot_content IS NULL THEN 1 ELSE 0 END) % 2 = 0 \
             ) AS live"
        ),
    };

    Ok(sql)
}

fn scope_root_sql(scope: &ScanScope, dialect: SqlDialect) -> String {
    match scope {
        ScanScope::Active => {
            let version_id_expr = json_text_extract_expr(dialect, "version_id");
            format!(
                "SELECT {version_id_expr} FROM {UNTRACKED_TABLE} \
                 WHERE schema_key = '{ACTIVE_VERSION_SCHEMA_KEY}' \
                   AND entity_id = '{ACTIVE_VERSION_ENTITY_ID}' \
                   AND version_id = '{ACTIVE_VERSION_STORAGE_VERSION_ID}' \
                   AND snapshot_content IS NOT NULL \
                 ORDER BY updated_at DESC LIMIT 1"
            )
        }
        ScanScope::VersionValues(values) => {
            let rows = values
                .iter()
                .map(|value| format!("({value})"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("VALUES {rows}")
        }
        ScanScope::AllVersions => {
            let descriptor_table = quote_ident(&materialized_table_name(
                VERSION_DESCRIPTOR_SCHEMA_KEY,
            ));
            let id_column = quote_ident(&crate::schema_registry::projected_column_name("id"));
            format!(
                "SELECT {id_column} FROM {descriptor_table} \
                 WHERE version_id = '{GLOBAL_VERSION_ID}' AND is_tombstone = 0 \
                   AND snapshot_content IS NOT NULL"
            )
        }
    }
}

fn version_chain_sql(dialect: SqlDialect) -> String {
    let descriptor_table = quote_ident(&materialized_table_name(VERSION_DESCRIPTOR_SCHEMA_KEY));
    let id_column = quote_ident(&crate::schema_registry::projected_column_name("id"));
    let inherits_expr = json_text_extract_expr(dialect, "inherits_from_version_id");
    let inherits_on_vd = inherits_expr.replace("snapshot_content", "vd.snapshot_content");
    format!(
        "version_chain(root_version_id, version_id, depth) AS ( \
           SELECT root_version_id, root_version_id, 0 FROM scope_root \
           UNION ALL \
           SELECT vc.root_version_id, {inherits_on_vd}, vc.depth + 1 \
           FROM version_chain vc \
           JOIN {descriptor_table} vd ON vd.{id_column} = vc.version_id \
           WHERE vd.version_id = '{GLOBAL_VERSION_ID}' \
             AND vd.is_tombstone = 0 \
             AND vd.snapshot_content IS NOT NULL \
             AND {inherits_on_vd} IS NOT NULL \
             AND vc.depth < {MAX_INHERITANCE_DEPTH} \
         )"
    )
}

/// The candidate scan: one schema's materialized table plus the untracked
/// overlay when the schema key was pushed down as a registered literal, the
/// whole vtable view otherwise.
fn candidate_source_sql(pushdown: &StatePushdown, catalog: &CatalogSnapshot) -> String {
    let Some(schema_key) = pushdown
        .schema_key_literal
        .as_ref()
        .filter(|key| catalog.registered_schema_keys.contains(*key))
    else {
        return VTABLE_VIEW.to_string();
    };

    let table = quote_ident(&materialized_table_name(schema_key));
    let escaped = crate::sql::escape_sql_string(schema_key);
    format!(
        "(SELECT entity_id, schema_key, schema_version, file_id, version_id, plugin_key, \
         snapshot_content, change_id, commit_id, metadata, is_tombstone, 0 AS untracked, \
         created_at, updated_at FROM {table} \
         UNION ALL \
         SELECT entity_id, schema_key, schema_version, file_id, version_id, plugin_key, \
         snapshot_content, NULL AS change_id, 'untracked' AS commit_id, NULL AS metadata, \
         0 AS is_tombstone, 1 AS untracked, created_at, updated_at FROM {UNTRACKED_TABLE} \
         WHERE schema_key = '{escaped}')"
    )
}
