use std::ops::ControlFlow;

use sqlparser::ast::{
    visit_expressions, Expr, Query, Select, SelectItem, SetExpr, TableFactor,
};

use crate::builtin_schema::{
    ACTIVE_VERSION_SCHEMA_KEY, DIRECTORY_DESCRIPTOR_SCHEMA_KEY, FILE_DESCRIPTOR_SCHEMA_KEY,
    VERSION_DESCRIPTOR_SCHEMA_KEY, VERSION_TIP_SCHEMA_KEY,
};
use crate::schema_registry::{json_text_extract_expr, UNTRACKED_TABLE};
use crate::sql::ast_utils::{
    default_alias, extract_equality, join_conjunction, literal_text, object_name_matches,
    parse_single_query, placeholder_token, split_conjunction,
};
use crate::sql::contracts::{FileDataRequirement, PlannerError, VersionScope};
use crate::sql::params::{resolve_placeholder_index, PlaceholderState};
use crate::storage::FILE_DATA_CACHE_TABLE;
use crate::version::{ACTIVE_VERSION_ENTITY_ID, ACTIVE_VERSION_STORAGE_VERSION_ID, GLOBAL_VERSION_ID};
use crate::{SqlDialect, Value};

use super::state_read::{
    build_effective_state_query, ScanProjection, ScanScope, StatePushdown,
};
use super::CatalogSnapshot;

pub(crate) const FILE_VIEW: &str = "lix_file";
pub(crate) const FILE_BY_VERSION_VIEW: &str = "lix_file_by_version";
pub(crate) const DIRECTORY_VIEW: &str = "lix_directory";
pub(crate) const VERSION_VIEW: &str = "lix_version";
pub(crate) const ACTIVE_VERSION_VIEW: &str = "lix_active_version";

pub(crate) struct FilesystemRewrite {
    pub(crate) query: Query,
    pub(crate) file_data: Option<FileDataRequirement>,
}

/// Rewrites filesystem and version read surfaces. File descriptor rows come
/// from the effective-state scan; `path` is derived by a recursive directory
/// walk; `data` joins the file-data cache, and a `FileDataRequirement` tells
/// the runner what to materialize into that cache first.
pub(crate) fn rewrite_filesystem_query(
    query: &Query,
    params: &[Value],
    catalog: &CatalogSnapshot,
) -> Result<Option<FilesystemRewrite>, PlannerError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Ok(None);
    };
    let Some((surface, relation_name)) = filesystem_surface(select) else {
        return Ok(None);
    };

    let mut new_query = query.clone();
    let SetExpr::Select(select) = new_query.body.as_mut() else {
        return Ok(None);
    };
    let select = select.as_mut();
    let allow_unqualified = select.from.len() == 1 && select.from[0].joins.is_empty();

    let needs_data = matches!(surface, FsSurface::File | FsSurface::FileByVersion)
        && projection_requires_data(select);

    let file_data = if needs_data {
        Some(extract_file_data_requirement(
            select.selection.as_ref(),
            &relation_name,
            allow_unqualified,
            params,
            matches!(surface, FsSurface::FileByVersion),
        )?)
    } else {
        None
    };

    let scope = take_version_scope(
        &mut select.selection,
        &relation_name,
        allow_unqualified,
        surface,
    );
    let entity_pushdown = take_id_pushdown(
        &mut select.selection,
        &relation_name,
        allow_unqualified,
        surface,
    );

    let sql = match surface {
        FsSurface::File | FsSurface::FileByVersion => {
            build_file_query(&scope, entity_pushdown.as_deref(), catalog)?
        }
        FsSurface::Directory => build_directory_query(&scope, entity_pushdown.as_deref(), catalog)?,
        FsSurface::Version => build_version_query(catalog)?,
        FsSurface::ActiveVersion => build_active_version_query(catalog.dialect),
    };
    let derived = parse_single_query(&sql)?;

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
        return Ok(Some(FilesystemRewrite {
            query: new_query,
            file_data,
        }));
    }
    Err(PlannerError::invariant(
        "filesystem relation disappeared during rewrite",
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsSurface {
    File,
    FileByVersion,
    Directory,
    Version,
    ActiveVersion,
}

impl FsSurface {
    fn view_name(self) -> &'static str {
        match self {
            FsSurface::File => FILE_VIEW,
            FsSurface::FileByVersion => FILE_BY_VERSION_VIEW,
            FsSurface::Directory => DIRECTORY_VIEW,
            FsSurface::Version => VERSION_VIEW,
            FsSurface::ActiveVersion => ACTIVE_VERSION_VIEW,
        }
    }
}

fn filesystem_surface(select: &Select) -> Option<(FsSurface, String)> {
    for table in &select.from {
        if let TableFactor::Table { name, alias, .. } = &table.relation {
            let surface = if object_name_matches(name, FILE_BY_VERSION_VIEW) {
                Some(FsSurface::FileByVersion)
            } else if object_name_matches(name, FILE_VIEW) {
                Some(FsSurface::File)
            } else if object_name_matches(name, DIRECTORY_VIEW) {
                Some(FsSurface::Directory)
            } else if object_name_matches(name, VERSION_VIEW) {
                Some(FsSurface::Version)
            } else if object_name_matches(name, ACTIVE_VERSION_VIEW) {
                Some(FsSurface::ActiveVersion)
            } else {
                None
            };
            if let Some(surface) = surface {
                let relation_name = alias
                    .as_ref()
                    .map(|value| value.name.value.clone())
                    .unwrap_or_else(|| surface.view_name().to_string());
                return Some((surface, relation_name));
            }
        }
    }
    None
}

fn projection_requires_data(select: &Select) -> bool {
    for item in &select.projection {
        match item {
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => return true,
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                let mut found = false;
                let _ = visit_expressions(expr, |node: &Expr| {
                    let is_data = match node {
                        Expr::Identifier(ident) => ident.value.eq_ignore_ascii_case("data"),
                        Expr::CompoundIdentifier(parts) => parts
                            .last()
                            .map(|ident| ident.value.eq_ignore_ascii_case("data"))
                            .unwrap_or(false),
                        _ => false,
                    };
                    if is_data {
                        found = true;
                        return ControlFlow::Break(());
                    }
                    ControlFlow::<()>::Continue(())
                });
                if found {
                    return true;
                }
            }
        }
    }
    false
}

fn take_version_scope(
    selection: &mut Option<Expr>,
    relation_name: &str,
    allow_unqualified: bool,
    surface: FsSurface,
) -> ScanScope {
    if !matches!(surface, FsSurface::FileByVersion) {
        return ScanScope::Active;
    }
    let Some(selection_expr) = selection.take() else {
        return ScanScope::AllVersions;
    };

    let mut scope = ScanScope::AllVersions;
    let mut remaining = Vec::new();
    for predicate in split_conjunction(selection_expr) {
        if let Some((column, value_sql)) =
            extract_equality(&predicate, relation_name, allow_unqualified)
        {
            if column == "version_id" {
                scope = ScanScope::VersionValues(vec![value_sql]);
                continue;
            }
        }
        remaining.push(predicate);
    }
    *selection = join_conjunction(remaining);
    scope
}

fn take_id_pushdown(
    selection: &mut Option<Expr>,
    relation_name: &str,
    allow_unqualified: bool,
    surface: FsSurface,
) -> Option<String> {
    if !matches!(
        surface,
        FsSurface::File | FsSurface::FileByVersion | FsSurface::Directory
    ) {
        return None;
    }
    let selection_expr = selection.take()?;

    let mut pushdown = None;
    let mut remaining = Vec::new();
    for predicate in split_conjunction(selection_expr) {
        if pushdown.is_none() {
            if let Some((column, value_sql)) =
                extract_equality(&predicate, relation_name, allow_unqualified)
            {
                if column == "id" {
                    pushdown = Some(value_sql);
                    continue;
                }
            }
        }
        remaining.push(predicate);
    }
    *selection = join_conjunction(remaining);
    pushdown
}

fn extract_file_data_requirement(
    selection: Option<&Expr>,
    relation_name: &str,
    allow_unqualified: bool,
    params: &[Value],
    by_version: bool,
) -> Result<FileDataRequirement, PlannerError> {
    let mut requirement = FileDataRequirement {
        version: if by_version {
            VersionScope::Versions(Vec::new())
        } else {
            VersionScope::Active
        },
        file_id_equals: None,
        path_equals: None,
    };

    let Some(selection) = selection else {
        return Ok(requirement);
    };
    for predicate in split_conjunction(selection.clone()) {
        let Some((column, _)) = extract_equality(&predicate, relation_name, allow_unqualified)
        else {
            continue;
        };
        match column.as_str() {
            "id" => requirement.file_id_equals = scope_value(&predicate, params),
            "path" => requirement.path_equals = scope_value(&predicate, params),
            "version_id" if by_version => {
                if let Some(value) = scope_value(&predicate, params) {
                    requirement.version = VersionScope::Versions(vec![value]);
                }
            }
            _ => {}
        }
    }
    Ok(requirement)
}

/// Resolves the non-column operand to a plain string, reading (not
/// consuming) host parameters for placeholders.
fn scope_value(predicate: &Expr, params: &[Value]) -> Option<String> {
    let Expr::BinaryOp { left, right, .. } = predicate else {
        return None;
    };
    for operand in [right.as_ref(), left.as_ref()] {
        if let Some(text) = literal_text(operand) {
            return Some(text);
        }
        if let Some(token) = placeholder_token(operand) {
            let mut state = PlaceholderState::new();
            if let Ok(index) = resolve_placeholder_index(&token, params.len(), &mut state) {
                if let Value::Text(text) = &params[index] {
                    return Some(text.clone());
                }
            }
        }
    }
    None
}

/// Effective directory rows plus their recursively composed paths, shared by
/// the file and directory lowerings. Produces `dirs` and `dir_paths` CTE
/// bodies over the given scope.
fn directory_ctes(scope: &ScanScope, catalog: &CatalogSnapshot) -> Result<(String, String), PlannerError> {
    let mut pushdown = StatePushdown::default();
    pushdown.schema_key_literal = Some(DIRECTORY_DESCRIPTOR_SCHEMA_KEY.to_string());
    pushdown
        .source
        .push(format!("s.schema_key = '{DIRECTORY_DESCRIPTOR_SCHEMA_KEY}'"));
    let scan = build_effective_state_query(scope, &pushdown, ScanProjection::Full, catalog)?;

    let parent_expr = json_text_extract_expr(catalog.dialect, "parent_id");
    let name_expr = json_text_extract_expr(catalog.dialect, "name");
    let dirs = format!(
        "SELECT entity_id AS id, {parent_expr} AS parent_id, {name_expr} AS name, \
         version_id, inherited_from_version_id, created_at, updated_at \
         FROM ({scan}) AS eds"
    );
    let dir_paths = "SELECT version_id, id, '/' || name || '/' AS path FROM dirs WHERE parent_id IS NULL \
         UNION ALL \
         SELECT d.version_id, d.id, dp.path || d.name || '/' FROM dirs d \
         JOIN dir_paths dp ON dp.id = d.parent_id AND dp.version_id = d.version_id"
        .to_string();
    Ok((dirs, dir_paths))
}

pub(crate) fn build_file_query(
    scope: &ScanScope,
    id_pushdown: Option<&str>,
    catalog: &CatalogSnapshot,
) -> Result<String, PlannerError> {
    let mut pushdown = StatePushdown::default();
    pushdown.schema_key_literal = Some(FILE_DESCRIPTOR_SCHEMA_KEY.to_string());
    pushdown
        .source
        .push(format!("s.schema_key = '{FILE_DESCRIPTOR_SCHEMA_KEY}'"));
    if let Some(id_value) = id_pushdown {
        pushdown.source.push(format!("s.entity_id = {id_value}"));
    }
    let scan = build_effective_state_query(scope, &pushdown, ScanProjection::Full, catalog)?;

    let (dirs, dir_paths) = directory_ctes(scope, catalog)?;
    let directory_expr = json_text_extract_expr(catalog.dialect, "directory_id");
    let name_expr = json_text_extract_expr(catalog.dialect, "name");
    let extension_expr = json_text_extract_expr(catalog.dialect, "extension");
    let metadata_expr = json_text_extract_expr(catalog.dialect, "metadata");
    let hidden_expr = hidden_flag_expr(catalog.dialect);

    Ok(format!(
        "SELECT id, path, directory_id, name, extension, metadata, hidden, data, version_id, \
         inherited_from_version_id, created_at, updated_at \
         FROM ( \
           WITH RECURSIVE dirs AS ({dirs}), \
           dir_paths(version_id, id, path) AS ({dir_paths}), \
           files AS ( \
             SELECT entity_id AS id, \
                    {directory_expr} AS directory_id, \
                    {name_expr} AS name, \
                    {extension_expr} AS extension, \
                    {metadata_expr} AS metadata, \
                    {hidden_expr} AS hidden, \
                    version_id, inherited_from_version_id, created_at, updated_at \
             FROM ({scan}) AS efs \
           ) \
           SELECT f.id AS id, \
                  CASE \
                    WHEN f.directory_id IS NULL THEN '/' || f.name || \
                      CASE WHEN f.extension IS NULL THEN '' ELSE '.' || f.extension END \
                    WHEN dp.path IS NOT NULL THEN dp.path || f.name || \
                      CASE WHEN f.extension IS NULL THEN '' ELSE '.' || f.extension END \
                    ELSE NULL \
                  END AS path, \
                  f.directory_id AS directory_id, \
                  f.name AS name, \
                  f.extension AS extension, \
                  f.metadata AS metadata, \
                  f.hidden AS hidden, \
                  fd.data AS data, \
                  f.version_id AS version_id, \
                  f.inherited_from_version_id AS inherited_from_version_id, \
                  f.created_at AS created_at, \
                  f.updated_at AS updated_at \
           FROM files f \
           LEFT JOIN dir_paths dp ON dp.id = f.directory_id AND dp.version_id = f.version_id \
           LEFT JOIN {FILE_DATA_CACHE_TABLE} fd ON fd.file_id = f.id AND fd.version_id = f.version_id \
         ) AS file_rows"
    ))
}

fn build_directory_query(
    scope: &ScanScope,
    id_pushdown: Option<&str>,
    catalog: &CatalogSnapshot,
) -> Result<String, PlannerError> {
    let (dirs, dir_paths) = directory_ctes(scope, catalog)?;
    let id_filter = id_pushdown
        .map(|value| format!(" WHERE d.id = {value}"))
        .unwrap_or_default();
    Ok(format!(
        "SELECT id, parent_id, name, path, version_id, inherited_from_version_id, created_at, \
         updated_at \
         FROM ( \
           WITH RECURSIVE dirs AS ({dirs}), \
           dir_paths(version_id, id, path) AS ({dir_paths}) \
           SELECT d.id AS id, d.parent_id AS parent_id, d.name AS name, dp.path AS path, \
                  d.version_id AS version_id, \
                  d.inherited_from_version_id AS inherited_from_version_id, \
                  d.created_at AS created_at, d.updated_at AS updated_at \
           FROM dirs d \
           JOIN dir_paths dp ON dp.id = d.id AND dp.version_id = d.version_id\
           {id_filter} \
         ) AS directory_rows"
    ))
}

fn build_version_query(catalog: &CatalogSnapshot) -> Result<String, PlannerError> {
    let scope = ScanScope::VersionValues(vec![format!("'{GLOBAL_VERSION_ID}'")]);

    let mut descriptor_pushdown = StatePushdown::default();
    descriptor_pushdown.schema_key_literal = Some(VERSION_DESCRIPTOR_SCHEMA_KEY.to_string());
    descriptor_pushdown
        .source
        .push(format!("s.schema_key = '{VERSION_DESCRIPTOR_SCHEMA_KEY}'"));
    let descriptor_scan =
        build_effective_state_query(&scope, &descriptor_pushdown, ScanProjection::Full, catalog)?;

    let mut tip_pushdown = StatePushdown::default();
    tip_pushdown.schema_key_literal = Some(VERSION_TIP_SCHEMA_KEY.to_string());
    tip_pushdown
        .source
        .push(format!("s.schema_key = '{VERSION_TIP_SCHEMA_KEY}'"));
    let tip_scan =
        build_effective_state_query(&scope, &tip_pushdown, ScanProjection::Full, catalog)?;

    let id_expr = json_text_extract_expr(catalog.dialect, "id")
        .replace("snapshot_content", "d.snapshot_content");
    let name_expr = json_text_extract_expr(catalog.dialect, "name")
        .replace("snapshot_content", "d.snapshot_content");
    let inherits_expr = json_text_extract_expr(catalog.dialect, "inherits_from_version_id")
        .replace("snapshot_content", "d.snapshot_content");
    let commit_expr = json_text_extract_expr(catalog.dialect, "commit_id")
        .replace("snapshot_content", "t.snapshot_content");

    Ok(format!(
        "SELECT id, name, inherits_from_version_id, commit_id, created_at, updated_at \
         FROM ( \
           SELECT {id_expr} AS id, \
                  {name_expr} AS name, \
                  {inherits_expr} AS inherits_from_version_id, \
                  {commit_expr} AS commit_id, \
                  d.created_at AS created_at, \
                  d.updated_at AS updated_at \
           FROM ({descriptor_scan}) AS d \
           LEFT JOIN ({tip_scan}) AS t ON t.entity_id = d.entity_id \
         ) AS version_rows"
    ))
}

fn build_active_version_query(dialect: SqlDialect) -> String {
    let version_id_expr = json_text_extract_expr(dialect, "version_id");
    format!(
        "SELECT version_id FROM ( \
           SELECT {version_id_expr} AS version_id FROM {UNTRACKED_TABLE} \
           WHERE schema_key = '{ACTIVE_VERSION_SCHEMA_KEY}' \
             AND entity_id = '{ACTIVE_VERSION_ENTITY_ID}' \
             AND version_id = '{ACTIVE_VERSION_STORAGE_VERSION_ID}' \
             AND snapshot_content IS NOT NULL \
           ORDER BY updated_at DESC LIMIT 1 \
         ) AS active_version"
    )
}

fn hidden_flag_expr(dialect: SqlDialect) -> String {
    match dialect {
        SqlDialect::Sqlite => {
            "COALESCE(json_extract(snapshot_content, '$.hidden'), 0)".to_string()
        }
        SqlDialect::Postgres => {
            "CASE WHEN (snapshot_content::jsonb ->> 'hidden') = 'true' THEN 1 ELSE 0 END"
                .to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{rewrite_filesystem_query, CatalogSnapshot};
    use crate::sql::contracts::VersionScope;
    use crate::{SqlDialect, Value};
    use sqlparser::ast::Statement;
    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;
    use std::collections::BTreeSet;

    fn catalog() -> CatalogSnapshot {
        let mut keys = BTreeSet::new();
        keys.insert("lix_file_descriptor".to_string());
        keys.insert("lix_directory_descriptor".to_string());
        keys.insert("lix_version_descriptor".to_string());
        keys.insert("lix_version_tip".to_string());
        CatalogSnapshot {
            dialect: SqlDialect::Sqlite,
            registered_schema_keys: keys,
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
    fn file_query_composes_paths_and_joins_the_data_cache() {
        let query = parse_query("SELECT path, data FROM lix_file WHERE path = '/docs/readme.md'");
        let rewrite = rewrite_filesystem_query(&query, &[], &catalog())
            .expect("rewrite should succeed")
            .expect("file surface should match");
        let sql = rewrite.query.to_string();
        assert!(sql.contains("dir_paths"));
        assert!(sql.contains("lix_internal_file_data_cache"));
        // Path predicates stay in the outer WHERE over the exposed column.
        assert!(sql.contains("path = '/docs/readme.md'"));

        let requirement = rewrite.file_data.expect("data projection needs bytes");
        assert_eq!(requirement.path_equals.as_deref(), Some("/docs/readme.md"));
        assert_eq!(requirement.version, VersionScope::Active);
    }

    #[test]
    fn projection_without_data_skips_byte_materialization() {
        let query = parse_query("SELECT path FROM lix_file");
        let rewrite = rewrite_filesystem_query(&query, &[], &catalog())
            .expect("rewrite should succeed")
            .expect("file surface should match");
        assert!(rewrite.file_data.is_none());
    }

    #[test]
    fn placeholder_path_is_resolved_for_the_requirement_but_kept_in_sql() {
        let query = parse_query("SELECT data FROM lix_file WHERE path = ?1");
        let rewrite = rewrite_filesystem_query(
            &query,
            &[Value::Text("/a.json".to_string())],
            &catalog(),
        )
        .expect("rewrite should succeed")
        .expect("file surface should match");
        let requirement = rewrite.file_data.expect("requirement");
        assert_eq!(requirement.path_equals.as_deref(), Some("/a.json"));
        assert!(rewrite.query.to_string().contains("?1"));
    }

    #[test]
    fn by_version_scope_is_consumed_from_the_where_clause() {
        let query = parse_query(
            "SELECT path FROM lix_file_by_version WHERE version_id = 'v1' AND name = 'readme'",
        );
        let rewrite = rewrite_filesystem_query(&query, &[], &catalog())
            .expect("rewrite should succeed")
            .expect("file surface should match");
        let sql = rewrite.query.to_string();
        assert!(sql.contains("VALUES ('v1')"));
        assert!(!sql.contains("version_id = 'v1' AND"));
        assert!(sql.contains("name = 'readme'"));
    }

    #[test]
    fn directory_view_exposes_composed_paths() {
        let query = parse_query("SELECT path FROM lix_directory");
        let rewrite = rewrite_filesystem_query(&query, &[], &catalog())
            .expect("rewrite should succeed")
            .expect("directory surface should match");
        let sql = rewrite.query.to_string();
        assert!(sql.contains("dir_paths"));
        assert!(sql.contains("lix_directory_descriptor"));
    }

    #[test]
    fn version_view_joins_descriptors_with_tips() {
        let query = parse_query("SELECT id, commit_id FROM lix_version");
        let rewrite = rewrite_filesystem_query(&query, &[], &catalog())
            .expect("rewrite should succeed")
            .expect("version surface should match");
        let sql = rewrite.query.to_string();
        assert!(sql.contains("lix_version_descriptor"));
        assert!(sql.contains("lix_version_tip"));
    }

    #[test]
    fn active_version_reads_the_untracked_singleton() {
        let query = parse_query("SELECT version_id FROM lix_active_version");
        let rewrite = rewrite_filesystem_query(&query, &[], &catalog())
            .expect("rewrite should succeed")
            .expect("active version surface should match");
        let sql = rewrite.query.to_string();
        assert!(sql.contains("lix_internal_state_untracked"));
        assert!(sql.contains("lix_active_version"));
    }
}
