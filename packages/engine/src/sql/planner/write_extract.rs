use std::ops::ControlFlow;

use serde_json::Value as JsonValue;
use sqlparser::ast::{
    visit_expressions_mut, Assignment, AssignmentTarget, Delete, Expr, FromTable, Insert,
    ObjectName, SetExpr, Statement, TableFactor, TableObject, TableWithJoins, Update,
    Value as AstValue, ValueWithSpan,
};

use crate::schema_registry::VTABLE_VIEW;
use crate::sql::ast_utils::{
    extract_equality, is_null_literal, join_conjunction, literal_text, object_name_matches,
    placeholder_token, split_conjunction, string_expr,
};
use crate::sql::contracts::{
    DirectoryInsertRow, DirectoryMutation, FileFilter, FileInsertRow, FileMutation,
    MutationOperation, MutationPlan, PlannerError, StateInsertRow, StateMutation,
    VersionInsertRow, VersionScope,
};
use crate::sql::params::{resolve_placeholder_index, PlaceholderState};
use crate::sql::planner::file_read::{
    ACTIVE_VERSION_VIEW, DIRECTORY_VIEW, FILE_BY_VERSION_VIEW, FILE_VIEW, VERSION_VIEW,
};
use crate::sql::planner::state_read::{
    ENTITY_BY_VERSION_VIEW, ENTITY_VIEW, STATE_BY_VERSION_VIEW, STATE_VIEW,
};
use crate::Value;

/// Extracts a typed mutation plan from an INSERT/UPDATE/DELETE against a
/// writable surface. Returns `None` for statements that target no engine
/// surface (they pass through to the backend untouched).
///
/// Host placeholders inside the statement are resolved against `params`
/// here, exactly once; the resulting plan carries only concrete values.
pub(crate) fn extract_mutation(
    statement: &Statement,
    params: &[Value],
) -> Result<Option<MutationPlan>, PlannerError> {
    match statement {
        Statement::Insert(insert) => extract_insert(insert, params),
        Statement::Update(update) => extract_update(update, params),
        Statement::Delete(delete) => extract_delete(delete, params),
        _ => Ok(None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteSurface {
    Vtable,
    State,
    StateByVersion,
    File,
    FileByVersion,
    Directory,
    Version,
    ActiveVersion,
}

fn write_surface(name: &ObjectName) -> Option<WriteSurface> {
    if object_name_matches(name, VTABLE_VIEW) {
        Some(WriteSurface::Vtable)
    } else if object_name_matches(name, STATE_BY_VERSION_VIEW)
        || object_name_matches(name, ENTITY_BY_VERSION_VIEW)
    {
        Some(WriteSurface::StateByVersion)
    } else if object_name_matches(name, STATE_VIEW) || object_name_matches(name, ENTITY_VIEW) {
        Some(WriteSurface::State)
    } else if object_name_matches(name, FILE_BY_VERSION_VIEW) {
        Some(WriteSurface::FileByVersion)
    } else if object_name_matches(name, FILE_VIEW) {
        Some(WriteSurface::File)
    } else if object_name_matches(name, DIRECTORY_VIEW) {
        Some(WriteSurface::Directory)
    } else if object_name_matches(name, VERSION_VIEW) {
        Some(WriteSurface::Version)
    } else if object_name_matches(name, ACTIVE_VERSION_VIEW) {
        Some(WriteSurface::ActiveVersion)
    } else {
        None
    }
}

fn insert_surface(insert: &Insert) -> Option<WriteSurface> {
    match &insert.table {
        TableObject::TableName(name) => write_surface(name),
        _ => None,
    }
}

fn table_with_joins_surface(table: &TableWithJoins) -> Option<WriteSurface> {
    match &table.relation {
        TableFactor::Table { name, .. } if table.joins.is_empty() => write_surface(name),
        _ => None,
    }
}

fn delete_surface(delete: &Delete) -> Option<WriteSurface> {
    let tables = match &delete.from {
        FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
    };
    if tables.len() != 1 {
        return None;
    }
    table_with_joins_surface(&tables[0])
}

fn extract_insert(
    insert: &Insert,
    params: &[Value],
) -> Result<Option<MutationPlan>, PlannerError> {
    let Some(surface) = insert_surface(insert) else {
        return Ok(None);
    };

    if insert.on.is_some() {
        return Err(PlannerError::unsupported(
            "ON CONFLICT is not supported on engine surfaces",
        ));
    }
    if insert.columns.is_empty() {
        return Err(PlannerError::unsupported(
            "inserts into engine surfaces require an explicit column list",
        ));
    }
    let source = insert.source.as_ref().ok_or_else(|| {
        PlannerError::unsupported("inserts into engine surfaces require a VALUES source")
    })?;
    let SetExpr::Values(values) = source.body.as_ref() else {
        return Err(PlannerError::unsupported(
            "inserts into engine surfaces require VALUES rows",
        ));
    };

    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|ident| ident.value.to_ascii_lowercase())
        .collect();

    match surface {
        WriteSurface::Vtable | WriteSurface::State | WriteSurface::StateByVersion => {
            let require_version = matches!(surface, WriteSurface::StateByVersion);
            let mut rows = Vec::with_capacity(values.rows.len());
            for row in &values.rows {
                rows.push(extract_state_insert_row(&columns, row, params, require_version)?);
            }
            Ok(Some(MutationPlan::State(StateMutation {
                operation: MutationOperation::Insert,
                scope: VersionScope::Active,
                rows,
                filter: None,
                assignments: Vec::new(),
                untracked_filter: None,
            })))
        }
        WriteSurface::File | WriteSurface::FileByVersion => {
            let require_version = matches!(surface, WriteSurface::FileByVersion);
            let mut rows = Vec::with_capacity(values.rows.len());
            for row in &values.rows {
                rows.push(extract_file_insert_row(&columns, row, params, require_version)?);
            }
            Ok(Some(MutationPlan::File(FileMutation::Insert { rows })))
        }
        WriteSurface::Directory => {
            let mut rows = Vec::with_capacity(values.rows.len());
            for row in &values.rows {
                rows.push(extract_directory_insert_row(&columns, row, params)?);
            }
            Ok(Some(MutationPlan::Directory(DirectoryMutation::Insert {
                rows,
            })))
        }
        WriteSurface::Version => {
            let mut rows = Vec::with_capacity(values.rows.len());
            for row in &values.rows {
                rows.push(extract_version_insert_row(&columns, row, params)?);
            }
            Ok(Some(MutationPlan::VersionInsert { rows }))
        }
        WriteSurface::ActiveVersion => Err(PlannerError::unsupported(
            "lix_active_version only supports UPDATE",
        )),
    }
}

fn extract_update(
    update: &Update,
    params: &[Value],
) -> Result<Option<MutationPlan>, PlannerError> {
    let Some(surface) = table_with_joins_surface(&update.table) else {
        return Ok(None);
    };

    if update.from.is_some() {
        return Err(PlannerError::unsupported(
            "UPDATE ... FROM is not supported on engine surfaces",
        ));
    }
    if update.returning.is_some() {
        return Err(PlannerError::unsupported(
            "RETURNING is not supported on engine surfaces",
        ));
    }

    match surface {
        WriteSurface::ActiveVersion => {
            let version_id = active_version_assignment(&update.assignments, params)?;
            Ok(Some(MutationPlan::ActiveVersionUpdate { version_id }))
        }
        WriteSurface::Vtable | WriteSurface::State | WriteSurface::StateByVersion => {
            let selection = update.selection.as_ref().ok_or_else(|| {
                PlannerError::unsupported("UPDATE on state surfaces requires a WHERE clause")
            })?;
            let relation = update_relation_name(update, surface);
            let (scope, untracked_filter, filter) =
                extract_state_write_scope(selection, &relation, params, surface)?;

            let mut assignments = Vec::new();
            for assignment in &update.assignments {
                let column = assignment_column(&assignment.target)?;
                let value = match column.as_str() {
                    "entity_id" | "schema_key" | "version_id" | "file_id" => {
                        return Err(PlannerError::unsupported(format!(
                            "column '{column}' is immutable on state surfaces"
                        )));
                    }
                    "snapshot_content" | "metadata" => {
                        resolve_json_value(&assignment.value, params)?
                    }
                    "plugin_key" => {
                        JsonValue::String(resolve_text(&assignment.value, params, "plugin_key")?)
                    }
                    "untracked" => JsonValue::Bool(resolve_bool(&assignment.value, params)?),
                    other => {
                        return Err(PlannerError::unsupported(format!(
                            "column '{other}' cannot be assigned on state surfaces"
                        )));
                    }
                };
                assignments.push((column, value));
            }

            Ok(Some(MutationPlan::State(StateMutation {
                operation: MutationOperation::Update,
                scope,
                rows: Vec::new(),
                filter,
                assignments,
                untracked_filter,
            })))
        }
        WriteSurface::File | WriteSurface::FileByVersion => {
            let selection = update.selection.as_ref().ok_or_else(|| {
                PlannerError::unsupported("UPDATE on lix_file requires a WHERE clause")
            })?;
            let relation = update_relation_name(update, surface);
            let require_version = matches!(surface, WriteSurface::FileByVersion);
            let (scope, filter) =
                extract_file_filter(selection, &relation, params, require_version)?;

            let mut set_path = None;
            let mut set_data = None;
            let mut set_metadata = None;
            let mut set_hidden = None;
            for assignment in &update.assignments {
                let column = assignment_column(&assignment.target)?;
                match column.as_str() {
                    "path" => {
                        set_path = Some(resolve_text(&assignment.value, params, "path")?);
                    }
                    "data" => {
                        set_data = Some(resolve_bytes(&assignment.value, params)?);
                    }
                    "metadata" => {
                        let value = resolve_json_value(&assignment.value, params)?;
                        set_metadata = Some(if value.is_null() { None } else { Some(value) });
                    }
                    "hidden" => {
                        set_hidden = Some(resolve_bool(&assignment.value, params)?);
                    }
                    other => {
                        return Err(PlannerError::unsupported(format!(
                            "column '{other}' cannot be assigned on lix_file"
                        )));
                    }
                }
            }

            Ok(Some(MutationPlan::File(FileMutation::Update {
                scope,
                filter,
                set_path,
                set_data,
                set_metadata,
                set_hidden,
            })))
        }
        WriteSurface::Directory | WriteSurface::Version => Err(PlannerError::unsupported(
            "UPDATE is not supported on this surface",
        )),
    }
}

fn extract_delete(
    delete: &Delete,
    params: &[Value],
) -> Result<Option<MutationPlan>, PlannerError> {
    let Some(surface) = delete_surface(delete) else {
        return Ok(None);
    };

    if delete.using.is_some() {
        return Err(PlannerError::unsupported(
            "DELETE ... USING is not supported on engine surfaces",
        ));
    }
    if delete.returning.is_some() {
        return Err(PlannerError::unsupported(
            "RETURNING is not supported on engine surfaces",
        ));
    }

    let selection = delete.selection.as_ref().ok_or_else(|| {
        PlannerError::unsupported("DELETE on engine surfaces requires a WHERE clause")
    })?;
    let relation = delete_relation_name(delete, surface);

    match surface {
        WriteSurface::Vtable | WriteSurface::State | WriteSurface::StateByVersion => {
            let (scope, untracked_filter, filter) =
                extract_state_write_scope(selection, &relation, params, surface)?;
            Ok(Some(MutationPlan::State(StateMutation {
                operation: MutationOperation::Delete,
                scope,
                rows: Vec::new(),
                filter,
                assignments: Vec::new(),
                untracked_filter,
            })))
        }
        WriteSurface::File | WriteSurface::FileByVersion => {
            let require_version = matches!(surface, WriteSurface::FileByVersion);
            let (scope, filter) =
                extract_file_filter(selection, &relation, params, require_version)?;
            Ok(Some(MutationPlan::File(FileMutation::Delete { scope, filter })))
        }
        WriteSurface::Directory => {
            let (scope, filter) = extract_file_filter(selection, &relation, params, false)?;
            Ok(Some(MutationPlan::Directory(DirectoryMutation::Delete {
                scope,
                filter,
            })))
        }
        WriteSurface::Version | WriteSurface::ActiveVersion => Err(PlannerError::unsupported(
            "DELETE is not supported on this surface",
        )),
    }
}

fn update_relation_name(update: &Update, surface: WriteSurface) -> String {
    match &update.table.relation {
        TableFactor::Table {
            alias: Some(alias), ..
        } => alias.name.value.clone(),
        _ => surface_view_name(surface).to_string(),
    }
}

fn delete_relation_name(delete: &Delete, surface: WriteSurface) -> String {
    let tables = match &delete.from {
        FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
    };
    match tables.first().map(|table| &table.relation) {
        Some(TableFactor::Table {
            alias: Some(alias), ..
        }) => alias.name.value.clone(),
        _ => surface_view_name(surface).to_string(),
    }
}

fn surface_view_name(surface: WriteSurface) -> &'static str {
    match surface {
        WriteSurface::Vtable => VTABLE_VIEW,
        WriteSurface::State => STATE_VIEW,
        WriteSurface::StateByVersion => STATE_BY_VERSION_VIEW,
        WriteSurface::File => FILE_VIEW,
        WriteSurface::FileByVersion => FILE_BY_VERSION_VIEW,
        WriteSurface::Directory => DIRECTORY_VIEW,
        WriteSurface::Version => VERSION_VIEW,
        WriteSurface::ActiveVersion => ACTIVE_VERSION_VIEW,
    }
}

/// Splits a state-surface WHERE clause into version scope, the untracked
/// flag, and the residual filter rendered over the effective-state
/// projection with placeholders substituted.
fn extract_state_write_scope(
    selection: &Expr,
    relation_name: &str,
    params: &[Value],
    surface: WriteSurface,
) -> Result<(VersionScope, Option<bool>, Option<String>), PlannerError> {
    let mut scope = VersionScope::Active;
    let mut untracked_filter = None;
    let mut remaining = Vec::new();

    for predicate in split_conjunction(selection.clone()) {
        if let Some((column, _)) = extract_equality(&predicate, relation_name, true) {
            if column == "version_id"
                && matches!(surface, WriteSurface::StateByVersion | WriteSurface::Vtable)
            {
                let value = resolve_text(equality_value(&predicate)?, params, "version_id")?;
                scope = VersionScope::Versions(vec![value]);
                continue;
            }
            if column == "untracked" {
                let value = resolve_bool(equality_value(&predicate)?, params)?;
                untracked_filter = Some(value);
                continue;
            }
        }
        remaining.push(predicate);
    }

    if matches!(surface, WriteSurface::StateByVersion) && scope == VersionScope::Active {
        return Err(PlannerError::unsupported(
            "writes to lix_state_by_version require an explicit version_id",
        ));
    }

    let filter = match join_conjunction(remaining) {
        Some(expr) => Some(render_filter(expr, params)?),
        None => None,
    };
    Ok((scope, untracked_filter, filter))
}

fn extract_file_filter(
    selection: &Expr,
    relation_name: &str,
    params: &[Value],
    require_version: bool,
) -> Result<(VersionScope, FileFilter), PlannerError> {
    let mut scope = VersionScope::Active;
    let mut filter = FileFilter::default();

    for predicate in split_conjunction(selection.clone()) {
        if let Some((column, _)) = extract_equality(&predicate, relation_name, true) {
            let value_expr = equality_value(&predicate)?;
            match column.as_str() {
                "id" => {
                    filter.id_in = Some(vec![resolve_text(value_expr, params, "id")?]);
                    continue;
                }
                "path" => {
                    filter.path_in = Some(vec![resolve_text(value_expr, params, "path")?]);
                    continue;
                }
                "version_id" => {
                    scope =
                        VersionScope::Versions(vec![resolve_text(value_expr, params, "version_id")?]);
                    continue;
                }
                _ => {}
            }
        }
        if let Expr::InList {
            expr,
            list,
            negated: false,
        } = &predicate
        {
            let column = crate::sql::ast_utils::extract_column(expr, relation_name, true);
            if let Some(column) = column {
                if column == "id" || column == "path" {
                    let mut values = Vec::with_capacity(list.len());
                    for item in list {
                        values.push(resolve_text(item, params, &column)?);
                    }
                    if column == "id" {
                        filter.id_in = Some(values);
                    } else {
                        filter.path_in = Some(values);
                    }
                    continue;
                }
            }
        }
        return Err(PlannerError::unsupported(format!(
            "unsupported filesystem write predicate: {predicate}"
        )));
    }

    if require_version && scope == VersionScope::Active {
        return Err(PlannerError::unsupported(
            "writes to lix_file_by_version require an explicit version_id",
        ));
    }
    if filter.is_empty() {
        return Err(PlannerError::unsupported(
            "filesystem writes require an id or path filter",
        ));
    }
    Ok((scope, filter))
}

fn extract_state_insert_row(
    columns: &[String],
    row: &[Expr],
    params: &[Value],
    require_version: bool,
) -> Result<StateInsertRow, PlannerError> {
    let mut out = StateInsertRow {
        entity_id: None,
        schema_key: String::new(),
        schema_version: None,
        file_id: None,
        version_id: None,
        plugin_key: None,
        snapshot_content: None,
        metadata: None,
        untracked: false,
    };

    for (index, column) in columns.iter().enumerate() {
        let expr = row.get(index).ok_or_else(|| {
            PlannerError::unsupported(format!("VALUES row is missing a value for '{column}'"))
        })?;
        match column.as_str() {
            "entity_id" => out.entity_id = Some(resolve_text(expr, params, column)?),
            "schema_key" => out.schema_key = resolve_text(expr, params, column)?,
            "schema_version" => out.schema_version = Some(resolve_text(expr, params, column)?),
            "file_id" => out.file_id = Some(resolve_text(expr, params, column)?),
            "version_id" => out.version_id = Some(resolve_text(expr, params, column)?),
            "plugin_key" => out.plugin_key = Some(resolve_text(expr, params, column)?),
            "snapshot_content" => {
                let value = resolve_json_value(expr, params)?;
                out.snapshot_content = if value.is_null() { None } else { Some(value) };
            }
            "metadata" => {
                let value = resolve_json_value(expr, params)?;
                out.metadata = if value.is_null() { None } else { Some(value) };
            }
            "untracked" => out.untracked = resolve_bool(expr, params)?,
            other => {
                return Err(PlannerError::unsupported(format!(
                    "unknown column '{other}' in state insert"
                )));
            }
        }
    }

    if out.schema_key.is_empty() {
        return Err(PlannerError::unsupported(
            "state inserts require a schema_key",
        ));
    }
    if require_version && out.version_id.is_none() {
        return Err(PlannerError::unsupported(
            "writes to lix_state_by_version require an explicit version_id",
        ));
    }
    Ok(out)
}

fn extract_file_insert_row(
    columns: &[String],
    row: &[Expr],
    params: &[Value],
    require_version: bool,
) -> Result<FileInsertRow, PlannerError> {
    let mut out = FileInsertRow {
        id: None,
        path: String::new(),
        data: None,
        metadata: None,
        hidden: false,
        version_id: None,
        untracked: false,
    };

    for (index, column) in columns.iter().enumerate() {
        let expr = row.get(index).ok_or_else(|| {
            PlannerError::unsupported(format!("VALUES row is missing a value for '{column}'"))
        })?;
        match column.as_str() {
            "id" => out.id = Some(resolve_text(expr, params, column)?),
            "path" => out.path = resolve_text(expr, params, column)?,
            "data" => {
                out.data = if is_null_literal(expr) {
                    None
                } else {
                    Some(resolve_bytes(expr, params)?)
                };
            }
            "metadata" => {
                let value = resolve_json_value(expr, params)?;
                out.metadata = if value.is_null() { None } else { Some(value) };
            }
            "hidden" => out.hidden = resolve_bool(expr, params)?,
            "version_id" => out.version_id = Some(resolve_text(expr, params, column)?),
            "untracked" => out.untracked = resolve_bool(expr, params)?,
            other => {
                return Err(PlannerError::unsupported(format!(
                    "unknown column '{other}' in lix_file insert"
                )));
            }
        }
    }

    if out.path.is_empty() {
        return Err(PlannerError::unsupported("lix_file inserts require a path"));
    }
    if require_version && out.version_id.is_none() {
        return Err(PlannerError::unsupported(
            "writes to lix_file_by_version require an explicit version_id",
        ));
    }
    Ok(out)
}

fn extract_directory_insert_row(
    columns: &[String],
    row: &[Expr],
    params: &[Value],
) -> Result<DirectoryInsertRow, PlannerError> {
    let mut out = DirectoryInsertRow {
        id: None,
        path: String::new(),
        version_id: None,
    };
    for (index, column) in columns.iter().enumerate() {
        let expr = row.get(index).ok_or_else(|| {
            PlannerError::unsupported(format!("VALUES row is missing a value for '{column}'"))
        })?;
        match column.as_str() {
            "id" => out.id = Some(resolve_text(expr, params, column)?),
            "path" => out.path = resolve_text(expr, params, column)?,
            "version_id" => out.version_id = Some(resolve_text(expr, params, column)?),
            other => {
                return Err(PlannerError::unsupported(format!(
                    "unknown column '{other}' in lix_directory insert"
                )));
            }
        }
    }
    if out.path.is_empty() {
        return Err(PlannerError::unsupported(
            "lix_directory inserts require a path",
        ));
    }
    Ok(out)
}

fn extract_version_insert_row(
    columns: &[String],
    row: &[Expr],
    params: &[Value],
) -> Result<VersionInsertRow, PlannerError> {
    let mut out = VersionInsertRow {
        id: None,
        name: None,
        inherits_from_version_id: None,
    };
    for (index, column) in columns.iter().enumerate() {
        let expr = row.get(index).ok_or_else(|| {
            PlannerError::unsupported(format!("VALUES row is missing a value for '{column}'"))
        })?;
        match column.as_str() {
            "id" => out.id = Some(resolve_text(expr, params, column)?),
            "name" => out.name = Some(resolve_text(expr, params, column)?),
            "inherits_from_version_id" => {
                out.inherits_from_version_id = if is_null_literal(expr) {
                    None
                } else {
                    Some(resolve_text(expr, params, column)?)
                };
            }
            other => {
                return Err(PlannerError::unsupported(format!(
                    "unknown column '{other}' in lix_version insert"
                )));
            }
        }
    }
    Ok(out)
}

fn active_version_assignment(
    assignments: &[Assignment],
    params: &[Value],
) -> Result<String, PlannerError> {
    for assignment in assignments {
        let column = assignment_column(&assignment.target)?;
        if column == "version_id" {
            return resolve_text(&assignment.value, params, "version_id");
        }
    }
    Err(PlannerError::unsupported(
        "lix_active_version updates must assign version_id",
    ))
}

fn assignment_column(target: &AssignmentTarget) -> Result<String, PlannerError> {
    match target {
        AssignmentTarget::ColumnName(name) => name
            .0
            .last()
            .and_then(sqlparser::ast::ObjectNamePart::as_ident)
            .map(|ident| ident.value.to_ascii_lowercase())
            .ok_or_else(|| PlannerError::unsupported("unsupported assignment target")),
        AssignmentTarget::Tuple(_) => Err(PlannerError::unsupported(
            "tuple assignments are not supported",
        )),
    }
}

fn equality_value(predicate: &Expr) -> Result<&Expr, PlannerError> {
    let Expr::BinaryOp { left, right, .. } = predicate else {
        return Err(PlannerError::invariant(
            "equality predicate lost its comparison shape",
        ));
    };
    // The value operand is whichever side is not a plain column reference.
    let left_is_column = matches!(
        left.as_ref(),
        Expr::Identifier(_) | Expr::CompoundIdentifier(_)
    );
    if left_is_column {
        Ok(right)
    } else {
        Ok(left)
    }
}

/// Renders a residual WHERE clause for the effective-state expansion query:
/// qualifiers are stripped (the expansion has a single relation) and every
/// placeholder is replaced by its host value as a literal.
fn render_filter(mut expr: Expr, params: &[Value]) -> Result<String, PlannerError> {
    let mut failure: Option<PlannerError> = None;
    let _ = visit_expressions_mut(&mut expr, |node: &mut Expr| {
        match node {
            Expr::CompoundIdentifier(parts) => {
                if let Some(last) = parts.last() {
                    *node = Expr::Identifier(last.clone());
                }
            }
            Expr::Value(ValueWithSpan {
                value: AstValue::Placeholder(token),
                ..
            }) => {
                let token = token.clone();
                let mut state = PlaceholderState::new();
                match resolve_placeholder_index(&token, params.len(), &mut state) {
                    Ok(index) => match literal_expr_for_value(&params[index]) {
                        Ok(replacement) => *node = replacement,
                        Err(error) => {
                            failure = Some(error);
                            return ControlFlow::Break(());
                        }
                    },
                    Err(error) => {
                        failure = Some(error.into());
                        return ControlFlow::Break(());
                    }
                }
            }
            _ => {}
        }
        ControlFlow::<()>::Continue(())
    });
    if let Some(error) = failure {
        return Err(error);
    }
    Ok(expr.to_string())
}

fn literal_expr_for_value(value: &Value) -> Result<Expr, PlannerError> {
    Ok(match value {
        Value::Null => Expr::Value(AstValue::Null.into()),
        Value::Integer(v) => Expr::Value(AstValue::Number(v.to_string(), false).into()),
        Value::Real(v) => Expr::Value(AstValue::Number(v.to_string(), false).into()),
        Value::Text(v) => string_expr(v),
        Value::Blob(_) => {
            return Err(PlannerError::unsupported(
                "blob parameters cannot appear in state-write filters",
            ));
        }
    })
}

fn resolve_param<'a>(token: &str, params: &'a [Value]) -> Result<&'a Value, PlannerError> {
    let mut state = PlaceholderState::new();
    let index = resolve_placeholder_index(token, params.len(), &mut state)?;
    Ok(&params[index])
}

fn resolve_text(expr: &Expr, params: &[Value], column: &str) -> Result<String, PlannerError> {
    if let Some(text) = literal_text(expr) {
        return Ok(text);
    }
    if let Some(token) = placeholder_token(expr) {
        return match resolve_param(&token, params)? {
            Value::Text(text) => Ok(text.clone()),
            other => Err(PlannerError::unsupported(format!(
                "expected a text parameter for '{column}', got {other:?}"
            ))),
        };
    }
    Err(PlannerError::unsupported(format!(
        "expected a literal or parameter for '{column}', got {expr}"
    )))
}

fn resolve_bool(expr: &Expr, params: &[Value]) -> Result<bool, PlannerError> {
    match expr {
        Expr::Value(ValueWithSpan {
            value: AstValue::Boolean(flag),
            ..
        }) => Ok(*flag),
        Expr::Value(ValueWithSpan {
            value: AstValue::Number(number, _),
            ..
        }) => Ok(number != "0"),
        Expr::Value(ValueWithSpan {
            value: AstValue::Placeholder(token),
            ..
        }) => match resolve_param(token, params)? {
            Value::Integer(v) => Ok(*v != 0),
            Value::Text(v) => Ok(v == "true" || v == "1"),
            other => Err(PlannerError::unsupported(format!(
                "expected a boolean parameter, got {other:?}"
            ))),
        },
        Expr::Nested(inner) => resolve_bool(inner, params),
        other => Err(PlannerError::unsupported(format!(
            "expected a boolean literal, got {other}"
        ))),
    }
}

fn resolve_bytes(expr: &Expr, params: &[Value]) -> Result<Vec<u8>, PlannerError> {
    if let Some(text) = literal_text(expr) {
        return Ok(text.into_bytes());
    }
    if let Some(token) = placeholder_token(expr) {
        return match resolve_param(&token, params)? {
            Value::Blob(bytes) => Ok(bytes.clone()),
            Value::Text(text) => Ok(text.clone().into_bytes()),
            other => Err(PlannerError::unsupported(format!(
                "expected blob or text parameter for data, got {other:?}"
            ))),
        };
    }
    Err(PlannerError::unsupported(format!(
        "expected a literal or parameter for data, got {expr}"
    )))
}

/// Snapshot/metadata values: literal JSON text, NULL, or a parameter holding
/// JSON text.
fn resolve_json_value(expr: &Expr, params: &[Value]) -> Result<JsonValue, PlannerError> {
    if is_null_literal(expr) {
        return Ok(JsonValue::Null);
    }
    if let Some(text) = literal_text(expr) {
        return parse_json_text(&text);
    }
    if let Some(token) = placeholder_token(expr) {
        return match resolve_param(&token, params)? {
            Value::Null => Ok(JsonValue::Null),
            Value::Text(text) => parse_json_text(text),
            Value::Integer(v) => Ok(JsonValue::from(*v)),
            Value::Real(v) => Ok(serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null)),
            Value::Blob(_) => Err(PlannerError::unsupported(
                "blob parameters are not valid snapshot content",
            )),
        };
    }
    Err(PlannerError::unsupported(format!(
        "expected JSON text for snapshot_content, got {expr}"
    )))
}

fn parse_json_text(text: &str) -> Result<JsonValue, PlannerError> {
    serde_json::from_str(text).map_err(|error| {
        PlannerError::unsupported(format!("snapshot_content is not valid JSON: {error}"))
    })
}
