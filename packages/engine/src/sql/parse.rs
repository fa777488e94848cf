use std::ops::ControlFlow;

use sqlparser::ast::{
    visit_expressions_mut, Expr, FunctionArguments, Statement, Value as AstValue, ValueWithSpan,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::functions::FunctionProvider;
use crate::LixError;

pub(crate) fn parse_sql_statements(sql: &str) -> Result<Vec<Statement>, LixError> {
    Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|error| LixError::parse(error.to_string()))
}

pub(crate) fn is_query_statement(statement: &Statement) -> bool {
    matches!(statement, Statement::Query(_))
}

/// Rewrites every bare `?` placeholder into its explicit `?N` form, numbered
/// in source order across the whole script. Explicit `?N`/`$N` tokens advance
/// the counter like the binder does, so mixing forms stays consistent.
/// Rewrites must renumber nothing after this point: moving a normalized
/// placeholder between statements cannot change which host parameter it
/// names.
pub(crate) fn normalize_placeholders(statements: &mut [Statement]) -> Result<usize, LixError> {
    let mut next_ordinal = 0usize;
    let mut failure: Option<LixError> = None;

    for statement in statements.iter_mut() {
        let _ = visit_expressions_mut(statement, |expr: &mut Expr| {
            if let Expr::Value(ValueWithSpan {
                value: AstValue::Placeholder(token),
                ..
            }) = expr
            {
                if token == "?" {
                    next_ordinal += 1;
                    *token = format!("?{next_ordinal}");
                } else if let Some(numeric) = token
                    .strip_prefix('?')
                    .or_else(|| token.strip_prefix('$'))
                {
                    match numeric.parse::<usize>() {
                        Ok(index) if index > 0 => {
                            next_ordinal = next_ordinal.max(index);
                        }
                        _ => {
                            failure = Some(LixError::parse(format!(
                                "invalid SQL placeholder '{token}'"
                            )));
                            return ControlFlow::Break(());
                        }
                    }
                }
            }
            ControlFlow::<()>::Continue(())
        });
        if let Some(error) = failure.take() {
            return Err(error);
        }
    }

    Ok(next_ordinal)
}

/// Replaces inline `lix_uuid_v7()` / `lix_timestamp()` calls with literals
/// minted by the provider, so deterministic mode covers SQL-level generation
/// the same way it covers CEL defaults.
pub(crate) fn inline_runtime_functions<P: FunctionProvider>(
    statements: &mut [Statement],
    provider: &mut P,
) {
    for statement in statements.iter_mut() {
        let _ = visit_expressions_mut(statement, |expr: &mut Expr| {
            if let Expr::Function(function) = expr {
                let name = function
                    .name
                    .0
                    .last()
                    .map(|part| part.to_string().to_ascii_lowercase())
                    .unwrap_or_default();
                let has_no_args = match &function.args {
                    FunctionArguments::None => true,
                    FunctionArguments::List(list) => list.args.is_empty(),
                    FunctionArguments::Subquery(_) => false,
                };
                if has_no_args {
                    let replacement = match name.as_str() {
                        "lix_uuid_v7" => Some(provider.uuid_v7()),
                        "lix_timestamp" => Some(provider.timestamp()),
                        _ => None,
                    };
                    if let Some(text) = replacement {
                        *expr = Expr::Value(AstValue::SingleQuotedString(text).into());
                    }
                }
            }
            ControlFlow::<()>::Continue(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::{inline_runtime_functions, normalize_placeholders, parse_sql_statements};
    use crate::functions::SystemFunctionProvider;

    #[test]
    fn normalizes_bare_placeholders_in_source_order() {
        let mut statements =
            parse_sql_statements("SELECT * FROM t WHERE a = ? AND b = ? AND c = ?").unwrap();
        let count = normalize_placeholders(&mut statements).unwrap();
        assert_eq!(count, 3);
        let sql = statements[0].to_string();
        assert!(sql.contains("a = ?1"));
        assert!(sql.contains("b = ?2"));
        assert!(sql.contains("c = ?3"));
    }

    #[test]
    fn explicit_indices_advance_the_counter() {
        let mut statements =
            parse_sql_statements("SELECT * FROM t WHERE a = ?3 AND b = ?").unwrap();
        normalize_placeholders(&mut statements).unwrap();
        let sql = statements[0].to_string();
        assert!(sql.contains("a = ?3"));
        assert!(sql.contains("b = ?4"));
    }

    #[test]
    fn normalization_spans_script_statements() {
        let mut statements = parse_sql_statements(
            "INSERT INTO t (a) VALUES (?); SELECT * FROM t WHERE a = ?",
        )
        .unwrap();
        normalize_placeholders(&mut statements).unwrap();
        assert!(statements[0].to_string().contains("?1"));
        assert!(statements[1].to_string().contains("?2"));
    }

    #[test]
    fn rejects_zero_indexed_placeholders() {
        let mut statements = parse_sql_statements("SELECT * FROM t WHERE a = ?0").unwrap();
        assert!(normalize_placeholders(&mut statements).is_err());
    }

    #[test]
    fn inlines_lix_functions_as_literals() {
        let mut statements =
            parse_sql_statements("SELECT lix_uuid_v7(), lix_timestamp(), count(*) FROM t").unwrap();
        inline_runtime_functions(&mut statements, &mut SystemFunctionProvider);
        let sql = statements[0].to_string();
        assert!(!sql.to_lowercase().contains("lix_uuid_v7"));
        assert!(!sql.to_lowercase().contains("lix_timestamp"));
        assert!(sql.to_lowercase().contains("count(*)"));
    }
}
