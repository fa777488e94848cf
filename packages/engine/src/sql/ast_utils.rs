use sqlparser::ast::{
    BinaryOperator, Expr, Ident, ObjectName, ObjectNamePart, Query, Statement, TableAlias,
    Value as AstValue, ValueWithSpan,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::LixError;

pub(crate) fn object_name_matches(name: &ObjectName, target: &str) -> bool {
    name.0
        .last()
        .and_then(ObjectNamePart::as_ident)
        .map(|ident| ident.value.eq_ignore_ascii_case(target))
        .unwrap_or(false)
}

pub(crate) fn default_alias(name: &str) -> TableAlias {
    TableAlias {
        explicit: false,
        name: Ident::new(name),
        columns: Vec::new(),
    }
}

pub(crate) fn parse_single_query(sql: &str) -> Result<Query, LixError> {
    let mut statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|error| LixError::planner_invariant(format!("lowered SQL failed to parse: {error}")))?;
    if statements.len() != 1 {
        return Err(LixError::planner_invariant(
            "lowered SQL must contain a single SELECT statement",
        ));
    }
    match statements.remove(0) {
        Statement::Query(query) => Ok(*query),
        _ => Err(LixError::planner_invariant(
            "lowered SQL must be a SELECT statement",
        )),
    }
}

pub(crate) fn split_conjunction(expr: Expr) -> Vec<Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut out = split_conjunction(*left);
            out.extend(split_conjunction(*right));
            out
        }
        other => vec![other],
    }
}

pub(crate) fn join_conjunction(mut predicates: Vec<Expr>) -> Option<Expr> {
    if predicates.is_empty() {
        return None;
    }
    let mut current = predicates.remove(0);
    for predicate in predicates {
        current = Expr::BinaryOp {
            left: Box::new(current),
            op: BinaryOperator::And,
            right: Box::new(predicate),
        };
    }
    Some(current)
}

/// Extracts `column = <value>` from a predicate when the column side belongs
/// to `relation_name` (or is unqualified and that is allowed). Returns the
/// normalized column name plus the value side rendered as SQL.
pub(crate) fn extract_equality(
    predicate: &Expr,
    relation_name: &str,
    allow_unqualified: bool,
) -> Option<(String, String)> {
    let Expr::BinaryOp {
        left,
        op: BinaryOperator::Eq,
        right,
    } = predicate
    else {
        return None;
    };

    if let Some(column) = extract_column(left, relation_name, allow_unqualified) {
        return Some((column, right.to_string()));
    }
    if let Some(column) = extract_column(right, relation_name, allow_unqualified) {
        return Some((column, left.to_string()));
    }
    None
}

pub(crate) fn extract_column(
    expr: &Expr,
    relation_name: &str,
    allow_unqualified: bool,
) -> Option<String> {
    match expr {
        Expr::Identifier(ident) if allow_unqualified => Some(ident.value.to_ascii_lowercase()),
        Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
            let qualifier = &parts[parts.len() - 2].value;
            if !qualifier.eq_ignore_ascii_case(relation_name) {
                return None;
            }
            Some(parts[parts.len() - 1].value.to_ascii_lowercase())
        }
        Expr::Nested(inner) => extract_column(inner, relation_name, allow_unqualified),
        _ => None,
    }
}

/// Reads a literal string out of an expression, or `None` when the value is
/// dynamic (a placeholder, function call, ...).
pub(crate) fn literal_text(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Value(ValueWithSpan {
            value: AstValue::SingleQuotedString(text),
            ..
        }) => Some(text.clone()),
        Expr::Nested(inner) => literal_text(inner),
        _ => None,
    }
}

pub(crate) fn placeholder_token(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Value(ValueWithSpan {
            value: AstValue::Placeholder(token),
            ..
        }) => Some(token.clone()),
        Expr::Nested(inner) => placeholder_token(inner),
        _ => None,
    }
}

pub(crate) fn is_null_literal(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Value(ValueWithSpan {
            value: AstValue::Null,
            ..
        })
    )
}

pub(crate) fn string_expr(value: &str) -> Expr {
    Expr::Value(AstValue::SingleQuotedString(value.to_string()).into())
}
