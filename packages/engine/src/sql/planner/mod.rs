pub(crate) mod file_read;
pub(crate) mod history_read;
pub(crate) mod state_read;
pub(crate) mod write_extract;

use std::collections::BTreeSet;

use sqlparser::ast::Statement;

use crate::sql::contracts::{
    ExecutionPlan, HistoryRequirements, PassthroughPlan, PlannerError, ReadPlan, StatementPlan,
};
use crate::sql::fingerprint::plan_fingerprint;
use crate::sql::parse::is_query_statement;
use crate::{SqlDialect, Value};

/// Everything the planner may know about the engine at plan time. Reads of
/// the active version happen inside the lowered SQL, so the snapshot stays
/// small and the planner stays pure.
#[derive(Debug, Clone)]
pub(crate) struct CatalogSnapshot {
    pub(crate) dialect: SqlDialect,
    pub(crate) registered_schema_keys: BTreeSet<String>,
}

/// Plans a parsed script: each statement is routed to exactly one surface
/// rewrite (history, filesystem, state) or extracted as a typed mutation;
/// anything else passes through untouched. The planner performs no I/O and
/// never calls a plugin.
pub(crate) fn plan_statements(
    statements: &[Statement],
    params: &[Value],
    catalog: &CatalogSnapshot,
) -> Result<ExecutionPlan, PlannerError> {
    let mut planned = Vec::with_capacity(statements.len());

    for statement in statements {
        planned.push(plan_statement(statement, params, catalog)?);
    }

    let fingerprint = {
        let parts: Vec<String> = planned
            .iter()
            .map(|statement| statement.fingerprint_text())
            .collect();
        plan_fingerprint(parts.iter().map(|part| part.as_str()))
    };

    let requires_transaction = planned.iter().any(|statement| match statement {
        StatementPlan::Mutation(_) => true,
        StatementPlan::Passthrough(plan) => !plan.is_query,
        StatementPlan::Read(plan) => !plan.history.is_empty() || plan.file_data.is_some(),
    }) || planned.len() > 1;

    Ok(ExecutionPlan {
        statements: planned,
        fingerprint,
        requires_transaction,
    })
}

fn plan_statement(
    statement: &Statement,
    params: &[Value],
    catalog: &CatalogSnapshot,
) -> Result<StatementPlan, PlannerError> {
    if let Statement::Query(query) = statement {
        if let Some(rewrite) = history_read::rewrite_history_query(query, params, catalog)? {
            // History surfaces may be joined against state surfaces; finish
            // the lowering before emitting.
            let lowered = match state_read::rewrite_query(&rewrite.query, catalog)? {
                Some(query) => query,
                None => rewrite.query,
            };
            return Ok(StatementPlan::Read(ReadPlan {
                sql: lowered.to_string(),
                history: rewrite.requirements,
                file_data: None,
            }));
        }

        if let Some(rewrite) = file_read::rewrite_filesystem_query(query, params, catalog)? {
            let lowered = match state_read::rewrite_query(&rewrite.query, catalog)? {
                Some(query) => query,
                None => rewrite.query,
            };
            return Ok(StatementPlan::Read(ReadPlan {
                sql: lowered.to_string(),
                history: HistoryRequirements::default(),
                file_data: rewrite.file_data,
            }));
        }

        if let Some(rewritten) = state_read::rewrite_query(query, catalog)? {
            return Ok(StatementPlan::Read(ReadPlan {
                sql: rewritten.to_string(),
                history: HistoryRequirements::default(),
                file_data: None,
            }));
        }

        return Ok(StatementPlan::Passthrough(PassthroughPlan {
            sql: statement.to_string(),
            is_query: true,
        }));
    }

    if let Some(mutation) = write_extract::extract_mutation(statement, params)? {
        return Ok(StatementPlan::Mutation(mutation));
    }

    Ok(StatementPlan::Passthrough(PassthroughPlan {
        sql: statement.to_string(),
        is_query: is_query_statement(statement),
    }))
}

#[cfg(test)]
mod tests {
    use super::{plan_statements, CatalogSnapshot};
    use crate::sql::contracts::StatementPlan;
    use crate::sql::parse::{normalize_placeholders, parse_sql_statements};
    use crate::SqlDialect;
    use std::collections::BTreeSet;

    fn catalog() -> CatalogSnapshot {
        CatalogSnapshot {
            dialect: SqlDialect::Sqlite,
            registered_schema_keys: BTreeSet::new(),
        }
    }

    fn plan(sql: &str) -> crate::sql::contracts::ExecutionPlan {
        let mut statements = parse_sql_statements(sql).expect("valid SQL");
        normalize_placeholders(&mut statements).expect("normalize");
        plan_statements(&statements, &[], &catalog()).expect("plan")
    }

    #[test]
    fn reads_of_plain_tables_pass_through_without_a_transaction() {
        let execution_plan = plan("SELECT 1");
        assert_eq!(execution_plan.statements.len(), 1);
        assert!(matches!(
            execution_plan.statements[0],
            StatementPlan::Passthrough(ref p) if p.is_query
        ));
        assert!(!execution_plan.requires_transaction);
    }

    #[test]
    fn state_reads_become_read_plans() {
        let execution_plan = plan("SELECT * FROM lix_state WHERE schema_key = 'x'");
        assert!(matches!(
            execution_plan.statements[0],
            StatementPlan::Read(_)
        ));
        assert!(!execution_plan.requires_transaction);
    }

    #[test]
    fn history_reads_require_a_transaction_for_maintenance() {
        let execution_plan =
            plan("SELECT * FROM lix_state_history WHERE root_commit_id = 'c1'");
        assert!(execution_plan.requires_transaction);
    }

    #[test]
    fn mutations_require_a_transaction() {
        let execution_plan = plan(
            "INSERT INTO lix_state (entity_id, schema_key, snapshot_content) \
             VALUES ('e', 's', '{}')",
        );
        assert!(execution_plan.requires_transaction);
        assert!(matches!(
            execution_plan.statements[0],
            StatementPlan::Mutation(_)
        ));
    }

    #[test]
    fn plan_fingerprints_are_stable() {
        let first = plan("SELECT * FROM lix_state WHERE schema_key = 'x'");
        let second = plan("SELECT * FROM lix_state WHERE schema_key = 'x'");
        assert_eq!(first.fingerprint, second.fingerprint);

        let different = plan("SELECT * FROM lix_state WHERE schema_key = 'y'");
        assert_ne!(first.fingerprint, different.fingerprint);
    }
}
