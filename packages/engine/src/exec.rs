use crate::sql::params::bind_sql;
use crate::{LixBackend, LixError, LixTransaction, QueryResult, SqlDialect, Value};

/// Uniform statement executor over a bare backend or an open transaction, so
/// the runner's helpers do not need two copies of every query.
pub(crate) enum Executor<'a> {
    Backend(&'a dyn LixBackend),
    Transaction(&'a mut (dyn LixTransaction + 'a)),
}

impl Executor<'_> {
    pub(crate) fn dialect(&self) -> SqlDialect {
        match self {
            Executor::Backend(backend) => backend.dialect(),
            Executor::Transaction(transaction) => transaction.dialect(),
        }
    }

    pub(crate) async fn execute(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryResult, LixError> {
        match self {
            Executor::Backend(backend) => backend.execute(sql, params).await,
            Executor::Transaction(transaction) => transaction.execute(sql, params).await,
        }
    }

    /// Engine-internal statements are written with `$N` placeholders; this
    /// renumbers them to the backend's native form before executing.
    pub(crate) async fn execute_internal(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryResult, LixError> {
        let bound = bind_sql(sql, params, self.dialect())?;
        self.execute(&bound.sql, &bound.params).await
    }
}
