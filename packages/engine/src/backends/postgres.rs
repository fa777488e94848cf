use async_trait::async_trait;
use sqlx::{Column, Executor, PgPool, Row, ValueRef as _};

use crate::{LixBackend, LixError, LixTransaction, QueryResult, SqlDialect, Value};

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub connection_url: String,
}

/// Server backend over a Postgres connection pool. Connections are created
/// lazily so `open` never blocks on the network.
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub fn open(config: PostgresConfig) -> Result<Self, LixError> {
        let pool = PgPool::connect_lazy(&config.connection_url)
            .map_err(|error| LixError::io(error.to_string()))?;
        Ok(Self { pool })
    }
}

#[async_trait(?Send)]
impl LixBackend for PostgresBackend {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult, LixError> {
        if params.is_empty() && sql.contains(';') {
            self.pool
                .execute(sqlx::raw_sql(sql))
                .await
                .map_err(map_postgres_error)?;
            return Ok(QueryResult::empty());
        }

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_postgres(query, param);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(map_postgres_error)?;
        map_rows(rows)
    }

    async fn begin_transaction(&self) -> Result<Box<dyn LixTransaction + '_>, LixError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|error| LixError::io(error.to_string()))?;
        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(map_postgres_error)?;
        Ok(Box::new(PostgresTransaction { conn }))
    }
}

struct PostgresTransaction {
    conn: sqlx::pool::PoolConnection<sqlx::Postgres>,
}

#[async_trait(?Send)]
impl LixTransaction for PostgresTransaction {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult, LixError> {
        if params.is_empty() && sql.contains(';') {
            self.conn
                .execute(sqlx::raw_sql(sql))
                .await
                .map_err(map_postgres_error)?;
            return Ok(QueryResult::empty());
        }

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_postgres(query, param);
        }
        let rows = query
            .fetch_all(&mut *self.conn)
            .await
            .map_err(map_postgres_error)?;
        map_rows(rows)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), LixError> {
        sqlx::query("COMMIT")
            .execute(&mut *self.conn)
            .await
            .map_err(map_postgres_error)?;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), LixError> {
        sqlx::query("ROLLBACK")
            .execute(&mut *self.conn)
            .await
            .map_err(map_postgres_error)?;
        Ok(())
    }
}

fn bind_postgres<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    param: &'q Value,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match param {
        Value::Null => query.bind(Option::<String>::None),
        Value::Integer(v) => query.bind(*v),
        Value::Real(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.as_str()),
        Value::Blob(v) => query.bind(v.as_slice()),
    }
}

fn map_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<QueryResult, LixError> {
    let columns = rows
        .first()
        .map(|row| {
            row.columns()
                .iter()
                .map(|column| column.name().to_string())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let mut out_rows = Vec::with_capacity(rows.len());
    for row in rows {
        let mut out = Vec::with_capacity(row.columns().len());
        for index in 0..row.columns().len() {
            out.push(map_postgres_value(&row, index)?);
        }
        out_rows.push(out);
    }
    Ok(QueryResult {
        columns,
        rows: out_rows,
        affected: 0,
    })
}

fn map_postgres_value(row: &sqlx::postgres::PgRow, index: usize) -> Result<Value, LixError> {
    let raw = row
        .try_get_raw(index)
        .map_err(|error| LixError::io(error.to_string()))?;
    if raw.is_null() {
        return Ok(Value::Null);
    }

    if let Ok(value) = row.try_get::<i64, _>(index) {
        return Ok(Value::Integer(value));
    }
    if let Ok(value) = row.try_get::<i32, _>(index) {
        return Ok(Value::Integer(value as i64));
    }
    if let Ok(value) = row.try_get::<bool, _>(index) {
        return Ok(Value::Integer(value as i64));
    }
    if let Ok(value) = row.try_get::<f64, _>(index) {
        return Ok(Value::Real(value));
    }
    if let Ok(value) = row.try_get::<String, _>(index) {
        return Ok(Value::Text(value));
    }
    if let Ok(value) = row.try_get::<Vec<u8>, _>(index) {
        return Ok(Value::Blob(value));
    }
    Ok(Value::Null)
}

fn map_postgres_error(error: sqlx::Error) -> LixError {
    if let sqlx::Error::Database(db_error) = &error {
        // Class 23 covers integrity constraint violations.
        if db_error
            .code()
            .map(|code| code.starts_with("23"))
            .unwrap_or(false)
        {
            return LixError::constraint(db_error.to_string());
        }
    }
    LixError::io(error.to_string())
}
