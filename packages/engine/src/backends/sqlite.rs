use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::Connection;

use crate::{
    LixBackend, LixError, LixTransaction, QueryResult, SnapshotChunkWriter, SqlDialect, Value,
};

const EXPORT_CHUNK_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path of the database file; `None` opens an in-memory database.
    pub filename: Option<PathBuf>,
}

impl SqliteConfig {
    pub fn in_memory() -> Self {
        Self { filename: None }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            filename: Some(path.into()),
        }
    }
}

/// Embedded backend over a single rusqlite connection. The engine serializes
/// statements per handle, so a mutex around the connection is enough.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(config: SqliteConfig) -> Result<Self, LixError> {
        let conn = match &config.filename {
            Some(path) => Connection::open(path),
            None => Connection::open_in_memory(),
        }
        .map_err(|error| LixError::io(error.to_string()))?;
        conn.execute_batch("PRAGMA foreign_keys = ON")
            .map_err(|error| LixError::io(error.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn run(&self, sql: &str, params: &[Value]) -> Result<QueryResult, LixError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| LixError::io("sqlite connection mutex poisoned"))?;
        run_on_connection(&conn, sql, params)
    }
}

#[async_trait(?Send)]
impl LixBackend for SqliteBackend {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult, LixError> {
        self.run(sql, params)
    }

    async fn begin_transaction(&self) -> Result<Box<dyn LixTransaction + '_>, LixError> {
        self.run("BEGIN", &[])?;
        Ok(Box::new(SqliteTransaction { backend: self }))
    }

    async fn export_snapshot(&self, writer: &mut dyn SnapshotChunkWriter) -> Result<(), LixError> {
        let export_path = std::env::temp_dir().join(format!(
            "lix-export-{}.sqlite3",
            uuid::Uuid::now_v7().as_simple()
        ));
        {
            let conn = self
                .conn
                .lock()
                .map_err(|_| LixError::io("sqlite connection mutex poisoned"))?;
            let mut target = Connection::open(&export_path)
                .map_err(|error| LixError::io(error.to_string()))?;
            let backup = rusqlite::backup::Backup::new(&conn, &mut target)
                .map_err(|error| LixError::io(error.to_string()))?;
            backup
                .run_to_completion(256, std::time::Duration::from_millis(0), None)
                .map_err(|error| LixError::io(error.to_string()))?;
        }
        let bytes = std::fs::read(&export_path).map_err(|error| LixError::io(error.to_string()));
        let _ = std::fs::remove_file(&export_path);
        let bytes = bytes?;
        for chunk in bytes.chunks(EXPORT_CHUNK_BYTES) {
            writer.write_chunk(chunk).await?;
        }
        writer.finish().await
    }
}

struct SqliteTransaction<'a> {
    backend: &'a SqliteBackend,
}

#[async_trait(?Send)]
impl LixTransaction for SqliteTransaction<'_> {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult, LixError> {
        self.backend.run(sql, params)
    }

    async fn commit(self: Box<Self>) -> Result<(), LixError> {
        self.backend.run("COMMIT", &[])?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), LixError> {
        self.backend.run("ROLLBACK", &[])?;
        Ok(())
    }
}

fn run_on_connection(conn: &Connection, sql: &str, params: &[Value]) -> Result<QueryResult, LixError> {
    // Multi-statement scripts never carry parameters once the binder ran.
    if params.is_empty() && sql.contains(';') {
        conn.execute_batch(sql)
            .map_err(|error| map_sqlite_error(error))?;
        return Ok(QueryResult::empty());
    }

    let mut statement = conn.prepare(sql).map_err(map_sqlite_error)?;
    let bound = params.iter().map(to_sqlite_value).collect::<Vec<_>>();

    if statement.column_count() == 0 {
        let affected = statement
            .execute(rusqlite::params_from_iter(bound))
            .map_err(map_sqlite_error)?;
        return Ok(QueryResult {
            columns: Vec::new(),
            rows: Vec::new(),
            affected: affected as u64,
        });
    }

    let columns = statement
        .column_names()
        .iter()
        .map(|name| name.to_string())
        .collect::<Vec<_>>();
    let column_count = columns.len();

    let mut rows = statement
        .query(rusqlite::params_from_iter(bound))
        .map_err(map_sqlite_error)?;
    let mut out_rows = Vec::new();
    loop {
        let row = match rows.next().map_err(map_sqlite_error)? {
            Some(row) => row,
            None => break,
        };
        let mut out = Vec::with_capacity(column_count);
        for index in 0..column_count {
            let value = row.get_ref(index).map_err(map_sqlite_error)?;
            out.push(from_sqlite_value(value)?);
        }
        out_rows.push(out);
    }

    Ok(QueryResult {
        columns,
        rows: out_rows,
        affected: 0,
    })
}

fn to_sqlite_value(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Integer(v) => rusqlite::types::Value::Integer(*v),
        Value::Real(v) => rusqlite::types::Value::Real(*v),
        Value::Text(v) => rusqlite::types::Value::Text(v.clone()),
        Value::Blob(v) => rusqlite::types::Value::Blob(v.clone()),
    }
}

fn from_sqlite_value(value: ValueRef<'_>) -> Result<Value, LixError> {
    Ok(match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Integer(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(bytes) => Value::Text(
            std::str::from_utf8(bytes)
                .map_err(|error| LixError::io(format!("sqlite returned invalid UTF-8: {error}")))?
                .to_string(),
        ),
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    })
}

fn map_sqlite_error(error: rusqlite::Error) -> LixError {
    let message = error.to_string();
    match &error {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            LixError::constraint(message)
        }
        _ => LixError::io(message),
    }
}

#[cfg(test)]
mod tests {
    use super::{SqliteBackend, SqliteConfig};
    use crate::{LixBackend, Value};

    #[tokio::test]
    async fn executes_parameterized_statements_and_reads_rows() {
        let backend = SqliteBackend::open(SqliteConfig::in_memory()).expect("open backend");
        backend
            .execute("CREATE TABLE demo (id TEXT PRIMARY KEY, n INTEGER)", &[])
            .await
            .expect("create table");
        let insert = backend
            .execute(
                "INSERT INTO demo (id, n) VALUES (?1, ?2)",
                &[Value::Text("a".to_string()), Value::Integer(7)],
            )
            .await
            .expect("insert");
        assert_eq!(insert.affected, 1);

        let rows = backend
            .execute("SELECT id, n FROM demo", &[])
            .await
            .expect("select");
        assert_eq!(rows.columns, vec!["id".to_string(), "n".to_string()]);
        assert_eq!(
            rows.rows,
            vec![vec![Value::Text("a".to_string()), Value::Integer(7)]]
        );
    }

    #[tokio::test]
    async fn constraint_violations_map_to_constraint_kind() {
        let backend = SqliteBackend::open(SqliteConfig::in_memory()).expect("open backend");
        backend
            .execute("CREATE TABLE demo (id TEXT PRIMARY KEY)", &[])
            .await
            .expect("create table");
        backend
            .execute("INSERT INTO demo (id) VALUES ('x')", &[])
            .await
            .expect("first insert");
        let err = backend
            .execute("INSERT INTO demo (id) VALUES ('x')", &[])
            .await
            .expect_err("duplicate insert should fail");
        assert_eq!(err.kind, crate::ErrorKind::Constraint);
    }

    #[tokio::test]
    async fn transaction_rollback_discards_writes() {
        let backend = SqliteBackend::open(SqliteConfig::in_memory()).expect("open backend");
        backend
            .execute("CREATE TABLE demo (id TEXT PRIMARY KEY)", &[])
            .await
            .expect("create table");

        let mut tx = backend.begin_transaction().await.expect("begin");
        tx.execute("INSERT INTO demo (id) VALUES ('x')", &[])
            .await
            .expect("insert in tx");
        tx.rollback().await.expect("rollback");

        let rows = backend
            .execute("SELECT id FROM demo", &[])
            .await
            .expect("select");
        assert!(rows.rows.is_empty());
    }
}
