use async_trait::async_trait;

use crate::{LixError, QueryResult, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Sqlite,
    Postgres,
}

#[async_trait(?Send)]
pub trait SnapshotChunkReader {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, LixError>;
}

#[async_trait(?Send)]
pub trait SnapshotChunkWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), LixError>;

    async fn finish(&mut self) -> Result<(), LixError> {
        Ok(())
    }
}

/// Capability surface over a relational database. The engine only ever asks
/// a backend to run dialect-normalized SQL with positional parameters and to
/// scope transactions; backend errors are surfaced verbatim inside the typed
/// error wrapper and never re-parsed for control flow.
#[async_trait(?Send)]
pub trait LixBackend: Send + Sync {
    fn dialect(&self) -> SqlDialect;

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult, LixError>;

    async fn begin_transaction(&self) -> Result<Box<dyn LixTransaction + '_>, LixError>;

    /// Exports the current database as a portable single-file image, written
    /// to `writer` in one or more chunks.
    async fn export_snapshot(&self, _writer: &mut dyn SnapshotChunkWriter) -> Result<(), LixError> {
        Err(LixError::io(
            "export_snapshot is not supported by this backend",
        ))
    }
}

#[async_trait(?Send)]
pub trait LixTransaction {
    fn dialect(&self) -> SqlDialect;

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult, LixError>;

    async fn commit(self: Box<Self>) -> Result<(), LixError>;

    async fn rollback(self: Box<Self>) -> Result<(), LixError>;
}
