mod backend;
mod backends;
mod binary;
mod boot;
mod builtin_schema;
mod cel;
mod commit;
mod deterministic;
mod engine;
mod error;
mod exec;
mod filesystem;
mod functions;
mod hash;
mod history;
mod init;
mod plugin;
mod schema;
mod schema_registry;
mod sql;
mod storage;
mod types;
mod version;
mod vtable_write;

pub use backend::{
    LixBackend, LixTransaction, SnapshotChunkReader, SnapshotChunkWriter, SqlDialect,
};
#[cfg(feature = "backend-postgres")]
pub use backends::{PostgresBackend, PostgresConfig};
#[cfg(feature = "backend-sqlite")]
pub use backends::{SqliteBackend, SqliteConfig};
pub use boot::{boot, BootArgs, BootKeyValue};
pub use commit::{
    generate_commit, ChangeRow, DomainChangeInput, GenerateCommitArgs, GenerateCommitResult,
    MaterializedRow, VersionContext,
};
pub use deterministic::DeterministicSettings;
pub use engine::{Engine, EngineTransaction};
pub use error::{ErrorContext, ErrorKind, LixError};
pub use plugin::{
    NoopPluginHost, PluginEntityChange, PluginEntityState, PluginFileDescriptor, PluginHost,
    PluginInstance, PluginManifest,
};
pub use schema::{validate_schema_definition, StoredSchema};
pub use types::{QueryResult, Value};
