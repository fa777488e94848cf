#[cfg(feature = "backend-postgres")]
mod postgres;
#[cfg(feature = "backend-sqlite")]
mod sqlite;

#[cfg(feature = "backend-postgres")]
pub use postgres::{PostgresBackend, PostgresConfig};
#[cfg(feature = "backend-sqlite")]
pub use sqlite::{SqliteBackend, SqliteConfig};
