//! Relational saga persistence on `sqlx` (SQLite).

pub mod connection;
pub mod correlation_index;
pub mod saga_store;
pub mod schema;

pub use connection::{DbConnection, DbConnectionProvider, SqliteConnectionProvider};
pub use correlation_index::SqlCorrelationIndex;
pub use saga_store::{SqlSagaStore, SqlSagaStoreConfig};
pub use schema::ensure_tables_are_created;
