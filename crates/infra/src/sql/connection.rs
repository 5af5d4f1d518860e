//! Connection and transaction handling for the SQL stores.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::str::FromStr;
use tracing::debug;

use postbus_sagas::SagaStoreError;

/// Hands out one transactional connection per store operation.
#[async_trait]
pub trait DbConnectionProvider: Send + Sync {
    async fn connection(&self) -> Result<DbConnection, SagaStoreError>;
}

/// A connection with an open transaction.
///
/// [`complete`](Self::complete) commits; dropping the connection without
/// completing it rolls the transaction back.
#[derive(Debug)]
pub struct DbConnection {
    tx: Transaction<'static, Sqlite>,
}

impl DbConnection {
    pub fn new(tx: Transaction<'static, Sqlite>) -> Self {
        Self { tx }
    }

    /// Executor for queries inside the transaction.
    pub fn executor(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    /// Names of all tables in the database.
    pub async fn table_names(&mut self) -> Result<Vec<String>, SagaStoreError> {
        sqlx::query_scalar::<_, String>("SELECT name FROM sqlite_master WHERE type = 'table'")
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("table_names", e))
    }

    /// Commit the transaction.
    pub async fn complete(self) -> Result<(), SagaStoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("complete", e))
    }
}

/// [`DbConnectionProvider`] over a SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteConnectionProvider {
    pool: SqlitePool,
}

impl SqliteConnectionProvider {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a pool for `url` (e.g. `sqlite://sagas.db` or `sqlite::memory:`).
    ///
    /// In-memory databases get a single long-lived connection, since each
    /// connection would otherwise see its own empty database.
    pub async fn connect(url: &str) -> Result<Self, SagaStoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| map_sqlx_error("connect", e))?
            .create_if_missing(true)
            .foreign_keys(true);

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        debug!(url, in_memory, "opened sqlite pool");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl DbConnectionProvider for SqliteConnectionProvider {
    async fn connection(&self) -> Result<DbConnection, SagaStoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(DbConnection::new(tx))
    }
}

/// SQLite extended result codes for primary-key and unique-constraint violations.
const SQLITE_CONSTRAINT_PRIMARYKEY: &str = "1555";
const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";

/// True for primary-key and unique-constraint violations.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if db_err.is_unique_violation() {
            return true;
        }
        if let Some(code) = db_err.code() {
            return matches!(
                code.as_ref(),
                SQLITE_CONSTRAINT_PRIMARYKEY | SQLITE_CONSTRAINT_UNIQUE
            );
        }
    }
    false
}

/// Map a sqlx error to a storage error, tagged with the failing operation.
///
/// Unique violations are mapped by the callers, which know which saga they
/// concern.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SagaStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            SagaStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            SagaStoreError::Storage(format!("connection pool closed during {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            SagaStoreError::Storage(format!("timed out waiting for a connection during {}", operation))
        }
        other => SagaStoreError::Storage(format!("sqlx error in {}: {}", operation, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_connection_rolls_back() {
        let provider = SqliteConnectionProvider::connect("sqlite::memory:").await.unwrap();

        let mut conn = provider.connection().await.unwrap();
        sqlx::query("CREATE TABLE scratch (id INTEGER)")
            .execute(conn.executor())
            .await
            .unwrap();
        drop(conn);

        let mut conn = provider.connection().await.unwrap();
        assert!(!conn.table_names().await.unwrap().contains(&"scratch".to_string()));
    }

    #[tokio::test]
    async fn completed_connection_commits() {
        let provider = SqliteConnectionProvider::connect("sqlite::memory:").await.unwrap();

        let mut conn = provider.connection().await.unwrap();
        sqlx::query("CREATE TABLE scratch (id INTEGER)")
            .execute(conn.executor())
            .await
            .unwrap();
        conn.complete().await.unwrap();

        let mut conn = provider.connection().await.unwrap();
        assert!(conn.table_names().await.unwrap().contains(&"scratch".to_string()));
    }
}
