//! SQL side of the correlation index.

use sqlx::{QueryBuilder, Sqlite};

use postbus_core::SagaId;
use postbus_sagas::{IndexEntry, SagaStoreError};

use super::connection::{DbConnection, is_unique_violation, map_sqlx_error};
use super::schema::quote_identifier;

/// Index rows living in one index table.
#[derive(Debug, Clone)]
pub struct SqlCorrelationIndex {
    table: String,
}

impl SqlCorrelationIndex {
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into() }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Remove every row pointing at `saga_id`.
    pub async fn delete_entries(&self, conn: &mut DbConnection, saga_id: SagaId) -> Result<u64, SagaStoreError> {
        let sql = format!("DELETE FROM {} WHERE saga_id = ?", quote_identifier(&self.table));
        let result = sqlx::query(&sql)
            .bind(saga_id.to_string())
            .execute(conn.executor())
            .await
            .map_err(|e| map_sqlx_error("delete_index_entries", e))?;
        Ok(result.rows_affected())
    }

    /// Insert all `entries` for `saga_id` in one statement. A triple already
    /// claimed by another instance is a concurrency error.
    pub async fn insert_entries(
        &self,
        conn: &mut DbConnection,
        saga_type: &str,
        saga_id: SagaId,
        entries: &[IndexEntry],
    ) -> Result<(), SagaStoreError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "INSERT INTO {} (saga_type, correlation_key, correlation_value, saga_id) ",
            quote_identifier(&self.table)
        ));
        let id = saga_id.to_string();
        builder.push_values(entries, |mut row, entry| {
            row.push_bind(saga_type)
                .push_bind(entry.key.as_str())
                .push_bind(entry.value.as_str())
                .push_bind(id.as_str());
        });

        builder
            .build()
            .execute(conn.executor())
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    SagaStoreError::concurrency(
                        saga_id,
                        format!("a correlation value of this {saga_type} is already claimed by another instance"),
                    )
                } else {
                    map_sqlx_error("insert_index_entries", e)
                }
            })?;
        Ok(())
    }
}
