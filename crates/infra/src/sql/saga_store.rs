//! Relational saga store.
//!
//! ## Tables
//!
//! - data table: `id` (primary key), `revision`, `data` (JSON payload)
//! - index table: `(saga_type, correlation_key, correlation_value)` primary key
//!   pointing at `saga_id`, cascading on delete of the data row
//!
//! ## Error Mapping
//!
//! | Condition | SagaStoreError |
//! |-----------|----------------|
//! | primary-key violation on insert | `Concurrency` |
//! | unique violation on an index triple | `Concurrency` |
//! | conditional update/delete affects zero rows | `Concurrency` |
//! | stored payload does not deserialize | `Corruption` |
//! | type name or index key too long | `Configuration` |
//! | any other sqlx error | `Storage` |

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::Row;
use tracing::{Span, instrument};

use postbus_core::SagaId;
use postbus_sagas::{
    CorrelationProperty, ID_PROPERTY, SagaData, SagaStore, SagaStoreError, SagaStoreResult,
    index_entries, saga_type_name, stringify,
};

use super::connection::{DbConnection, DbConnectionProvider, is_unique_violation, map_sqlx_error};
use super::correlation_index::SqlCorrelationIndex;
use super::schema::{ensure_tables_are_created, quote_identifier};

/// Table names and indexing options for [`SqlSagaStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlSagaStoreConfig {
    pub data_table: String,
    pub index_table: String,
    /// Index missing and null correlation values as the empty string.
    pub index_nulls: bool,
}

impl Default for SqlSagaStoreConfig {
    fn default() -> Self {
        Self {
            data_table: "sagas".to_string(),
            index_table: "saga_index".to_string(),
            index_nulls: false,
        }
    }
}

impl SqlSagaStoreConfig {
    pub fn with_data_table(mut self, table: impl Into<String>) -> Self {
        self.data_table = table.into();
        self
    }

    pub fn with_index_table(mut self, table: impl Into<String>) -> Self {
        self.index_table = table.into();
        self
    }

    pub fn with_null_indexing(mut self, enabled: bool) -> Self {
        self.index_nulls = enabled;
        self
    }
}

/// [`SagaStore`] over a relational database.
///
/// Every operation runs in its own transaction obtained from the
/// [`DbConnectionProvider`] and completes it on success.
#[derive(Clone)]
pub struct SqlSagaStore {
    provider: Arc<dyn DbConnectionProvider>,
    config: SqlSagaStoreConfig,
    index: SqlCorrelationIndex,
}

impl SqlSagaStore {
    pub fn new(provider: Arc<dyn DbConnectionProvider>, config: SqlSagaStoreConfig) -> Self {
        let index = SqlCorrelationIndex::new(config.index_table.clone());
        Self {
            provider,
            config,
            index,
        }
    }

    pub fn config(&self) -> &SqlSagaStoreConfig {
        &self.config
    }

    /// Create the tables if they are missing.
    pub async fn ensure_tables_are_created(&self) -> SagaStoreResult<()> {
        ensure_tables_are_created(
            self.provider.as_ref(),
            &self.config.data_table,
            &self.config.index_table,
        )
        .await
    }

    fn data_table(&self) -> String {
        quote_identifier(&self.config.data_table)
    }

    fn index_table(&self) -> String {
        quote_identifier(&self.config.index_table)
    }

    fn decode<D: SagaData>(saga_id: SagaId, revision: i64, data: &[u8]) -> SagaStoreResult<D> {
        let mut saga: D = serde_json::from_slice(data)
            .map_err(|source| SagaStoreError::Corruption { saga_id, source })?;
        let revision = u64::try_from(revision).map_err(|_| {
            SagaStoreError::Storage(format!("saga {saga_id} has a negative revision {revision}"))
        })?;
        saga.set_revision(revision);
        Ok(saga)
    }

    fn encode<D: SagaData>(saga: &D) -> SagaStoreResult<Vec<u8>> {
        serde_json::to_vec(saga).map_err(|e| {
            SagaStoreError::InvalidSaga(format!("could not serialize saga {}: {e}", saga.id()))
        })
    }

    async fn find_by_id<D: SagaData>(
        &self,
        conn: &mut DbConnection,
        saga_id: SagaId,
    ) -> SagaStoreResult<Option<D>> {
        let sql = format!("SELECT revision, data FROM {} WHERE id = ?", self.data_table());
        let row = sqlx::query(&sql)
            .bind(saga_id.to_string())
            .fetch_optional(conn.executor())
            .await
            .map_err(|e| map_sqlx_error("find_by_id", e))?;

        match row {
            Some(row) => {
                let revision: i64 = row.try_get("revision").map_err(|e| map_sqlx_error("find_by_id", e))?;
                let data: Vec<u8> = row.try_get("data").map_err(|e| map_sqlx_error("find_by_id", e))?;
                Self::decode(saga_id, revision, &data).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn find_by_correlation<D: SagaData>(
        &self,
        conn: &mut DbConnection,
        property: &str,
        value: &str,
    ) -> SagaStoreResult<Option<D>> {
        let saga_type = saga_type_name::<D>()?;
        let sql = format!(
            r#"
            SELECT s.id, s.revision, s.data
            FROM {data} s
            JOIN {index} i ON s.id = i.saga_id
            WHERE i.saga_type = ? AND i.correlation_key = ? AND i.correlation_value = ?
            "#,
            data = self.data_table(),
            index = self.index_table(),
        );
        let row = sqlx::query(&sql)
            .bind(&saga_type)
            .bind(property)
            .bind(value)
            .fetch_optional(conn.executor())
            .await
            .map_err(|e| map_sqlx_error("find_by_correlation", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: String = row.try_get("id").map_err(|e| map_sqlx_error("find_by_correlation", e))?;
        let saga_id = SagaId::from_str(&id)
            .map_err(|e| SagaStoreError::Storage(format!("stored saga id '{id}' is invalid: {e}")))?;
        let revision: i64 = row
            .try_get("revision")
            .map_err(|e| map_sqlx_error("find_by_correlation", e))?;
        let data: Vec<u8> = row.try_get("data").map_err(|e| map_sqlx_error("find_by_correlation", e))?;
        Self::decode(saga_id, revision, &data).map(Some)
    }

    /// The conditional write of an update; `saga` already carries the new revision.
    async fn try_update<D: SagaData>(
        &self,
        saga: &D,
        expected_revision: u64,
        correlation_properties: &[CorrelationProperty],
    ) -> SagaStoreResult<()> {
        let saga_id = saga.id();
        let saga_type = saga_type_name::<D>()?;
        let entries = index_entries(saga, correlation_properties, self.config.index_nulls)?;
        let data = Self::encode(saga)?;
        let new_revision = to_db_revision(saga_id, saga.revision())?;
        let old_revision = to_db_revision(saga_id, expected_revision)?;

        let mut conn = self.provider.connection().await?;
        self.index.delete_entries(&mut conn, saga_id).await?;

        let sql = format!(
            "UPDATE {} SET data = ?, revision = ? WHERE id = ? AND revision = ?",
            self.data_table()
        );
        let result = sqlx::query(&sql)
            .bind(data)
            .bind(new_revision)
            .bind(saga_id.to_string())
            .bind(old_revision)
            .execute(conn.executor())
            .await
            .map_err(|e| map_sqlx_error("update", e))?;
        if result.rows_affected() == 0 {
            return Err(SagaStoreError::concurrency(
                saga_id,
                format!("update expected revision {expected_revision}, but it was modified or deleted"),
            ));
        }

        self.index
            .insert_entries(&mut conn, &saga_type, saga_id, &entries)
            .await?;
        conn.complete().await
    }
}

fn to_db_revision(saga_id: SagaId, revision: u64) -> SagaStoreResult<i64> {
    i64::try_from(revision)
        .map_err(|_| SagaStoreError::InvalidSaga(format!("revision {revision} of saga {saga_id} is out of range")))
}

#[async_trait]
impl SagaStore for SqlSagaStore {
    #[instrument(
        skip(self, property, value),
        fields(saga_type = %D::saga_type_name(), property = %property, found = tracing::field::Empty),
        err
    )]
    async fn find<D: SagaData>(&self, property: &str, value: &Value) -> SagaStoreResult<Option<D>> {
        let value = match stringify(value) {
            Some(value) => value,
            None if self.config.index_nulls && property != ID_PROPERTY => String::new(),
            None => return Ok(None),
        };

        let mut conn = self.provider.connection().await?;
        let found = if property == ID_PROPERTY {
            match SagaId::from_str(&value) {
                Ok(saga_id) => self.find_by_id(&mut conn, saga_id).await?,
                Err(_) => None,
            }
        } else {
            self.find_by_correlation(&mut conn, property, &value).await?
        };
        conn.complete().await?;

        Span::current().record("found", found.is_some());
        Ok(found)
    }

    #[instrument(skip(self, saga, correlation_properties), fields(saga_id = %saga.id()), err)]
    async fn insert<D: SagaData>(
        &self,
        saga: &D,
        correlation_properties: &[CorrelationProperty],
    ) -> SagaStoreResult<()> {
        let saga_id = saga.id();
        if saga_id.is_nil() {
            return Err(SagaStoreError::InvalidSaga(
                "saga id must be assigned before insert".to_string(),
            ));
        }
        let saga_type = saga_type_name::<D>()?;
        let entries = index_entries(saga, correlation_properties, self.config.index_nulls)?;
        let data = Self::encode(saga)?;
        let revision = to_db_revision(saga_id, saga.revision())?;

        let mut conn = self.provider.connection().await?;
        let sql = format!(
            "INSERT INTO {} (id, revision, data) VALUES (?, ?, ?)",
            self.data_table()
        );
        sqlx::query(&sql)
            .bind(saga_id.to_string())
            .bind(revision)
            .bind(data)
            .execute(conn.executor())
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    SagaStoreError::concurrency(saga_id, "an instance with this id already exists")
                } else {
                    map_sqlx_error("insert", e)
                }
            })?;

        self.index
            .insert_entries(&mut conn, &saga_type, saga_id, &entries)
            .await?;
        conn.complete().await
    }

    #[instrument(
        skip(self, saga, correlation_properties),
        fields(saga_id = %saga.id(), revision = saga.revision()),
        err
    )]
    async fn update<D: SagaData>(
        &self,
        saga: &mut D,
        correlation_properties: &[CorrelationProperty],
    ) -> SagaStoreResult<()> {
        let revision = saga.revision();
        let next_revision = revision.checked_add(1).ok_or_else(|| {
            SagaStoreError::InvalidSaga(format!(
                "revision of saga {} cannot be incremented past {revision}",
                saga.id()
            ))
        })?;
        saga.set_revision(next_revision);

        let result = self.try_update(&*saga, revision, correlation_properties).await;
        if result.is_err() {
            saga.set_revision(revision);
        }
        result
    }

    #[instrument(skip(self, saga), fields(saga_id = %saga.id(), revision = saga.revision()), err)]
    async fn delete<D: SagaData>(&self, saga: &D) -> SagaStoreResult<()> {
        let saga_id = saga.id();
        let revision = to_db_revision(saga_id, saga.revision())?;

        let mut conn = self.provider.connection().await?;
        let sql = format!("DELETE FROM {} WHERE id = ? AND revision = ?", self.data_table());
        let result = sqlx::query(&sql)
            .bind(saga_id.to_string())
            .bind(revision)
            .execute(conn.executor())
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        if result.rows_affected() == 0 {
            return Err(SagaStoreError::concurrency(
                saga_id,
                format!("delete expected revision {}, but it was modified or deleted", saga.revision()),
            ));
        }

        self.index.delete_entries(&mut conn, saga_id).await?;
        conn.complete().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use crate::sql::connection::SqliteConnectionProvider;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ShippingSaga {
        id: SagaId,
        revision: u64,
        order_id: String,
        customer: Customer,
        tracking_number: Option<String>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Customer {
        email: String,
    }

    impl SagaData for ShippingSaga {
        fn id(&self) -> SagaId {
            self.id
        }
        fn set_id(&mut self, id: SagaId) {
            self.id = id;
        }
        fn revision(&self) -> u64 {
            self.revision
        }
        fn set_revision(&mut self, revision: u64) {
            self.revision = revision;
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Incompatible {
        id: SagaId,
        revision: u64,
        required_field: u64,
    }

    impl SagaData for Incompatible {
        fn id(&self) -> SagaId {
            self.id
        }
        fn set_id(&mut self, id: SagaId) {
            self.id = id;
        }
        fn revision(&self) -> u64 {
            self.revision
        }
        fn set_revision(&mut self, revision: u64) {
            self.revision = revision;
        }
        fn saga_type_name() -> String {
            "ShippingSaga".to_string()
        }
    }

    fn saga(order_id: &str) -> ShippingSaga {
        ShippingSaga {
            id: SagaId::new(),
            revision: 0,
            order_id: order_id.to_string(),
            customer: Customer {
                email: format!("{order_id}@example.com"),
            },
            tracking_number: None,
        }
    }

    fn props() -> Vec<CorrelationProperty> {
        vec![
            CorrelationProperty::id(),
            CorrelationProperty::new("order_id"),
            CorrelationProperty::new("customer.email"),
            CorrelationProperty::new("tracking_number"),
        ]
    }

    async fn store() -> (SqlSagaStore, SqliteConnectionProvider) {
        let provider = SqliteConnectionProvider::connect("sqlite::memory:").await.unwrap();
        let store = SqlSagaStore::new(Arc::new(provider.clone()), SqlSagaStoreConfig::default());
        store.ensure_tables_are_created().await.unwrap();
        (store, provider)
    }

    async fn count(provider: &SqliteConnectionProvider, table: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(provider.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn insert_and_find_by_id_and_correlation() {
        let (store, provider) = store().await;
        let saga = saga("o-1");
        store.insert(&saga, &props()).await.unwrap();

        let by_id: ShippingSaga = store
            .find(ID_PROPERTY, &json!(saga.id.to_string()))
            .await
            .unwrap()
            .unwrap();
        let by_order: ShippingSaga = store.find("order_id", &json!("o-1")).await.unwrap().unwrap();
        let by_email: ShippingSaga = store
            .find("customer.email", &json!("o-1@example.com"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(by_id, saga);
        assert_eq!(by_order, saga);
        assert_eq!(by_email, saga);
        // id is not indexed, the null tracking number is skipped
        assert_eq!(count(&provider, "saga_index").await, 2);
    }

    #[tokio::test]
    async fn unknown_values_are_not_found() {
        let (store, _provider) = store().await;
        store.insert(&saga("o-1"), &props()).await.unwrap();

        assert!(store.find::<ShippingSaga>("order_id", &json!("o-2")).await.unwrap().is_none());
        assert!(store.find::<ShippingSaga>(ID_PROPERTY, &json!("not-a-uuid")).await.unwrap().is_none());
        assert!(store.find::<ShippingSaga>("tracking_number", &Value::Null).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_id_insert_is_a_concurrency_error() {
        let (store, provider) = store().await;
        let first = saga("o-1");
        let mut second = saga("o-2");
        second.id = first.id;

        store.insert(&first, &props()).await.unwrap();
        let err = store.insert(&second, &props()).await.unwrap_err();

        assert!(err.is_concurrency());
        assert_eq!(count(&provider, "sagas").await, 1);
        let stored: ShippingSaga = store.find("order_id", &json!("o-1")).await.unwrap().unwrap();
        assert_eq!(stored.id, first.id);
        assert!(store.find::<ShippingSaga>("order_id", &json!("o-2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn correlation_triple_is_unique() {
        let (store, provider) = store().await;
        store.insert(&saga("o-1"), &props()).await.unwrap();

        let err = store.insert(&saga("o-1"), &props()).await.unwrap_err();

        assert!(err.is_concurrency());
        assert_eq!(count(&provider, "sagas").await, 1);
    }

    #[tokio::test]
    async fn concurrent_updates_from_the_same_revision() {
        let (store, _provider) = store().await;
        let original = saga("o-1");
        store.insert(&original, &props()).await.unwrap();

        let mut first = original.clone();
        let mut second = original.clone();
        first.tracking_number = Some("T-1".into());
        second.tracking_number = Some("T-2".into());

        store.update(&mut first, &props()).await.unwrap();
        let err = store.update(&mut second, &props()).await.unwrap_err();

        assert!(err.is_concurrency());
        assert_eq!(first.revision, 1);
        assert_eq!(second.revision, 0);
        let stored: ShippingSaga = store.find("order_id", &json!("o-1")).await.unwrap().unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(stored.tracking_number.as_deref(), Some("T-1"));
        assert!(store.find::<ShippingSaga>("tracking_number", &json!("T-2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_moves_correlation_entries() {
        let (store, provider) = store().await;
        let mut saga = saga("o-1");
        store.insert(&saga, &props()).await.unwrap();

        saga.order_id = "o-9".into();
        store.update(&mut saga, &props()).await.unwrap();

        assert!(store.find::<ShippingSaga>("order_id", &json!("o-1")).await.unwrap().is_none());
        let found: ShippingSaga = store.find("order_id", &json!("o-9")).await.unwrap().unwrap();
        assert_eq!(found.revision, 1);
        assert_eq!(count(&provider, "saga_index").await, 2);
    }

    #[tokio::test]
    async fn update_conflicting_with_another_instance_restores_revision() {
        let (store, _provider) = store().await;
        store.insert(&saga("o-1"), &props()).await.unwrap();
        let mut other = saga("o-2");
        store.insert(&other, &props()).await.unwrap();

        other.order_id = "o-1".into();
        let err = store.update(&mut other, &props()).await.unwrap_err();

        assert!(err.is_concurrency());
        assert_eq!(other.revision, 0);
        let stored: ShippingSaga = store.find("order_id", &json!("o-2")).await.unwrap().unwrap();
        assert_eq!(stored.revision, 0);
    }

    #[tokio::test]
    async fn delete_is_revision_checked() {
        let (store, provider) = store().await;
        let mut saga = saga("o-1");
        store.insert(&saga, &props()).await.unwrap();
        let stale = saga.clone();
        store.update(&mut saga, &props()).await.unwrap();

        assert!(store.delete(&stale).await.unwrap_err().is_concurrency());
        store.delete(&saga).await.unwrap();

        assert_eq!(count(&provider, "sagas").await, 0);
        assert_eq!(count(&provider, "saga_index").await, 0);
        assert!(store.delete(&saga).await.unwrap_err().is_concurrency());
    }

    #[tokio::test]
    async fn undeserializable_rows_are_corruption() {
        let (store, _provider) = store().await;
        let saga = saga("o-1");
        store.insert(&saga, &props()).await.unwrap();

        let err = store
            .find::<Incompatible>("order_id", &json!("o-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SagaStoreError::Corruption { saga_id, .. } if saga_id == saga.id));
    }

    #[tokio::test]
    async fn null_values_can_be_indexed() {
        let provider = SqliteConnectionProvider::connect("sqlite::memory:").await.unwrap();
        let store = SqlSagaStore::new(
            Arc::new(provider.clone()),
            SqlSagaStoreConfig::default()
                .with_data_table("shipping")
                .with_index_table("shipping_index")
                .with_null_indexing(true),
        );
        store.ensure_tables_are_created().await.unwrap();
        let saga = saga("o-1");
        store.insert(&saga, &props()).await.unwrap();

        let found: ShippingSaga = store.find("tracking_number", &Value::Null).await.unwrap().unwrap();
        assert_eq!(found.id, saga.id);
    }

    #[tokio::test]
    async fn update_past_the_largest_stored_revision_is_rejected() {
        let (store, _provider) = store().await;
        let mut saga = saga("o-1");
        saga.revision = i64::MAX as u64;
        store.insert(&saga, &props()).await.unwrap();

        let err = store.update(&mut saga, &props()).await.unwrap_err();
        assert!(matches!(err, SagaStoreError::InvalidSaga(_)));
        assert_eq!(saga.revision, i64::MAX as u64);

        saga.revision = u64::MAX;
        let err = store.update(&mut saga, &props()).await.unwrap_err();
        assert!(matches!(err, SagaStoreError::InvalidSaga(_)));
        assert_eq!(saga.revision, u64::MAX);
    }
}
