//! Saga persistence contract.

use async_trait::async_trait;
use serde_json::Value;

use crate::data::{CorrelationProperty, SagaData};
use crate::error::SagaStoreResult;

/// Durable storage of saga instances with optimistic concurrency.
///
/// Conflicts are always reported as [`SagaStoreError::Concurrency`] and never
/// retried internally; the caller re-handles the message.
///
/// [`SagaStoreError::Concurrency`]: crate::error::SagaStoreError::Concurrency
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Instance of `D` whose `property` equals `value`.
    ///
    /// Looking up [`ID_PROPERTY`](crate::data::ID_PROPERTY) goes by instance id;
    /// any other property goes through the correlation index.
    async fn find<D: SagaData>(&self, property: &str, value: &Value) -> SagaStoreResult<Option<D>>;

    /// Store a new instance. The id must already be assigned.
    async fn insert<D: SagaData>(
        &self,
        saga: &D,
        correlation_properties: &[CorrelationProperty],
    ) -> SagaStoreResult<()>;

    /// Store a new revision of `saga`; on success its revision is incremented,
    /// on failure it is left as it was.
    async fn update<D: SagaData>(
        &self,
        saga: &mut D,
        correlation_properties: &[CorrelationProperty],
    ) -> SagaStoreResult<()>;

    /// Remove the instance and its index entries.
    async fn delete<D: SagaData>(&self, saga: &D) -> SagaStoreResult<()>;
}
