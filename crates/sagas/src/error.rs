use thiserror::Error;

use postbus_core::SagaId;

pub type SagaStoreResult<T> = Result<T, SagaStoreError>;

/// Saga persistence error.
#[derive(Debug, Error)]
pub enum SagaStoreError {
    /// Another writer got there first (duplicate id, stale revision, or a
    /// correlation value already claimed by another instance). Reload and retry.
    #[error("concurrency conflict on saga {saga_id}: {reason}")]
    Concurrency { saga_id: SagaId, reason: String },

    /// A stored payload could not be deserialized.
    #[error("saga {saga_id} could not be deserialized: {source}")]
    Corruption {
        saga_id: SagaId,
        #[source]
        source: serde_json::Error,
    },

    /// The store or the saga type is misconfigured (table collision, type name
    /// too long for the index).
    #[error("saga store configuration error: {0}")]
    Configuration(String),

    /// The saga value cannot be stored as given.
    #[error("invalid saga data: {0}")]
    InvalidSaga(String),

    /// The underlying storage failed.
    #[error("saga storage error: {0}")]
    Storage(String),
}

impl SagaStoreError {
    pub fn concurrency(saga_id: SagaId, reason: impl Into<String>) -> Self {
        Self::Concurrency {
            saga_id,
            reason: reason.into(),
        }
    }

    pub fn is_concurrency(&self) -> bool {
        matches!(self, Self::Concurrency { .. })
    }
}
