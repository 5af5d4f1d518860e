//! Saga persistence: the [`SagaData`] contract, correlation-index computation
//! and the [`SagaStore`] interface, plus an in-memory store.
//!
//! The relational store lives in `postbus-infra`.

pub mod correlation;
pub mod data;
pub mod error;
pub mod in_memory;
pub mod store;

pub use correlation::{
    IndexEntry, MAX_CORRELATION_KEY_LENGTH, MAX_CORRELATION_VALUE_LENGTH, MAX_SAGA_TYPE_LENGTH,
    index_entries, saga_type_name, stringify,
};
pub use data::{CorrelationProperty, ID_PROPERTY, SagaData, short_type_name};
pub use error::{SagaStoreError, SagaStoreResult};
pub use in_memory::InMemorySagaStore;
pub use store::SagaStore;
