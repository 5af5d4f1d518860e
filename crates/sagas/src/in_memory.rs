use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use postbus_core::SagaId;

use crate::correlation::{IndexEntry, index_entries, saga_type_name, stringify};
use crate::data::{CorrelationProperty, ID_PROPERTY, SagaData};
use crate::error::{SagaStoreError, SagaStoreResult};
use crate::store::SagaStore;

#[derive(Debug, Clone)]
struct StoredSaga {
    revision: u64,
    data: Value,
}

type IndexKey = (String, String, String);

#[derive(Debug, Default)]
struct State {
    sagas: HashMap<SagaId, StoredSaga>,
    index: HashMap<IndexKey, SagaId>,
}

impl State {
    fn remove_index_entries(&mut self, saga_id: SagaId) {
        self.index.retain(|_, id| *id != saga_id);
    }

    /// Claim `entries` for `saga_id`; fails without changes if any triple is
    /// already claimed by another instance.
    fn claim(&mut self, saga_type: &str, saga_id: SagaId, entries: Vec<IndexEntry>) -> SagaStoreResult<()> {
        let keys: Vec<IndexKey> = entries
            .into_iter()
            .map(|entry| (saga_type.to_string(), entry.key, entry.value))
            .collect();
        if let Some((_, key, value)) = keys
            .iter()
            .find(|key| self.index.get(*key).is_some_and(|owner| *owner != saga_id))
        {
            return Err(SagaStoreError::concurrency(
                saga_id,
                format!("correlation value {key}={value} is already claimed by another {saga_type}"),
            ));
        }
        for key in keys {
            self.index.insert(key, saga_id);
        }
        Ok(())
    }
}

/// Process-local [`SagaStore`] with the same revision and uniqueness rules as the
/// relational store.
#[derive(Debug, Default)]
pub struct InMemorySagaStore {
    state: Mutex<State>,
    index_nulls: bool,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index missing and null correlation values as the empty string.
    pub fn with_null_indexing(mut self) -> Self {
        self.index_nulls = true;
        self
    }

    pub fn len(&self) -> usize {
        self.state.lock().sagas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn decode<D: SagaData>(saga_id: SagaId, stored: &StoredSaga) -> SagaStoreResult<D> {
        let mut saga: D = serde_json::from_value(stored.data.clone())
            .map_err(|source| SagaStoreError::Corruption { saga_id, source })?;
        saga.set_revision(stored.revision);
        Ok(saga)
    }

    fn encode<D: SagaData>(saga: &D) -> SagaStoreResult<Value> {
        serde_json::to_value(saga)
            .map_err(|e| SagaStoreError::InvalidSaga(format!("could not serialize saga {}: {e}", saga.id())))
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn find<D: SagaData>(&self, property: &str, value: &Value) -> SagaStoreResult<Option<D>> {
        let value = match stringify(value) {
            Some(value) => value,
            None if self.index_nulls && property != ID_PROPERTY => String::new(),
            None => return Ok(None),
        };
        let state = self.state.lock();

        let saga_id = if property == ID_PROPERTY {
            match SagaId::from_str(&value) {
                Ok(id) => Some(id),
                Err(_) => return Ok(None),
            }
        } else {
            let key = (saga_type_name::<D>()?, property.to_string(), value);
            state.index.get(&key).copied()
        };

        match saga_id.and_then(|id| state.sagas.get(&id).map(|stored| (id, stored))) {
            Some((id, stored)) => Self::decode(id, stored).map(Some),
            None => Ok(None),
        }
    }

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
        let entries = index_entries(saga, correlation_properties, self.index_nulls)?;
        let data = Self::encode(saga)?;

        let mut state = self.state.lock();
        if state.sagas.contains_key(&saga_id) {
            return Err(SagaStoreError::concurrency(saga_id, "an instance with this id already exists"));
        }
        state.claim(&saga_type, saga_id, entries)?;
        state.sagas.insert(
            saga_id,
            StoredSaga {
                revision: saga.revision(),
                data,
            },
        );
        debug!(saga_id = %saga_id, saga_type = %saga_type, "inserted saga");
        Ok(())
    }

    async fn update<D: SagaData>(
        &self,
        saga: &mut D,
        correlation_properties: &[CorrelationProperty],
    ) -> SagaStoreResult<()> {
        let saga_id = saga.id();
        let saga_type = saga_type_name::<D>()?;
        let revision = saga.revision();
        let next_revision = revision.checked_add(1).ok_or_else(|| {
            SagaStoreError::InvalidSaga(format!("revision of saga {saga_id} cannot be incremented past {revision}"))
        })?;
        saga.set_revision(next_revision);

        let result = (|| {
            let entries = index_entries(&*saga, correlation_properties, self.index_nulls)?;
            let data = Self::encode(&*saga)?;

            let mut state = self.state.lock();
            match state.sagas.get(&saga_id) {
                Some(stored) if stored.revision == revision => {}
                _ => {
                    return Err(SagaStoreError::concurrency(
                        saga_id,
                        format!("expected revision {revision} was not found"),
                    ));
                }
            }

            let previous: Vec<(IndexKey, SagaId)> = state
                .index
                .iter()
                .filter(|(_, id)| **id == saga_id)
                .map(|(key, id)| (key.clone(), *id))
                .collect();
            state.remove_index_entries(saga_id);
            if let Err(err) = state.claim(&saga_type, saga_id, entries) {
                state.index.extend(previous);
                return Err(err);
            }
            state.sagas.insert(
                saga_id,
                StoredSaga {
                    revision: next_revision,
                    data,
                },
            );
            Ok(())
        })();

        if result.is_err() {
            saga.set_revision(revision);
        }
        result
    }

    async fn delete<D: SagaData>(&self, saga: &D) -> SagaStoreResult<()> {
        let saga_id = saga.id();
        let mut state = self.state.lock();
        match state.sagas.get(&saga_id) {
            Some(stored) if stored.revision == saga.revision() => {}
            _ => {
                return Err(SagaStoreError::concurrency(
                    saga_id,
                    format!("expected revision {} was not found", saga.revision()),
                ));
            }
        }
        state.sagas.remove(&saga_id);
        state.remove_index_entries(saga_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderSaga {
        id: SagaId,
        revision: u64,
        order_id: String,
        shipped: bool,
    }

    impl SagaData for OrderSaga {
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

    fn order(order_id: &str) -> OrderSaga {
        OrderSaga {
            id: SagaId::new(),
            revision: 0,
            order_id: order_id.to_string(),
            shipped: false,
        }
    }

    fn props() -> Vec<CorrelationProperty> {
        vec![CorrelationProperty::new("order_id")]
    }

    #[tokio::test]
    async fn insert_then_find_by_id_and_correlation() {
        let store = InMemorySagaStore::new();
        let saga = order("A");
        store.insert(&saga, &props()).await.unwrap();

        let by_id: OrderSaga = store.find(ID_PROPERTY, &json!(saga.id.to_string())).await.unwrap().unwrap();
        let by_order: OrderSaga = store.find("order_id", &json!("A")).await.unwrap().unwrap();
        assert_eq!(by_id, saga);
        assert_eq!(by_order, saga);
        assert!(store.find::<OrderSaga>("order_id", &json!("B")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_requires_an_id() {
        let store = InMemorySagaStore::new();
        let mut saga = order("A");
        saga.set_id(SagaId::nil());
        assert!(matches!(store.insert(&saga, &props()).await, Err(SagaStoreError::InvalidSaga(_))));
    }

    #[tokio::test]
    async fn duplicate_id_is_a_concurrency_error() {
        let store = InMemorySagaStore::new();
        let first = order("A");
        let mut second = order("B");
        second.id = first.id;

        store.insert(&first, &props()).await.unwrap();
        assert!(store.insert(&second, &props()).await.unwrap_err().is_concurrency());

        let found: OrderSaga = store.find(ID_PROPERTY, &json!(first.id.to_string())).await.unwrap().unwrap();
        assert_eq!(found.order_id, "A");
    }

    #[tokio::test]
    async fn correlation_values_are_unique_per_type() {
        let store = InMemorySagaStore::new();
        store.insert(&order("A"), &props()).await.unwrap();
        assert!(store.insert(&order("A"), &props()).await.unwrap_err().is_concurrency());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn stale_update_fails_and_restores_revision() {
        let store = InMemorySagaStore::new();
        let saga = order("A");
        store.insert(&saga, &props()).await.unwrap();

        let mut first = saga.clone();
        let mut second = saga.clone();
        store.update(&mut first, &props()).await.unwrap();
        assert_eq!(first.revision, 1);

        let err = store.update(&mut second, &props()).await.unwrap_err();
        assert!(err.is_concurrency());
        assert_eq!(second.revision, 0);
    }

    #[tokio::test]
    async fn update_replaces_index_entries() {
        let store = InMemorySagaStore::new();
        let mut saga = order("A");
        store.insert(&saga, &props()).await.unwrap();

        saga.order_id = "B".into();
        store.update(&mut saga, &props()).await.unwrap();

        assert!(store.find::<OrderSaga>("order_id", &json!("A")).await.unwrap().is_none());
        let found: OrderSaga = store.find("order_id", &json!("B")).await.unwrap().unwrap();
        assert_eq!(found.revision, 1);
    }

    #[tokio::test]
    async fn delete_checks_revision_and_drops_index() {
        let store = InMemorySagaStore::new();
        let mut saga = order("A");
        store.insert(&saga, &props()).await.unwrap();
        let stale = saga.clone();
        store.update(&mut saga, &props()).await.unwrap();

        assert!(store.delete(&stale).await.unwrap_err().is_concurrency());
        store.delete(&saga).await.unwrap();
        assert!(store.is_empty());
        assert!(store.find::<OrderSaga>("order_id", &json!("A")).await.unwrap().is_none());

        store.insert(&order("A"), &props()).await.unwrap();
    }

    #[tokio::test]
    async fn update_at_the_last_revision_is_rejected() {
        let store = InMemorySagaStore::new();
        let mut saga = order("A");
        saga.revision = u64::MAX;
        store.insert(&saga, &props()).await.unwrap();

        let err = store.update(&mut saga, &props()).await.unwrap_err();

        assert!(matches!(err, SagaStoreError::InvalidSaga(_)));
        assert_eq!(saga.revision, u64::MAX);
    }
}
