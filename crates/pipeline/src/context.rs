//! Per-message pipeline state.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use postbus_core::{TransactionContext, TransportMessage};

/// Type-keyed state bag for one trip through the incoming pipeline.
///
/// Steps publish values for the steps after them with [`save`](Self::save) and read
/// them with [`load`](Self::load); there is at most one value per type.
#[derive(Default)]
pub struct IncomingStepContext {
    state: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl IncomingStepContext {
    /// Context seeded with the received message and its transaction.
    pub fn new(message: TransportMessage, transaction: Arc<dyn TransactionContext>) -> Self {
        let context = Self::default();
        context.save(message);
        context.save(transaction);
        context
    }

    pub fn save<T>(&self, value: T)
    where
        T: Any + Send + Sync,
    {
        self.state.lock().insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn load<T>(&self) -> Option<T>
    where
        T: Any + Send + Sync + Clone,
    {
        self.state
            .lock()
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    pub fn take<T>(&self) -> Option<T>
    where
        T: Any + Send + Sync,
    {
        let value = self.state.lock().remove(&TypeId::of::<T>())?;
        value.downcast::<T>().ok().map(|boxed| *boxed)
    }

    pub fn contains<T>(&self) -> bool
    where
        T: Any + Send + Sync,
    {
        self.state.lock().contains_key(&TypeId::of::<T>())
    }

    pub fn transport_message(&self) -> Option<TransportMessage> {
        self.load::<TransportMessage>()
    }

    pub fn transaction_context(&self) -> Option<Arc<dyn TransactionContext>> {
        self.load::<Arc<dyn TransactionContext>>()
    }
}

impl fmt::Debug for IncomingStepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingStepContext")
            .field("entries", &self.state.lock().len())
            .finish()
    }
}

/// Marker telling downstream steps to dispatch the message wrapped as a failed
/// message (second-level retry).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct DispatchAsFailedMessage;
