//! String-keyed bag for passing state between pipeline stages.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

type Item = Arc<dyn Any + Send + Sync>;

/// Thread-safe heterogeneous item bag.
///
/// Values are stored behind `Arc`, so readers get shared handles; values that must
/// be mutated in place should carry their own interior mutability.
#[derive(Default)]
pub struct Items {
    entries: Mutex<HashMap<String, Item>>,
}

impl Items {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a value.
    pub fn insert<T>(&self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.entries.lock().insert(key.into(), Arc::new(value));
    }

    /// Fetch a value; `None` when the key is absent or holds another type.
    pub fn get<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let item = self.entries.lock().get(key).cloned()?;
        item.downcast::<T>().ok()
    }

    /// Fetch a value, inserting the result of `init` first when absent.
    ///
    /// An existing value of a different type is replaced.
    pub fn get_or_insert_with<T, F>(&self, key: &str, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(key).cloned() {
            if let Ok(typed) = existing.downcast::<T>() {
                return typed;
            }
        }
        let value = Arc::new(init());
        entries.insert(key.to_string(), value.clone());
        value
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Remove a value, returning whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }
}

impl fmt::Debug for Items {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        let mut keys: Vec<_> = entries.keys().collect();
        keys.sort();
        f.debug_struct("Items").field("keys", &keys).finish()
    }
}
