//! Saga state contract.

use serde::Serialize;
use serde::de::DeserializeOwned;

use postbus_core::SagaId;

/// Name of the identity property. Lookups by this property go straight to the
/// data table instead of the correlation index.
pub const ID_PROPERTY: &str = "id";

/// Persistent state of one workflow instance.
///
/// The whole value is serialized as the payload; `id` and `revision` are also
/// stored in their own columns. Callers assign the id before the first insert;
/// the store owns the revision.
pub trait SagaData: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> SagaId;

    fn set_id(&mut self, id: SagaId);

    /// Optimistic-concurrency token, bumped on every successful update.
    fn revision(&self) -> u64;

    fn set_revision(&mut self, revision: u64);

    /// Short name used as the saga type in the correlation index.
    fn saga_type_name() -> String {
        short_type_name::<Self>()
    }
}

/// Last path segment of the Rust type name, generics included.
pub fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    let short = base.rsplit("::").next().unwrap_or(base);
    format!("{}{}", short, &full[base.len()..])
}

/// A property of the saga data that incoming messages correlate on.
///
/// Nested fields use dotted paths, e.g. `"customer.email"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationProperty {
    path: String,
}

impl CorrelationProperty {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// The identity property.
    pub fn id() -> Self {
        Self::new(ID_PROPERTY)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_id(&self) -> bool {
        self.path == ID_PROPERTY
    }
}

impl From<&str> for CorrelationProperty {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}
