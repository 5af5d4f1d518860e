use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use postbus_core::Headers;

/// A deserialized message on its way to the handlers.
///
/// The body is type-erased; handlers recover it with [`body_as`](Self::body_as).
#[derive(Clone)]
pub struct LogicalMessage {
    headers: Headers,
    body: Arc<dyn Any + Send + Sync>,
    body_type: &'static str,
}

impl LogicalMessage {
    pub fn new<M>(headers: Headers, body: M) -> Self
    where
        M: Any + Send + Sync,
    {
        Self::from_shared(headers, Arc::new(body))
    }

    pub fn from_shared<M>(headers: Headers, body: Arc<M>) -> Self
    where
        M: Any + Send + Sync,
    {
        Self {
            headers,
            body,
            body_type: std::any::type_name::<M>(),
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.body
    }

    /// `TypeId` of the concrete body (not of the `Arc` around it).
    pub fn body_type_id(&self) -> TypeId {
        Any::type_id(&*self.body)
    }

    pub fn body_type_name(&self) -> &'static str {
        self.body_type
    }

    pub fn body_as<M>(&self) -> Option<Arc<M>>
    where
        M: Any + Send + Sync,
    {
        self.body.clone().downcast::<M>().ok()
    }
}

impl fmt::Debug for LogicalMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalMessage")
            .field("headers", &self.headers)
            .field("body_type", &self.body_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct OrderPlaced {
        order: u32,
    }

    #[test]
    fn body_as_recovers_concrete_type() {
        let msg = LogicalMessage::new(Headers::new(), OrderPlaced { order: 7 });

        assert_eq!(msg.body_type_id(), TypeId::of::<OrderPlaced>());
        assert_eq!(msg.body_as::<OrderPlaced>().as_deref(), Some(&OrderPlaced { order: 7 }));
        assert!(msg.body_as::<String>().is_none());
        assert!(msg.body_type_name().ends_with("OrderPlaced"));
    }
}
