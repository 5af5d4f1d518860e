//! Transport abstraction (mechanics only).
//!
//! The retry pipeline only needs to know where it is receiving from and how to
//! forward a message somewhere else; queue systems implement the rest.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BusError;
use crate::message::TransportMessage;

/// Sending side of a queue transport.
///
/// Sends are immediate: they are not enlisted in the receive transaction. Work that
/// must only happen on commit goes through the outgoing-message queue instead.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Address of the input queue this transport receives from.
    fn address(&self) -> &str;

    async fn send(&self, destination: &str, message: TransportMessage) -> Result<(), BusError>;
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn address(&self) -> &str {
        (**self).address()
    }

    async fn send(&self, destination: &str, message: TransportMessage) -> Result<(), BusError> {
        (**self).send(destination, message).await
    }
}
