//! In-memory queues for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::BusError;
use crate::headers;
use crate::message::TransportMessage;
use crate::transport::Transport;

/// A set of named FIFO queues.
///
/// - No IO
/// - Sending to a queue that was never created fails, like a real broker would
#[derive(Debug, Default)]
pub struct InMemoryNetwork {
    queues: Mutex<HashMap<String, VecDeque<TransportMessage>>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue (idempotent).
    pub fn create_queue(&self, name: &str) {
        self.queues.lock().entry(name.to_string()).or_default();
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.lock().contains_key(name)
    }

    pub fn deliver(&self, destination: &str, message: TransportMessage) -> Result<(), BusError> {
        let mut queues = self.queues.lock();
        let queue = queues.get_mut(destination).ok_or_else(|| {
            BusError::transport(format!("destination queue '{destination}' does not exist"))
        })?;
        queue.push_back(message);
        Ok(())
    }

    pub fn receive(&self, queue: &str) -> Option<TransportMessage> {
        self.queues.lock().get_mut(queue)?.pop_front()
    }

    pub fn count(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map_or(0, VecDeque::len)
    }

    /// Copies of the messages currently waiting in a queue, front first.
    pub fn snapshot(&self, queue: &str) -> Vec<TransportMessage> {
        self.queues
            .lock()
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Transport bound to one input queue of an [`InMemoryNetwork`].
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    network: Arc<InMemoryNetwork>,
    address: String,
}

impl InMemoryTransport {
    /// Create the transport, creating its input queue if needed.
    pub fn new(network: Arc<InMemoryNetwork>, address: impl Into<String>) -> Self {
        let address = address.into();
        network.create_queue(&address);
        Self { network, address }
    }

    pub fn network(&self) -> &Arc<InMemoryNetwork> {
        &self.network
    }

    /// Take the next message from the input queue.
    pub fn receive(&self) -> Option<TransportMessage> {
        self.network.receive(&self.address)
    }

    /// Put a message back for redelivery, bumping its native delivery count.
    pub fn requeue(&self, mut message: TransportMessage) -> Result<(), BusError> {
        let count = message.delivery_count().unwrap_or(1);
        message
            .headers_mut()
            .insert(headers::DELIVERY_COUNT.to_string(), (count + 1).to_string());
        self.network.deliver(&self.address, message)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn address(&self) -> &str {
        &self.address
    }

    async fn send(&self, destination: &str, message: TransportMessage) -> Result<(), BusError> {
        self.network.deliver(destination, message)
    }
}
