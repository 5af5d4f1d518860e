//! Outgoing messages queued during handling.
//!
//! Handlers never send directly; they queue messages in the transaction items and
//! the receiving worker sends them once the transaction commits. A failed attempt
//! therefore sends nothing.

use parking_lot::Mutex;

use postbus_core::{TransactionContext, TransportMessage};

const OUTGOING_MESSAGES_KEY: &str = "postbus.outgoing-messages";

/// A message waiting for the transaction to commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub destination: String,
    pub message: TransportMessage,
}

#[derive(Debug, Default)]
struct OutgoingMessages(Mutex<Vec<OutgoingMessage>>);

/// Queue a message to be sent when the transaction commits.
pub fn queue_outgoing(
    transaction: &dyn TransactionContext,
    destination: impl Into<String>,
    message: TransportMessage,
) {
    let queue = transaction
        .items()
        .get_or_insert_with(OUTGOING_MESSAGES_KEY, OutgoingMessages::default);
    queue.0.lock().push(OutgoingMessage {
        destination: destination.into(),
        message,
    });
}

/// Number of messages currently queued.
pub fn outgoing_count(transaction: &dyn TransactionContext) -> usize {
    transaction
        .items()
        .get::<OutgoingMessages>(OUTGOING_MESSAGES_KEY)
        .map_or(0, |queue| queue.0.lock().len())
}

/// Drop everything queued so far.
pub fn clear_outgoing(transaction: &dyn TransactionContext) {
    if let Some(queue) = transaction.items().get::<OutgoingMessages>(OUTGOING_MESSAGES_KEY) {
        queue.0.lock().clear();
    }
}

/// Remove and return everything queued so far.
pub fn take_outgoing(transaction: &dyn TransactionContext) -> Vec<OutgoingMessage> {
    transaction
        .items()
        .get::<OutgoingMessages>(OUTGOING_MESSAGES_KEY)
        .map(|queue| std::mem::take(&mut *queue.0.lock()))
        .unwrap_or_default()
}
