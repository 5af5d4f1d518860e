//! Transaction context threaded explicitly through every pipeline call.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::BusError;
use crate::items::Items;

/// Outcome requested for the receive transaction.
///
/// - `commit`: persist the work done while handling (outgoing messages, storage).
/// - `ack`: remove the received message from its queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransactionOutcome {
    pub commit: bool,
    pub ack: bool,
}

impl TransactionOutcome {
    /// Handling succeeded: commit the work and acknowledge the message.
    pub const COMMITTED: Self = Self {
        commit: true,
        ack: true,
    };

    /// Handling failed: discard the work and leave the message for redelivery.
    pub const ROLLED_BACK: Self = Self {
        commit: false,
        ack: false,
    };

    /// The message was dealt with by the error path: discard the work but
    /// acknowledge the message so it is not redelivered.
    pub const HANDLED: Self = Self {
        commit: false,
        ack: true,
    };
}

/// Unit of work surrounding the handling of one received message.
#[async_trait]
pub trait TransactionContext: Send + Sync {
    /// State shared between pipeline stages for the lifetime of the transaction.
    fn items(&self) -> &Items;

    /// Record the intended outcome; the last call wins.
    fn set_result(&self, commit: bool, ack: bool);

    /// Whether the context can commit before the pipeline returns.
    fn supports_eager_commit(&self) -> bool {
        false
    }

    /// Commit right away. Only called when [`supports_eager_commit`] is true.
    ///
    /// [`supports_eager_commit`]: TransactionContext::supports_eager_commit
    async fn commit_eagerly(&self) -> Result<(), BusError> {
        Ok(())
    }
}

/// Transaction context that only records what was asked of it.
#[derive(Debug, Default)]
pub struct InMemoryTransactionContext {
    items: Items,
    outcome: Mutex<Option<TransactionOutcome>>,
    eager_commit: bool,
    eager_commits: AtomicUsize,
}

impl InMemoryTransactionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise eager-commit support.
    pub fn with_eager_commit(mut self) -> Self {
        self.eager_commit = true;
        self
    }

    /// Outcome recorded by the last `set_result`, if any.
    pub fn outcome(&self) -> Option<TransactionOutcome> {
        *self.outcome.lock()
    }

    /// Number of eager commits performed.
    pub fn eager_commits(&self) -> usize {
        self.eager_commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionContext for InMemoryTransactionContext {
    fn items(&self) -> &Items {
        &self.items
    }

    fn set_result(&self, commit: bool, ack: bool) {
        *self.outcome.lock() = Some(TransactionOutcome { commit, ack });
    }

    fn supports_eager_commit(&self) -> bool {
        self.eager_commit
    }

    async fn commit_eagerly(&self) -> Result<(), BusError> {
        self.eager_commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_result_wins() {
        let tx = InMemoryTransactionContext::new();
        assert_eq!(tx.outcome(), None);

        tx.set_result(true, true);
        tx.set_result(false, true);
        assert_eq!(tx.outcome(), Some(TransactionOutcome::HANDLED));
    }

    #[tokio::test]
    async fn eager_commit_is_opt_in() {
        let plain = InMemoryTransactionContext::new();
        assert!(!plain.supports_eager_commit());

        let eager = InMemoryTransactionContext::new().with_eager_commit();
        assert!(eager.supports_eager_commit());
        eager.commit_eagerly().await.unwrap();
        assert_eq!(eager.eager_commits(), 1);
    }
}
