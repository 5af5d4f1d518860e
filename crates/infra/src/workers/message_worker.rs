use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use postbus_core::{
    BusError, InMemoryTransactionContext, InMemoryTransport, TransactionOutcome, Transport,
};
use postbus_pipeline::{IncomingPipeline, IncomingStepContext, take_outgoing};

/// Configuration for a [`MessageWorker`].
#[derive(Debug, Clone)]
pub struct MessageWorkerConfig {
    pub name: String,
    /// Wait between polls while the input queue is empty.
    pub poll_interval: Duration,
}

impl Default for MessageWorkerConfig {
    fn default() -> Self {
        Self {
            name: "message-worker".to_string(),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl MessageWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Handle to control and join a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.join.await {
            error!(error = %err, "message worker task ended abnormally");
        }
    }
}

/// Receive loop over one input queue.
///
/// - Each message runs through the pipeline inside a fresh transaction
/// - Commit sends the queued outgoing messages
/// - No ack puts the message back with its delivery count bumped
pub struct MessageWorker {
    transport: Arc<InMemoryTransport>,
    pipeline: Arc<IncomingPipeline>,
    config: MessageWorkerConfig,
}

impl MessageWorker {
    pub fn new(
        transport: Arc<InMemoryTransport>,
        pipeline: Arc<IncomingPipeline>,
        config: MessageWorkerConfig,
    ) -> Self {
        Self {
            transport,
            pipeline,
            config,
        }
    }

    pub fn config(&self) -> &MessageWorkerConfig {
        &self.config
    }

    /// Handle the next waiting message, if any, and return the applied outcome.
    ///
    /// A transaction that never recorded a result is rolled back.
    pub async fn process_next(&self) -> Result<Option<TransactionOutcome>, BusError> {
        let Some(message) = self.transport.receive() else {
            return Ok(None);
        };

        let transaction = Arc::new(InMemoryTransactionContext::new());
        let context = IncomingStepContext::new(message.clone(), transaction.clone());
        if let Err(err) = self.pipeline.invoke(&context).await {
            warn!(
                worker = %self.config.name,
                message_id = message.message_id().unwrap_or_default(),
                error = %err,
                "pipeline returned an error"
            );
        }

        let outcome = transaction.outcome().unwrap_or(TransactionOutcome::ROLLED_BACK);
        if outcome.commit {
            for outgoing in take_outgoing(transaction.as_ref()) {
                if let Err(err) = self.transport.send(&outgoing.destination, outgoing.message).await {
                    error!(
                        worker = %self.config.name,
                        destination = %outgoing.destination,
                        error = %err,
                        "could not send outgoing message, returning received message for redelivery"
                    );
                    self.transport.requeue(message)?;
                    return Err(err);
                }
            }
        }
        if !outcome.ack {
            self.transport.requeue(message)?;
        }

        debug!(
            worker = %self.config.name,
            commit = outcome.commit,
            ack = outcome.ack,
            "message processed"
        );
        Ok(Some(outcome))
    }

    /// Process messages until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        debug!(worker = %self.config.name, "message worker started");
        while !shutdown.is_cancelled() {
            match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => warn!(worker = %self.config.name, error = %err, "message worker iteration failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        debug!(worker = %self.config.name, "message worker stopped");
    }

    /// Run the worker on a tokio task.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> WorkerHandle {
        let token = shutdown.clone();
        let join = tokio::spawn(async move { self.run(token).await });
        WorkerHandle { shutdown, join }
    }
}
