//! Disposal of poison messages.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use postbus_core::{BusError, TransactionContext, Transport, TransportMessage, headers};

use crate::report::FailureReport;
use crate::settings::RetryStrategySettings;

#[derive(Debug, Error)]
pub enum ErrorHandlerError {
    #[error("could not forward message {message_id} to error queue {queue}: {source}")]
    Forward {
        message_id: String,
        queue: String,
        #[source]
        source: BusError,
    },
}

/// Receives messages that failed permanently.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    /// Dispose of `message`. Returning an error leaves the message in the input
    /// queue for another attempt.
    async fn handle_poison_message(
        &self,
        message: TransportMessage,
        transaction: &dyn TransactionContext,
        report: &FailureReport,
    ) -> Result<(), ErrorHandlerError>;
}

/// Forwards poison messages to the error queue.
///
/// The copy carries the failure description in [`headers::ERROR_DETAILS`] and the
/// input queue address in [`headers::SOURCE_QUEUE`].
pub struct DeadLetterErrorHandler {
    transport: Arc<dyn Transport>,
    error_queue: String,
    details_max_length: usize,
    cooldown: Duration,
    shutdown: CancellationToken,
}

impl DeadLetterErrorHandler {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: &RetryStrategySettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            error_queue: settings.error_queue().to_string(),
            details_max_length: settings.error_details_header_max_length(),
            cooldown: settings.error_queue_cooldown(),
            shutdown,
        }
    }

    pub fn error_queue(&self) -> &str {
        &self.error_queue
    }

    fn truncate(&self, details: String) -> String {
        match details.char_indices().nth(self.details_max_length) {
            Some((cut, _)) => details[..cut].to_string(),
            None => details,
        }
    }
}

#[async_trait]
impl ErrorHandler for DeadLetterErrorHandler {
    async fn handle_poison_message(
        &self,
        mut message: TransportMessage,
        _transaction: &dyn TransactionContext,
        report: &FailureReport,
    ) -> Result<(), ErrorHandlerError> {
        let message_id = message.message_id().unwrap_or("<unknown>").to_string();
        let details = self.truncate(report.description());

        let headers = message.headers_mut();
        headers.insert(headers::ERROR_DETAILS.to_string(), details);
        headers.insert(
            headers::SOURCE_QUEUE.to_string(),
            self.transport.address().to_string(),
        );

        error!(
            message_id = %message_id,
            error_queue = %self.error_queue,
            failures = report.count(),
            "moving message to error queue"
        );

        match self.transport.send(&self.error_queue, message).await {
            Ok(()) => Ok(()),
            Err(source) => {
                error!(
                    message_id = %message_id,
                    error_queue = %self.error_queue,
                    error = %source,
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "could not forward message to error queue"
                );
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        info!(message_id = %message_id, "error queue cooldown cut short by shutdown");
                    }
                    _ = tokio::time::sleep(self.cooldown) => {}
                }
                Err(ErrorHandlerError::Forward {
                    message_id,
                    queue: self.error_queue.clone(),
                    source,
                })
            }
        }
    }
}
