//! The retry state machine.
//!
//! All state lives in the [`ErrorTracker`] and in the transport's delivery-count
//! header; the step itself re-evaluates every delivery from scratch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use postbus_core::{
    BusError, CapturedError, HandlerError, TransactionContext, Transport, TransportMessage, headers,
};
use postbus_pipeline::{
    DispatchAsFailedMessage, IncomingStep, IncomingStepContext, Next, clear_outgoing,
    take_dead_letter_request,
};

use crate::error_handler::{DeadLetterErrorHandler, ErrorHandler};
use crate::error_tracker::{ErrorTracker, InMemoryErrorTracker};
use crate::fail_fast::{DefaultFailFastChecker, FailFastChecker};
use crate::report::FailureReport;
use crate::settings::{ErrorHandlerInvocation, RetryStrategySettings};

/// Id under which second-level failures of `message_id` are tracked.
pub fn second_level_id(message_id: &str) -> String {
    format!("{message_id}-2nd-level")
}

/// Reap period for trackings that go stale after `max_age`.
fn reaper_interval(max_age: Duration) -> Duration {
    (max_age / 2).max(Duration::from_millis(10))
}

/// Ids a tracking belongs to, for logging and cleanup.
struct Ids {
    primary: String,
    second_level: String,
}

/// Failure boundary around the rest of the incoming pipeline.
///
/// Decides, for every delivery, whether the message is handled, retried,
/// re-dispatched as a failed message, or handed to the [`ErrorHandler`].
pub struct RetryStep {
    settings: RetryStrategySettings,
    tracker: Arc<dyn ErrorTracker>,
    fail_fast: Arc<dyn FailFastChecker>,
    error_handler: Arc<dyn ErrorHandler>,
    shutdown: CancellationToken,
}

impl RetryStep {
    pub fn new(
        settings: RetryStrategySettings,
        tracker: Arc<dyn ErrorTracker>,
        fail_fast: Arc<dyn FailFastChecker>,
        error_handler: Arc<dyn ErrorHandler>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            settings,
            tracker,
            fail_fast,
            error_handler,
            shutdown,
        }
    }

    /// In-memory tracking with its reaper, default fail-fast policy, forwarding
    /// to the error queue through `transport`.
    pub fn with_dead_letter_queue(
        settings: RetryStrategySettings,
        transport: Arc<dyn Transport>,
        shutdown: CancellationToken,
    ) -> Self {
        let tracker = Arc::new(InMemoryErrorTracker::from_settings(&settings));
        let error_handler = Arc::new(DeadLetterErrorHandler::new(
            transport,
            &settings,
            shutdown.clone(),
        ));
        Self::with_in_memory_tracker(
            settings,
            tracker,
            Arc::new(DefaultFailFastChecker::new()),
            error_handler,
            shutdown,
        )
    }

    /// Like [`new`](Self::new), and also starts the tracker's reaper, which runs
    /// until `shutdown` fires. Must be called inside a tokio runtime for the
    /// reaper to start.
    pub fn with_in_memory_tracker(
        settings: RetryStrategySettings,
        tracker: Arc<InMemoryErrorTracker>,
        fail_fast: Arc<dyn FailFastChecker>,
        error_handler: Arc<dyn ErrorHandler>,
        shutdown: CancellationToken,
    ) -> Self {
        if tokio::runtime::Handle::try_current().is_ok() {
            tracker.spawn_reaper(reaper_interval(tracker.max_age()), shutdown.clone());
        } else {
            warn!("no tokio runtime; stale error trackings will not be reaped");
        }
        Self::new(settings, tracker, fail_fast, error_handler, shutdown)
    }

    pub fn settings(&self) -> &RetryStrategySettings {
        &self.settings
    }

    pub fn tracker(&self) -> &Arc<dyn ErrorTracker> {
        &self.tracker
    }

    fn is_shutdown(&self, error: &HandlerError) -> bool {
        error.is_cancellation() && self.shutdown.is_cancelled()
    }

    fn combined_errors(&self, ids: &Ids) -> Vec<CapturedError> {
        let mut errors = self.tracker.get_exceptions(&ids.primary);
        errors.extend(self.tracker.get_exceptions(&ids.second_level));
        errors
    }

    /// Hand the message to the error handler. On success the message is
    /// acknowledged without committing and the given trackings are dropped; on
    /// failure it is rolled back with tracking intact.
    async fn dead_letter(
        &self,
        message: TransportMessage,
        transaction: &dyn TransactionContext,
        report: FailureReport,
        clean_up: &[&str],
    ) {
        let message_id = message.message_id().unwrap_or_default().to_string();
        match self
            .error_handler
            .handle_poison_message(message, transaction, &report)
            .await
        {
            Ok(()) => {
                for id in clean_up {
                    self.tracker.clean_up(id);
                }
                transaction.set_result(false, true);
            }
            Err(err) => {
                error!(message_id = %message_id, error = %err, "error handler failed; message will be retried");
                transaction.set_result(false, false);
            }
        }
    }

    /// Success path shared by first- and second-level dispatch.
    async fn complete(
        &self,
        message: TransportMessage,
        transaction: &dyn TransactionContext,
        ids: &Ids,
        budget_id: &str,
    ) {
        if let Some(request) = take_dead_letter_request(transaction) {
            debug!(message_id = %ids.primary, reason = %request.reason, "handler requested dead-lettering");
            let report = FailureReport::single(CapturedError::synthetic("ManualDeadLetter", request.reason));
            if let Err(err) = self
                .error_handler
                .handle_poison_message(message, transaction, &report)
                .await
            {
                error!(message_id = %ids.primary, error = %err, "could not dead-letter on request; message will be retried");
                transaction.set_result(false, false);
                return;
            }
        }

        transaction.set_result(true, true);

        if transaction.supports_eager_commit() {
            if let Err(err) = transaction.commit_eagerly().await {
                warn!(message_id = %ids.primary, error = %err, "eager commit failed");
                self.tracker
                    .register_error(budget_id, CapturedError::capture(&HandlerError::from(err)));
                transaction.set_result(false, false);
                return;
            }
        }

        self.tracker.clean_up(&ids.primary);
        self.tracker.clean_up(&ids.second_level);
    }

    async fn handle_failure(
        &self,
        context: &IncomingStepContext,
        next: Next<'_>,
        message: TransportMessage,
        transaction: &dyn TransactionContext,
        ids: &Ids,
        failure: HandlerError,
    ) -> Result<(), HandlerError> {
        let captured = CapturedError::capture(&failure);
        let invocation = self.settings.error_handler_invocation();

        if self.fail_fast.should_fail_fast(&ids.primary, &failure) {
            warn!(message_id = %ids.primary, error = %failure, "fail-fast error while handling message");
            let first_failure = self.tracker.get_exceptions(&ids.primary).is_empty();
            self.tracker.mark_as_final(&ids.primary);
            self.tracker.register_error(&ids.primary, captured.clone());

            if invocation == ErrorHandlerInvocation::NextDelivery {
                transaction.set_result(false, false);
                return Ok(());
            }
            if self.settings.second_level_retries() && first_failure {
                return self
                    .dispatch_second_level(context, next, message, transaction, ids)
                    .await;
            }
            self.dead_letter(
                message,
                transaction,
                FailureReport::single(captured),
                &[ids.primary.as_str()],
            )
            .await;
            return Ok(());
        }

        self.tracker.register_error(&ids.primary, captured);
        let attempts = self.tracker.get_exceptions(&ids.primary).len();
        warn!(
            message_id = %ids.primary,
            attempt = attempts,
            max_attempts = self.settings.max_delivery_attempts(),
            error = %failure,
            "unhandled error while handling message"
        );

        if !self.tracker.has_failed_too_many_times(&ids.primary)
            || invocation == ErrorHandlerInvocation::NextDelivery
        {
            transaction.set_result(false, false);
            return Ok(());
        }

        if self.settings.second_level_retries() {
            return self
                .dispatch_second_level(context, next, message, transaction, ids)
                .await;
        }

        let report = FailureReport::new(self.tracker.get_exceptions(&ids.primary));
        self.dead_letter(message, transaction, report, &[ids.primary.as_str()])
            .await;
        Ok(())
    }

    /// Re-run the pipeline with the message wrapped as a failed message.
    async fn dispatch_second_level(
        &self,
        context: &IncomingStepContext,
        next: Next<'_>,
        message: TransportMessage,
        transaction: &dyn TransactionContext,
        ids: &Ids,
    ) -> Result<(), HandlerError> {
        debug!(message_id = %ids.primary, "dispatching as failed message");
        clear_outgoing(transaction);
        context.save(DispatchAsFailedMessage);

        let failure = match next.run(context).await {
            Ok(()) => {
                self.complete(message, transaction, ids, &ids.second_level)
                    .await;
                return Ok(());
            }
            Err(failure) if self.is_shutdown(&failure) => {
                transaction.set_result(false, false);
                return Err(failure);
            }
            Err(failure) => failure,
        };

        if self.fail_fast.should_fail_fast(&ids.second_level, &failure) {
            self.tracker.mark_as_final(&ids.second_level);
        }
        self.tracker
            .register_error(&ids.second_level, CapturedError::capture(&failure));
        warn!(
            message_id = %ids.primary,
            attempt = self.tracker.get_exceptions(&ids.second_level).len(),
            error = %failure,
            "unhandled error while handling failed message"
        );

        let exhausted = self.tracker.has_failed_too_many_times(&ids.second_level);
        if exhausted && self.settings.error_handler_invocation() == ErrorHandlerInvocation::Immediately {
            let report = FailureReport::new(self.combined_errors(ids));
            self.dead_letter(
                message,
                transaction,
                report,
                &[ids.primary.as_str(), ids.second_level.as_str()],
            )
            .await;
        } else {
            transaction.set_result(false, false);
        }
        Ok(())
    }
}

#[async_trait]
impl IncomingStep for RetryStep {
    async fn process(&self, context: &IncomingStepContext, next: Next<'_>) -> Result<(), HandlerError> {
        let transaction = context
            .transaction_context()
            .ok_or(BusError::MissingTransactionContext)?;
        let transaction = transaction.as_ref();
        let message = context
            .transport_message()
            .ok_or(BusError::MissingTransportMessage)?;

        let Some(message_id) = message.message_id().map(str::to_string) else {
            let report = FailureReport::single(CapturedError::synthetic(
                "MissingMessageId",
                format!(
                    "received message without a '{}' header; it cannot be tracked across deliveries",
                    headers::MESSAGE_ID
                ),
            ));
            error!("received message without a message id");
            self.dead_letter(message, transaction, report, &[]).await;
            return Ok(());
        };
        let ids = Ids {
            second_level: second_level_id(&message_id),
            primary: message_id,
        };

        if let Some(count) = message.delivery_count() {
            let max = self.settings.effective_max_delivery_attempts();
            if count > max {
                let mut errors = self.combined_errors(&ids);
                if errors.is_empty() {
                    errors.push(CapturedError::synthetic(
                        "DeliveryCountExceeded",
                        format!("message was delivered {count} times, which exceeds the maximum of {max}"),
                    ));
                }
                self.dead_letter(
                    message,
                    transaction,
                    FailureReport::new(errors),
                    &[ids.primary.as_str(), ids.second_level.as_str()],
                )
                .await;
                return Ok(());
            }
        }

        if self.tracker.has_failed_too_many_times(&ids.primary) {
            if !self.settings.second_level_retries() {
                let report = FailureReport::new(self.tracker.get_exceptions(&ids.primary));
                self.dead_letter(message, transaction, report, &[ids.primary.as_str()])
                    .await;
                return Ok(());
            }
            if self.tracker.has_failed_too_many_times(&ids.second_level) {
                let report = FailureReport::new(self.combined_errors(&ids));
                self.dead_letter(
                    message,
                    transaction,
                    report,
                    &[ids.primary.as_str(), ids.second_level.as_str()],
                )
                .await;
                return Ok(());
            }
            return self
                .dispatch_second_level(context, next, message, transaction, &ids)
                .await;
        }

        match next.run(context).await {
            Ok(()) => {
                self.complete(message, transaction, &ids, &ids.primary).await;
                Ok(())
            }
            Err(failure) if self.is_shutdown(&failure) => {
                debug!(message_id = %ids.primary, "handling cancelled by shutdown");
                transaction.set_result(false, false);
                Err(failure)
            }
            Err(failure) => {
                self.handle_failure(context, next, message, transaction, &ids, failure)
                    .await
            }
        }
    }
}
