//! The failed-message envelope used by second-level retries.
//!
//! When the retry step re-dispatches a message as failed, the
//! [`FailedMessageWrapperStep`] swaps the deserialized body `M` for a
//! [`Failed<M>`] so handlers can subscribe to the failure explicitly.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use postbus_core::{BusError, CapturedError, HandlerError, Headers, headers};
use postbus_pipeline::{DispatchAsFailedMessage, IncomingStep, IncomingStepContext, LogicalMessage, Next};

use crate::error_tracker::ErrorTracker;
use crate::report::FailureReport;
use crate::retry_step::second_level_id;

/// What every failed-message envelope exposes, whatever it wraps.
pub trait FailedMessage: Send + Sync {
    /// The original message body.
    fn message(&self) -> &(dyn Any + Send + Sync);

    fn message_type_name(&self) -> &'static str;

    /// Aggregate description of the failures so far.
    fn error_description(&self) -> &str;

    /// Headers of the original message.
    fn headers(&self) -> &Headers;

    /// Captured failures, oldest first.
    fn exceptions(&self) -> &[CapturedError];
}

/// A message of type `M` whose handling failed.
pub struct Failed<M> {
    message: Arc<M>,
    error_description: String,
    headers: Headers,
    exceptions: Vec<CapturedError>,
}

impl<M> Failed<M> {
    pub fn new(message: Arc<M>, headers: Headers, exceptions: Vec<CapturedError>) -> Self {
        let error_description = FailureReport::new(exceptions.clone()).description();
        Self {
            message,
            error_description,
            headers,
            exceptions,
        }
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn error_description(&self) -> &str {
        &self.error_description
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn exceptions(&self) -> &[CapturedError] {
        &self.exceptions
    }
}

impl<M> FailedMessage for Failed<M>
where
    M: Any + Send + Sync,
{
    fn message(&self) -> &(dyn Any + Send + Sync) {
        &*self.message
    }

    fn message_type_name(&self) -> &'static str {
        std::any::type_name::<M>()
    }

    fn error_description(&self) -> &str {
        &self.error_description
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn exceptions(&self) -> &[CapturedError] {
        &self.exceptions
    }
}

impl<M: fmt::Debug> fmt::Debug for Failed<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failed")
            .field("message", &self.message)
            .field("exceptions", &self.exceptions.len())
            .finish()
    }
}

type Wrapper = fn(&LogicalMessage, Vec<CapturedError>) -> Option<(LogicalMessage, Arc<dyn FailedMessage>)>;

fn wrap_as<M>(
    message: &LogicalMessage,
    exceptions: Vec<CapturedError>,
) -> Option<(LogicalMessage, Arc<dyn FailedMessage>)>
where
    M: Any + Send + Sync,
{
    let body = message.body_as::<M>()?;
    let failed = Arc::new(Failed::new(body, message.headers().clone(), exceptions));
    let wrapped = LogicalMessage::from_shared(message.headers().clone(), Arc::clone(&failed));
    let failed: Arc<dyn FailedMessage> = failed;
    Some((wrapped, failed))
}

/// Per-type envelope factories, keyed by the body's `TypeId`.
///
/// Bodies of unregistered types are wrapped as `Failed<LogicalMessage>`.
#[derive(Clone, Default)]
pub struct FailedMessageWrappers {
    wrappers: HashMap<TypeId, Wrapper>,
}

impl FailedMessageWrappers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap bodies of type `M` as `Failed<M>`.
    pub fn register<M>(mut self) -> Self
    where
        M: Any + Send + Sync,
    {
        self.wrappers.insert(TypeId::of::<M>(), wrap_as::<M>);
        self
    }

    pub fn is_registered(&self, type_id: TypeId) -> bool {
        self.wrappers.contains_key(&type_id)
    }

    /// Wrap `message`, returning the new logical message and a type-erased view
    /// of the envelope.
    pub fn wrap(
        &self,
        message: &LogicalMessage,
        exceptions: Vec<CapturedError>,
    ) -> (LogicalMessage, Arc<dyn FailedMessage>) {
        if let Some(wrapper) = self.wrappers.get(&message.body_type_id()) {
            if let Some(wrapped) = wrapper(message, exceptions.clone()) {
                return wrapped;
            }
        }
        let failed = Arc::new(Failed::new(
            Arc::new(message.clone()),
            message.headers().clone(),
            exceptions,
        ));
        let wrapped = LogicalMessage::from_shared(message.headers().clone(), Arc::clone(&failed));
        let failed: Arc<dyn FailedMessage> = failed;
        (wrapped, failed)
    }
}

impl fmt::Debug for FailedMessageWrappers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailedMessageWrappers")
            .field("registered", &self.wrappers.len())
            .finish()
    }
}

/// Replaces the deserialized message with its failed envelope on second-level
/// dispatch. Runs after deserialization and before the handlers.
///
/// Also saves the envelope as `Arc<dyn FailedMessage>` for type-agnostic steps.
pub struct FailedMessageWrapperStep {
    wrappers: FailedMessageWrappers,
    tracker: Arc<dyn ErrorTracker>,
}

impl FailedMessageWrapperStep {
    pub fn new(wrappers: FailedMessageWrappers, tracker: Arc<dyn ErrorTracker>) -> Self {
        Self { wrappers, tracker }
    }
}

#[async_trait]
impl IncomingStep for FailedMessageWrapperStep {
    async fn process(&self, context: &IncomingStepContext, next: Next<'_>) -> Result<(), HandlerError> {
        if !context.contains::<DispatchAsFailedMessage>() {
            return next.run(context).await;
        }

        let message = context
            .load::<LogicalMessage>()
            .ok_or(BusError::MissingLogicalMessage)?;
        let message_id = message
            .headers()
            .get(headers::MESSAGE_ID)
            .cloned()
            .unwrap_or_default();

        let mut exceptions = self.tracker.get_exceptions(&message_id);
        exceptions.extend(self.tracker.get_exceptions(&second_level_id(&message_id)));

        let (wrapped, failed) = self.wrappers.wrap(&message, exceptions);
        debug!(
            message_id = %message_id,
            message_type = failed.message_type_name(),
            "dispatching failed message"
        );
        context.save(wrapped);
        context.save(failed);

        next.run(context).await
    }
}
