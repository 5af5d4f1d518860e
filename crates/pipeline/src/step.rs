//! Incoming pipeline mechanics.
//!
//! A pipeline is an ordered list of steps; each step receives the shared context
//! and a [`Next`] handle for the remainder of the pipeline. A step may run `next`
//! zero, one or several times (the retry step re-runs it for second-level retries).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use postbus_core::HandlerError;

use crate::context::IncomingStepContext;

/// One stage of the incoming-message pipeline.
#[async_trait]
pub trait IncomingStep: Send + Sync {
    async fn process(&self, context: &IncomingStepContext, next: Next<'_>) -> Result<(), HandlerError>;
}

/// The steps following the current one.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    steps: &'a [Arc<dyn IncomingStep>],
}

impl<'a> Next<'a> {
    pub fn new(steps: &'a [Arc<dyn IncomingStep>]) -> Self {
        Self { steps }
    }

    /// Run the remaining steps. Finishing the list is a success.
    pub async fn run(self, context: &IncomingStepContext) -> Result<(), HandlerError> {
        match self.steps.split_first() {
            Some((step, rest)) => step.process(context, Next::new(rest)).await,
            None => Ok(()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").field("remaining", &self.steps.len()).finish()
    }
}

/// An assembled incoming pipeline.
#[derive(Clone, Default)]
pub struct IncomingPipeline {
    steps: Vec<Arc<dyn IncomingStep>>,
}

impl IncomingPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step.
    pub fn with_step(mut self, step: impl IncomingStep + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn with_shared_step(mut self, step: Arc<dyn IncomingStep>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub async fn invoke(&self, context: &IncomingStepContext) -> Result<(), HandlerError> {
        Next::new(&self.steps).run(context).await
    }
}

impl fmt::Debug for IncomingPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingPipeline").field("steps", &self.steps.len()).finish()
    }
}

/// Adapter turning an async closure into a terminal step (tests, simple handlers).
pub struct HandlerFn<F> {
    handler: F,
}

impl<F> HandlerFn<F> {
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F, Fut> IncomingStep for HandlerFn<F>
where
    F: Fn(&IncomingStepContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send,
{
    async fn process(&self, context: &IncomingStepContext, next: Next<'_>) -> Result<(), HandlerError> {
        (self.handler)(context).await?;
        next.run(context).await
    }
}
