//! Policy deciding which failures skip the retry budget.

use std::fmt;

use postbus_core::{FailFastError, HandlerError};

/// Whether `error` raised while handling `message_id` should never be retried.
///
/// Called on every failure; keep it cheap and side-effect free.
pub trait FailFastChecker: Send + Sync {
    fn should_fail_fast(&self, message_id: &str, error: &HandlerError) -> bool;
}

impl<F> FailFastChecker for F
where
    F: Fn(&str, &HandlerError) -> bool + Send + Sync,
{
    fn should_fail_fast(&self, message_id: &str, error: &HandlerError) -> bool {
        self(message_id, error)
    }
}

type Matcher = Box<dyn Fn(&HandlerError) -> bool + Send + Sync>;

/// Fails fast on [`FailFastError`] plus any error types registered with
/// [`fail_fast_on`](Self::fail_fast_on).
#[derive(Default)]
pub struct DefaultFailFastChecker {
    matchers: Vec<(&'static str, Matcher)>,
}

impl DefaultFailFastChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_fast_on<E>(mut self) -> Self
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.matchers
            .push((std::any::type_name::<E>(), Box::new(|error| error.is::<E>())));
        self
    }
}

impl FailFastChecker for DefaultFailFastChecker {
    fn should_fail_fast(&self, _message_id: &str, error: &HandlerError) -> bool {
        error.is::<FailFastError>() || self.matchers.iter().any(|(_, matches)| matches(error))
    }
}

impl fmt::Debug for DefaultFailFastChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types: Vec<_> = self.matchers.iter().map(|(name, _)| *name).collect();
        f.debug_struct("DefaultFailFastChecker")
            .field("fail_fast_on", &types)
            .finish()
    }
}
