//! Retry and failure handling for incoming messages.
//!
//! [`RetryStep`] is the failure boundary around the handler pipeline. It counts
//! failures per message in an [`ErrorTracker`], consults a [`FailFastChecker`]
//! and, once a message is poison, hands it to an [`ErrorHandler`]. With
//! second-level retries enabled the message is re-dispatched as a [`Failed<M>`]
//! before it is given up on.

pub mod error_handler;
pub mod error_tracker;
pub mod fail_fast;
pub mod failed;
pub mod report;
pub mod retry_step;
pub mod settings;

pub use error_handler::{DeadLetterErrorHandler, ErrorHandler, ErrorHandlerError};
pub use error_tracker::{ErrorTracker, InMemoryErrorTracker};
pub use fail_fast::{DefaultFailFastChecker, FailFastChecker};
pub use failed::{Failed, FailedMessage, FailedMessageWrapperStep, FailedMessageWrappers};
pub use report::FailureReport;
pub use retry_step::{RetryStep, second_level_id};
pub use settings::{
    ErrorHandlerInvocation, RetrySettingsConfig, RetryStrategySettings,
    RetryStrategySettingsBuilder, SettingsError,
};
