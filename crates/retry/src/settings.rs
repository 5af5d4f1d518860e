//! Retry strategy configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default error queue name.
pub const DEFAULT_ERROR_QUEUE: &str = "error";

/// Default number of delivery attempts before a message is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Default age after which idle error trackings are dropped.
pub const DEFAULT_ERROR_TRACKING_MAX_AGE: Duration = Duration::from_secs(10 * 60);

/// Default pause after a failed forward to the error queue.
pub const DEFAULT_ERROR_QUEUE_COOLDOWN: Duration = Duration::from_secs(10);

/// Lower bound for the tracking age.
pub const MIN_ERROR_TRACKING_MAX_AGE: Duration = Duration::from_secs(60);

/// When the error handler is invoked after a message exhausts its attempts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandlerInvocation {
    /// In the same delivery attempt that detected the terminal failure.
    #[default]
    Immediately,
    /// In the following delivery attempt, before any handler runs.
    ///
    /// Needed when the queue transaction and the handlers' work share one
    /// physical transaction: the failed attempt rolls back cleanly and the
    /// dead-letter forward happens in an attempt with no failed work in it.
    NextDelivery,
}

/// Invalid retry configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("error queue name must not be blank")]
    BlankErrorQueue,

    #[error("error tracking max age must be at least {min:?}, got {actual:?}")]
    TrackingAgeTooShort { min: Duration, actual: Duration },

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Immutable, validated retry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryStrategySettings {
    error_queue: String,
    max_delivery_attempts: u32,
    second_level_retries: bool,
    error_details_header_max_length: usize,
    error_tracking_max_age: Duration,
    error_queue_cooldown: Duration,
    invocation: ErrorHandlerInvocation,
}

impl Default for RetryStrategySettings {
    fn default() -> Self {
        Self {
            error_queue: DEFAULT_ERROR_QUEUE.to_string(),
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
            second_level_retries: false,
            error_details_header_max_length: usize::MAX,
            error_tracking_max_age: DEFAULT_ERROR_TRACKING_MAX_AGE,
            error_queue_cooldown: DEFAULT_ERROR_QUEUE_COOLDOWN,
            invocation: ErrorHandlerInvocation::Immediately,
        }
    }
}

impl RetryStrategySettings {
    pub fn builder() -> RetryStrategySettingsBuilder {
        RetryStrategySettingsBuilder::default()
    }

    /// Defaults overridden by `POSTBUS_*` environment variables.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the `POSTBUS_*` keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();

        if let Some(queue) = lookup("POSTBUS_ERROR_QUEUE") {
            builder = builder.with_error_queue(queue);
        }
        if let Some(attempts) = lookup("POSTBUS_MAX_DELIVERY_ATTEMPTS") {
            builder = builder.with_max_delivery_attempts(parse("POSTBUS_MAX_DELIVERY_ATTEMPTS", &attempts)?);
        }
        if let Some(enabled) = lookup("POSTBUS_SECOND_LEVEL_RETRIES") {
            builder = builder.with_second_level_retries(parse("POSTBUS_SECOND_LEVEL_RETRIES", &enabled)?);
        }
        if let Some(len) = lookup("POSTBUS_ERROR_DETAILS_MAX_LENGTH") {
            builder = builder.with_error_details_header_max_length(parse("POSTBUS_ERROR_DETAILS_MAX_LENGTH", &len)?);
        }
        if let Some(secs) = lookup("POSTBUS_ERROR_TRACKING_MAX_AGE_SECS") {
            let secs: u64 = parse("POSTBUS_ERROR_TRACKING_MAX_AGE_SECS", &secs)?;
            builder = builder.with_error_tracking_max_age(Duration::from_secs(secs));
        }
        if let Some(secs) = lookup("POSTBUS_ERROR_QUEUE_COOLDOWN_SECS") {
            let secs: u64 = parse("POSTBUS_ERROR_QUEUE_COOLDOWN_SECS", &secs)?;
            builder = builder.with_error_queue_cooldown(Duration::from_secs(secs));
        }
        if let Some(mode) = lookup("POSTBUS_ERROR_HANDLER_INVOCATION") {
            let invocation = match mode.trim().to_ascii_lowercase().as_str() {
                "immediately" => ErrorHandlerInvocation::Immediately,
                "next_delivery" | "nextdelivery" => ErrorHandlerInvocation::NextDelivery,
                _ => {
                    return Err(SettingsError::InvalidValue {
                        key: "POSTBUS_ERROR_HANDLER_INVOCATION".to_string(),
                        value: mode,
                    });
                }
            };
            builder = builder.with_error_handler_invocation(invocation);
        }

        builder.build()
    }

    pub fn error_queue(&self) -> &str {
        &self.error_queue
    }

    pub fn max_delivery_attempts(&self) -> u32 {
        self.max_delivery_attempts
    }

    pub fn second_level_retries(&self) -> bool {
        self.second_level_retries
    }

    pub fn error_details_header_max_length(&self) -> usize {
        self.error_details_header_max_length
    }

    pub fn error_tracking_max_age(&self) -> Duration {
        self.error_tracking_max_age
    }

    pub fn error_queue_cooldown(&self) -> Duration {
        self.error_queue_cooldown
    }

    pub fn error_handler_invocation(&self) -> ErrorHandlerInvocation {
        self.invocation
    }

    /// Delivery-count ceiling: doubled with second-level retries, since the same
    /// logical message is attempted once as itself and once wrapped.
    pub fn effective_max_delivery_attempts(&self) -> u32 {
        if self.second_level_retries {
            self.max_delivery_attempts.saturating_mul(2)
        } else {
            self.max_delivery_attempts
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SettingsError> {
    value.trim().parse().map_err(|_| SettingsError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Builder for [`RetryStrategySettings`]; validation happens in [`build`](Self::build).
#[derive(Debug, Clone, Default)]
pub struct RetryStrategySettingsBuilder {
    settings: RetryStrategySettings,
}

impl RetryStrategySettingsBuilder {
    pub fn with_error_queue(mut self, queue: impl Into<String>) -> Self {
        self.settings.error_queue = queue.into();
        self
    }

    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.settings.max_delivery_attempts = attempts;
        self
    }

    pub fn with_second_level_retries(mut self, enabled: bool) -> Self {
        self.settings.second_level_retries = enabled;
        self
    }

    pub fn with_error_details_header_max_length(mut self, len: usize) -> Self {
        self.settings.error_details_header_max_length = len;
        self
    }

    pub fn with_error_tracking_max_age(mut self, age: Duration) -> Self {
        self.settings.error_tracking_max_age = age;
        self
    }

    pub fn with_error_queue_cooldown(mut self, cooldown: Duration) -> Self {
        self.settings.error_queue_cooldown = cooldown;
        self
    }

    pub fn with_error_handler_invocation(mut self, invocation: ErrorHandlerInvocation) -> Self {
        self.settings.invocation = invocation;
        self
    }

    pub fn build(self) -> Result<RetryStrategySettings, SettingsError> {
        let settings = self.settings;
        if settings.error_queue.trim().is_empty() {
            return Err(SettingsError::BlankErrorQueue);
        }
        if settings.error_tracking_max_age < MIN_ERROR_TRACKING_MAX_AGE {
            return Err(SettingsError::TrackingAgeTooShort {
                min: MIN_ERROR_TRACKING_MAX_AGE,
                actual: settings.error_tracking_max_age,
            });
        }
        Ok(settings)
    }
}

/// Serde mirror of the settings, for configuration files.
///
/// Durations are whole seconds; omitted fields keep their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettingsConfig {
    pub error_queue: Option<String>,
    pub max_delivery_attempts: Option<u32>,
    pub second_level_retries: Option<bool>,
    pub error_details_header_max_length: Option<usize>,
    pub error_tracking_max_age_secs: Option<u64>,
    pub error_queue_cooldown_secs: Option<u64>,
    pub error_handler_invocation: Option<ErrorHandlerInvocation>,
}

impl TryFrom<RetrySettingsConfig> for RetryStrategySettings {
    type Error = SettingsError;

    fn try_from(config: RetrySettingsConfig) -> Result<Self, Self::Error> {
        let mut builder = RetryStrategySettings::builder();
        if let Some(queue) = config.error_queue {
            builder = builder.with_error_queue(queue);
        }
        if let Some(attempts) = config.max_delivery_attempts {
            builder = builder.with_max_delivery_attempts(attempts);
        }
        if let Some(enabled) = config.second_level_retries {
            builder = builder.with_second_level_retries(enabled);
        }
        if let Some(len) = config.error_details_header_max_length {
            builder = builder.with_error_details_header_max_length(len);
        }
        if let Some(secs) = config.error_tracking_max_age_secs {
            builder = builder.with_error_tracking_max_age(Duration::from_secs(secs));
        }
        if let Some(secs) = config.error_queue_cooldown_secs {
            builder = builder.with_error_queue_cooldown(Duration::from_secs(secs));
        }
        if let Some(invocation) = config.error_handler_invocation {
            builder = builder.with_error_handler_invocation(invocation);
        }
        builder.build()
    }
}
