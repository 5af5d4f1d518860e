//! Point-in-time snapshots of handler failures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HandlerError;

/// Snapshot of a failure, detached from the live error value.
///
/// Snapshots are what the error tracker keeps between delivery attempts and what
/// ends up in the error-details header of a dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedError {
    type_name: String,
    message: String,
    details: String,
    time: DateTime<Utc>,
}

impl CapturedError {
    /// Capture a handler error as of now.
    pub fn capture(error: &HandlerError) -> Self {
        Self::capture_at(error, Utc::now())
    }

    pub fn capture_at(error: &HandlerError, time: DateTime<Utc>) -> Self {
        Self {
            type_name: error.type_name().to_string(),
            message: error.to_string(),
            details: format!("{}: {}", error.type_name(), cause_chain(error)),
            time,
        }
    }

    /// A synthetic snapshot, for failures detected by the bus itself.
    pub fn synthetic(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        let type_name = type_name.into();
        let message = message.into();
        Self {
            details: format!("{type_name}: {message}"),
            type_name,
            message,
            time: Utc::now(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Type name, message and cause chain.
    pub fn details(&self) -> &str {
        &self.details
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// `"<timestamp>: <details>"`.
    pub fn full_description(&self) -> String {
        format!("{}: {}", self.time.to_rfc3339(), self.details)
    }
}

/// Messages of the error and its sources, outermost first. Never includes a backtrace.
fn cause_chain(error: &HandlerError) -> String {
    error
        .as_anyhow()
        .chain()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": caused by: ")
}
