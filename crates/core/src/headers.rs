//! Well-known transport header names.

/// Logical message id; must be stable across delivery attempts.
pub const MESSAGE_ID: &str = "postbus-msg-id";

/// Native delivery count, set by transports that track redeliveries themselves.
pub const DELIVERY_COUNT: &str = "postbus-delivery-count";

/// Full textual history of the errors that caused a message to be dead-lettered.
pub const ERROR_DETAILS: &str = "postbus-error-details";

/// Address of the queue the message was received from before dead-lettering.
pub const SOURCE_QUEUE: &str = "postbus-source-queue";
