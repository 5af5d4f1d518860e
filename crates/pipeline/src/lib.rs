//! Incoming-message pipeline contract.
//!
//! Steps are composed into an [`IncomingPipeline`]; the retry step, the
//! failed-message wrapper and the handler invokers are all ordinary steps.

pub mod context;
pub mod dead_letter;
pub mod message;
pub mod outgoing;
pub mod step;

pub use context::{DispatchAsFailedMessage, IncomingStepContext};
pub use dead_letter::{ManualDeadLetter, request_dead_letter, take_dead_letter_request};
pub use message::LogicalMessage;
pub use outgoing::{
    OutgoingMessage, clear_outgoing, outgoing_count, queue_outgoing, take_outgoing,
};
pub use step::{HandlerFn, IncomingPipeline, IncomingStep, Next};
