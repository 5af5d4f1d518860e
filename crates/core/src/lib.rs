//! `postbus-core`: message bus building blocks.
//!
//! This crate contains the primitives shared by the pipeline, retry and saga
//! crates (no storage or queue-system concerns).

pub mod captured;
pub mod error;
pub mod headers;
pub mod id;
pub mod in_memory_transport;
pub mod items;
pub mod message;
pub mod transaction;
pub mod transport;

pub use captured::CapturedError;
pub use error::{
    ApplicationError, BusError, FailFastError, HandlerError, OperationCancelled,
};
pub use id::SagaId;
pub use in_memory_transport::{InMemoryNetwork, InMemoryTransport};
pub use items::Items;
pub use message::{Headers, TransportMessage};
pub use transaction::{InMemoryTransactionContext, TransactionContext, TransactionOutcome};
pub use transport::Transport;
