//! Process-wide tracing setup shared by services embedding the bus.

/// Tracing configuration (filters, formatter).
pub mod tracing;

pub use crate::tracing::{DEFAULT_FILTER, init, init_with_filter};
