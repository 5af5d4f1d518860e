//! Infrastructure layer: relational saga storage and message workers.

pub mod sql;
pub mod workers;
