//! Shared identifier types for the saga execution engine.

mod types;

pub use types::{ExecutionId, IdempotencyKey, StepId};
