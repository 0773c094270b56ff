use thiserror::Error;

use crate::{ExecutionId, Version};

/// Errors that can occur when interacting with the persistence store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored version did not match the version the writer expected.
    #[error(
        "Concurrency conflict for execution {execution_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        execution_id: ExecutionId,
        expected: Version,
        actual: Version,
    },

    /// No record exists for the execution.
    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for persistence store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
