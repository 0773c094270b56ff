//! Saga error types.

use common::{ExecutionId, StepId};
use execution_store::{StoreError, Version};
use thiserror::Error;

use crate::state::SagaStatus;

/// Malformed definitions and writer conflicts.
///
/// These are fatal: they surface immediately and are never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A definition was built without steps.
    #[error("Saga definition '{saga}' has no steps")]
    EmptyDefinition { saga: String },

    /// Two steps of a definition share an identifier.
    #[error("Saga definition '{saga}' contains duplicate step '{step}'")]
    DuplicateStep { saga: String, step: StepId },

    /// Another writer updated the execution concurrently.
    #[error(
        "Conflicting writer for execution {execution_id}: expected version {expected}, found {actual}"
    )]
    ConcurrentWriter {
        execution_id: ExecutionId,
        expected: Version,
        actual: Version,
    },

    /// A stored execution belongs to a different definition.
    #[error("Execution {execution_id} belongs to saga '{stored}', not '{supplied}'")]
    DefinitionMismatch {
        execution_id: ExecutionId,
        stored: String,
        supplied: String,
    },

    /// The execution is already being driven by this executor.
    #[error("Execution {0} is already running")]
    AlreadyRunning(ExecutionId),

    /// An executor setting could not be parsed or is out of range.
    #[error("Invalid setting {key}={value}: {reason}")]
    InvalidSetting {
        key: String,
        value: String,
        reason: String,
    },
}

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Persistence store error.
    #[error("Store error: {0}")]
    Store(StoreError),

    /// No execution with this id is known.
    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    /// The concurrency limit is reached and the executor rejects new work.
    #[error("Admission rejected: {limit} executions already running")]
    AdmissionRejected { limit: usize },

    /// The status machine does not allow the requested transition.
    #[error("Invalid saga transition from {from} to {to}")]
    InvalidTransition { from: SagaStatus, to: SagaStatus },

    /// The execution stopped before reaching a terminal status.
    #[error("Execution {execution_id} aborted: {reason}")]
    Aborted {
        execution_id: ExecutionId,
        reason: String,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for SagaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConcurrencyConflict {
                execution_id,
                expected,
                actual,
            } => SagaError::Config(ConfigError::ConcurrentWriter {
                execution_id,
                expected,
                actual,
            }),
            StoreError::ExecutionNotFound(id) => SagaError::ExecutionNotFound(id),
            other => SagaError::Store(other),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
