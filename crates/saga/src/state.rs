//! Saga status machine.

use serde::{Deserialize, Serialize};

/// The status of a saga execution in its lifecycle.
///
/// Status transitions:
/// ```text
/// Pending ──► Running ──┬──► Completed
///                       └──► Compensating ──┬──► Compensated
///                                           └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaStatus {
    /// Submitted, waiting for admission.
    #[default]
    Pending,

    /// Forward steps are being executed.
    Running,

    /// A step failed (or the execution was cancelled) and completed steps are being undone.
    Compensating,

    /// All steps succeeded (terminal state).
    Completed,

    /// Every necessary compensation succeeded (terminal state).
    Compensated,

    /// At least one compensation failed irrecoverably (terminal state).
    ///
    /// The system is inconsistent and needs external remediation.
    Failed,
}

impl SagaStatus {
    /// Returns true if the machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        matches!(
            (self, next),
            (SagaStatus::Pending, SagaStatus::Running)
                | (SagaStatus::Running, SagaStatus::Completed)
                | (SagaStatus::Running, SagaStatus::Compensating)
                | (SagaStatus::Compensating, SagaStatus::Compensated)
                | (SagaStatus::Compensating, SagaStatus::Failed)
        )
    }

    /// Returns true if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed
        )
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "Pending",
            SagaStatus::Running => "Running",
            SagaStatus::Compensating => "Compensating",
            SagaStatus::Completed => "Completed",
            SagaStatus::Compensated => "Compensated",
            SagaStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
