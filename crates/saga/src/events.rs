//! Saga lifecycle events reported to the event sink.

use chrono::{DateTime, Utc};
use common::{ExecutionId, IdempotencyKey, StepId};
use serde::{Deserialize, Serialize};

use crate::execution::{FailureDetail, StepResult};

/// An event of one execution, with the metadata every event carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaEvent {
    pub execution_id: ExecutionId,
    pub saga_name: String,
    pub occurred_at: DateTime<Utc>,
    pub kind: SagaEventKind,
}

impl SagaEvent {
    pub fn new(execution_id: ExecutionId, saga_name: impl Into<String>, kind: SagaEventKind) -> Self {
        Self {
            execution_id,
            saga_name: saga_name.into(),
            occurred_at: Utc::now(),
            kind,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}

/// Events that can occur during saga execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEventKind {
    /// Pending → Running.
    SagaStarted(SagaStartedData),

    /// A forward attempt is about to run.
    StepStarted(StepAttemptData),

    /// A forward step succeeded.
    StepSucceeded(StepResult),

    /// A forward attempt failed, and may be retried.
    StepFailed(StepFailedData),

    /// Running → Compensating.
    SagaCompensating(FailureDetail),

    /// A compensation attempt is about to run.
    CompensationStarted(StepAttemptData),

    /// A compensation succeeded.
    CompensationSucceeded(StepResult),

    /// A compensation attempt failed, and may be retried.
    CompensationFailed(StepFailedData),

    /// Running → Completed.
    SagaCompleted(SagaCompletedData),

    /// Compensating → Compensated.
    SagaCompensated(SagaCompensatedData),

    /// Compensating → Failed.
    SagaFailed(SagaFailedData),
}

impl SagaEventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaEventKind::SagaStarted(_) => "SagaStarted",
            SagaEventKind::StepStarted(_) => "StepStarted",
            SagaEventKind::StepSucceeded(_) => "StepSucceeded",
            SagaEventKind::StepFailed(_) => "StepFailed",
            SagaEventKind::SagaCompensating(_) => "SagaCompensating",
            SagaEventKind::CompensationStarted(_) => "CompensationStarted",
            SagaEventKind::CompensationSucceeded(_) => "CompensationSucceeded",
            SagaEventKind::CompensationFailed(_) => "CompensationFailed",
            SagaEventKind::SagaCompleted(_) => "SagaCompleted",
            SagaEventKind::SagaCompensated(_) => "SagaCompensated",
            SagaEventKind::SagaFailed(_) => "SagaFailed",
        }
    }

    /// Returns the step this event is about, if any.
    pub fn step_id(&self) -> Option<&StepId> {
        match self {
            SagaEventKind::StepStarted(data) | SagaEventKind::CompensationStarted(data) => {
                Some(&data.step_id)
            }
            SagaEventKind::StepSucceeded(result) | SagaEventKind::CompensationSucceeded(result) => {
                Some(&result.step_id)
            }
            SagaEventKind::StepFailed(data) | SagaEventKind::CompensationFailed(data) => {
                Some(&data.step_id)
            }
            _ => None,
        }
    }
}

/// Data for SagaStarted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStartedData {
    /// Number of steps in the definition.
    pub step_count: usize,
}

/// Data for step/compensation started events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAttemptData {
    pub step_id: StepId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub idempotency_key: IdempotencyKey,
}

/// Data for step/compensation failed events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailedData {
    pub step_id: StepId,
    pub attempt: u32,
    pub reason: String,
    /// True if another attempt follows.
    pub will_retry: bool,
    /// Final result, set on the last failed attempt.
    pub result: Option<StepResult>,
}

/// Data for SagaCompleted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaCompletedData {
    pub step_count: usize,
}

/// Data for SagaCompensated event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaCompensatedData {
    pub failure: Option<FailureDetail>,
    pub compensated: Vec<StepId>,
}

/// Data for SagaFailed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaFailedData {
    pub failure: Option<FailureDetail>,
    /// Steps whose compensation did not complete.
    pub failed_compensations: Vec<StepId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::FailureKind;

    fn attempt(step: &str) -> StepAttemptData {
        StepAttemptData {
            step_id: StepId::new(step),
            attempt: 1,
            idempotency_key: IdempotencyKey::new("k"),
        }
    }

    #[test]
    fn test_event_type() {
        let failure = FailureDetail {
            step_id: Some(StepId::new("ship")),
            kind: FailureKind::PermanentFailure,
            reason: "no carrier".to_string(),
        };

        assert_eq!(
            SagaEventKind::SagaStarted(SagaStartedData { step_count: 3 }).event_type(),
            "SagaStarted"
        );
        assert_eq!(
            SagaEventKind::StepStarted(attempt("reserve")).event_type(),
            "StepStarted"
        );
        assert_eq!(
            SagaEventKind::CompensationStarted(attempt("reserve")).event_type(),
            "CompensationStarted"
        );
        assert_eq!(
            SagaEventKind::SagaCompensating(failure.clone()).event_type(),
            "SagaCompensating"
        );
        assert_eq!(
            SagaEventKind::SagaFailed(SagaFailedData {
                failure: Some(failure),
                failed_compensations: vec![StepId::new("charge")],
            })
            .event_type(),
            "SagaFailed"
        );
    }

    #[test]
    fn test_step_id_accessor() {
        assert_eq!(
            SagaEventKind::StepStarted(attempt("reserve")).step_id(),
            Some(&StepId::new("reserve"))
        );
        assert_eq!(
            SagaEventKind::SagaCompleted(SagaCompletedData { step_count: 1 }).step_id(),
            None
        );
    }

    #[test]
    fn test_serialized_shape() {
        let event = SagaEvent::new(
            ExecutionId::new(),
            "checkout",
            SagaEventKind::StepFailed(StepFailedData {
                step_id: StepId::new("charge"),
                attempt: 2,
                reason: "timeout".to_string(),
                will_retry: true,
                result: None,
            }),
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"]["type"], "StepFailed");
        assert_eq!(json["saga_name"], "checkout");
        assert_eq!(json["kind"]["data"]["step_id"], "charge");
        assert_eq!(json["kind"]["data"]["will_retry"], true);

        let deserialized: SagaEvent = serde_json::from_value(json).unwrap();
        assert_eq!(deserialized.event_type(), "StepFailed");
        assert_eq!(deserialized.execution_id, event.execution_id);
    }
}
