//! Execution records: the per-submission state the executor mutates.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{ExecutionId, IdempotencyKey, StepId};
use execution_store::{ExecutionRecord, Version};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::state::SagaStatus;
use crate::step::{Outcome, OutcomeKind};

/// Record of one step (or one compensation) after its last attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    /// Number of attempts made, including the first.
    pub attempts: u32,
    /// Final outcome tag. Transient failures that ran out of retries are
    /// recorded as PermanentFailure.
    pub outcome: OutcomeKind,
    /// Failure reason, if the step failed.
    pub reason: Option<String>,
    /// Value returned by a successful attempt.
    pub output: Option<serde_json::Value>,
    /// Key passed to every attempt.
    pub idempotency_key: IdempotencyKey,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
}

impl StepResult {
    pub(crate) fn new(
        step_id: StepId,
        idempotency_key: IdempotencyKey,
        attempts: u32,
        outcome: Outcome,
        first_attempt_at: DateTime<Utc>,
        last_attempt_at: DateTime<Utc>,
    ) -> Self {
        let kind = outcome.kind();
        let (reason, output) = match outcome {
            Outcome::Success(value) => (None, Some(value)),
            Outcome::TransientFailure(reason) | Outcome::PermanentFailure(reason) => {
                (Some(reason), None)
            }
        };
        Self {
            step_id,
            attempts,
            outcome: kind,
            reason,
            output,
            idempotency_key,
            first_attempt_at,
            last_attempt_at,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == OutcomeKind::Success
    }
}

/// Why forward progress stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// A step returned PermanentFailure.
    PermanentFailure,
    /// A step kept failing transiently until its retry policy gave up.
    RetriesExhausted,
    /// The execution was cancelled.
    Cancelled,
}

/// What went wrong in a failed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    /// The step that failed. None when cancelled between steps.
    pub step_id: Option<StepId>,
    pub kind: FailureKind,
    pub reason: String,
}

/// State of one saga submission.
///
/// Owned by the executor task driving it. Once the status is terminal the
/// execution no longer changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaExecution {
    id: ExecutionId,
    saga_name: String,
    status: SagaStatus,
    input: serde_json::Value,
    step_results: Vec<StepResult>,
    compensation_results: Vec<StepResult>,
    failure: Option<FailureDetail>,
    failed_compensations: Vec<StepId>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip)]
    version: Version,
}

impl SagaExecution {
    /// Creates a pending execution of the named saga.
    pub fn new(saga_name: impl Into<String>, input: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: ExecutionId::new(),
            saga_name: saga_name.into(),
            status: SagaStatus::Pending,
            input,
            step_results: Vec::new(),
            compensation_results: Vec::new(),
            failure: None,
            failed_compensations: Vec::new(),
            created_at: now,
            updated_at: now,
            version: Version::initial(),
        }
    }

    /// Rebuilds an execution from its stored record.
    pub fn from_record(record: &ExecutionRecord) -> Result<Self> {
        let mut execution: SagaExecution = record.to_state()?;
        execution.version = record.version;
        Ok(execution)
    }

    /// Serializes the execution into a record for the store.
    pub fn to_record(&self) -> Result<ExecutionRecord> {
        Ok(ExecutionRecord::from_state(
            self.id,
            self.saga_name.clone(),
            self.status.as_str(),
            self.status.is_terminal(),
            self,
        )?)
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn saga_name(&self) -> &str {
        &self.saga_name
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn input(&self) -> &serde_json::Value {
        &self.input
    }

    /// Results of the forward steps attempted so far, in definition order.
    pub fn step_results(&self) -> &[StepResult] {
        &self.step_results
    }

    /// Results of the compensations attempted so far, in unwind order.
    pub fn compensation_results(&self) -> &[StepResult] {
        &self.compensation_results
    }

    pub fn step_result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_id == step_id)
    }

    pub fn failure(&self) -> Option<&FailureDetail> {
        self.failure.as_ref()
    }

    /// Steps whose compensation did not complete. Non-empty only when Failed.
    pub fn failed_compensations(&self) -> &[StepId] {
        &self.failed_compensations
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Store version this snapshot was read at (or last written as).
    pub fn version(&self) -> Version {
        self.version
    }

    /// Ids of succeeded forward steps, most recent first.
    pub fn unwind_order(&self) -> Vec<StepId> {
        self.step_results
            .iter()
            .rev()
            .filter(|r| r.succeeded())
            .map(|r| r.step_id.clone())
            .collect()
    }

    /// Outputs of the succeeded forward steps.
    pub fn outputs(&self) -> BTreeMap<StepId, serde_json::Value> {
        self.step_results
            .iter()
            .filter_map(|r| r.output.clone().map(|o| (r.step_id.clone(), o)))
            .collect()
    }

    /// Result of the step's compensation, if it was attempted.
    pub fn compensation_result(&self, step_id: &str) -> Option<&StepResult> {
        self.compensation_results
            .iter()
            .rev()
            .find(|r| r.step_id == step_id)
    }

    /// True if the step's compensation already succeeded.
    pub fn is_compensated(&self, step_id: &StepId) -> bool {
        self.compensation_results
            .iter()
            .any(|r| &r.step_id == step_id && r.succeeded())
    }

    /// Moves to `next`, enforcing the status machine.
    pub(crate) fn transition(&mut self, next: SagaStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SagaError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    pub(crate) fn record_step(&mut self, result: StepResult) -> Result<()> {
        self.ensure_status(SagaStatus::Running)?;
        self.step_results.push(result);
        self.touch();
        Ok(())
    }

    pub(crate) fn record_compensation(&mut self, result: StepResult) -> Result<()> {
        self.ensure_status(SagaStatus::Compensating)?;
        self.compensation_results.push(result);
        self.touch();
        Ok(())
    }

    pub(crate) fn set_failure(&mut self, failure: FailureDetail) {
        self.failure = Some(failure);
        self.touch();
    }

    pub(crate) fn set_failed_compensations(&mut self, steps: Vec<StepId>) {
        self.failed_compensations = steps;
        self.touch();
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn ensure_status(&self, expected: SagaStatus) -> Result<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(SagaError::InvalidTransition {
                from: self.status,
                to: expected,
            })
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
