//! Steps: a forward action paired with its compensation.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{ExecutionId, IdempotencyKey, StepId};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Result of one invocation of an action or compensation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Outcome {
    /// The call succeeded. The value becomes the step's output.
    Success(serde_json::Value),

    /// The call failed but may succeed if attempted again.
    TransientFailure(String),

    /// The call failed and retrying cannot help.
    PermanentFailure(String),
}

impl Outcome {
    /// Success without an output value.
    pub fn success() -> Self {
        Outcome::Success(serde_json::Value::Null)
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Outcome::TransientFailure(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Outcome::PermanentFailure(reason.into())
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Success(_) => OutcomeKind::Success,
            Outcome::TransientFailure(_) => OutcomeKind::TransientFailure,
            Outcome::PermanentFailure(_) => OutcomeKind::PermanentFailure,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Returns the failure reason, if this is a failure.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Success(_) => None,
            Outcome::TransientFailure(reason) | Outcome::PermanentFailure(reason) => Some(reason),
        }
    }
}

/// Tag of an [`Outcome`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutcomeKind {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "Success",
            OutcomeKind::TransientFailure => "TransientFailure",
            OutcomeKind::PermanentFailure => "PermanentFailure",
        }
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything an action or compensation gets to see about its execution.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// The execution being driven.
    pub execution_id: ExecutionId,
    /// Name of the saga definition.
    pub saga_name: String,
    /// The step being invoked.
    pub step_id: StepId,
    /// 1-based attempt number of this invocation.
    pub attempt: u32,
    /// Key to hand to the remote service so retried calls are deduplicated.
    pub idempotency_key: IdempotencyKey,
    /// Input supplied when the saga was submitted.
    pub input: serde_json::Value,
    /// Outputs of the steps that succeeded so far, keyed by step id.
    pub outputs: BTreeMap<StepId, serde_json::Value>,
}

impl StepContext {
    /// Returns the output of a previously succeeded step.
    pub fn output(&self, step_id: &str) -> Option<&serde_json::Value> {
        self.outputs.get(&StepId::new(step_id))
    }
}

/// A forward action or compensation capability.
///
/// The engine never looks inside: it only classifies the returned [`Outcome`].
/// Compensations must tolerate being invoked more than once.
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn run(&self, ctx: StepContext) -> Outcome;
}

#[async_trait]
impl<F, Fut> StepAction for F
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    async fn run(&self, ctx: StepContext) -> Outcome {
        (self)(ctx).await
    }
}

type KeyFn = dyn Fn(ExecutionId, &StepId) -> IdempotencyKey + Send + Sync;

/// One unit of forward work plus its compensating counterpart.
#[derive(Clone)]
pub struct Step {
    id: StepId,
    action: Arc<dyn StepAction>,
    compensation: Arc<dyn StepAction>,
    idempotency_key: Option<Arc<KeyFn>>,
    retry_policy: Option<RetryPolicy>,
    compensation_retry_policy: Option<RetryPolicy>,
    timeout: Option<Duration>,
    retryable: bool,
}

impl Step {
    /// Creates a step from an action and its compensation.
    pub fn new(
        id: impl Into<StepId>,
        action: impl StepAction + 'static,
        compensation: impl StepAction + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            action: Arc::new(action),
            compensation: Arc::new(compensation),
            idempotency_key: None,
            retry_policy: None,
            compensation_retry_policy: None,
            timeout: None,
            retryable: true,
        }
    }

    /// Overrides the executor's forward retry policy for this step.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Uses a dedicated retry policy for this step's compensation.
    pub fn with_compensation_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.compensation_retry_policy = Some(policy);
        self
    }

    /// Overrides the executor's per-attempt timeout for this step.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replaces the default `"{execution_id}:{step_id}"` idempotency key.
    ///
    /// The function must be deterministic.
    pub fn with_idempotency_key<F>(mut self, key: F) -> Self
    where
        F: Fn(ExecutionId, &StepId) -> IdempotencyKey + Send + Sync + 'static,
    {
        self.idempotency_key = Some(Arc::new(key));
        self
    }

    /// Marks the forward action as unsafe to repeat.
    ///
    /// Transient failures and timeouts of a non-retryable step are treated as
    /// permanent.
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn id(&self) -> &StepId {
        &self.id
    }

    pub fn action(&self) -> &dyn StepAction {
        self.action.as_ref()
    }

    pub fn compensation(&self) -> &dyn StepAction {
        self.compensation.as_ref()
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    /// The dedicated compensation policy, falling back to the forward override.
    pub fn compensation_retry_policy(&self) -> Option<&RetryPolicy> {
        self.compensation_retry_policy
            .as_ref()
            .or(self.retry_policy.as_ref())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Returns the idempotency key of this step within an execution.
    pub fn idempotency_key(&self, execution_id: ExecutionId) -> IdempotencyKey {
        match &self.idempotency_key {
            Some(key) => key(execution_id, &self.id),
            None => IdempotencyKey::derive(execution_id, &self.id),
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("retry_policy", &self.retry_policy)
            .field("compensation_retry_policy", &self.compensation_retry_policy)
            .field("timeout", &self.timeout)
            .field("retryable", &self.retryable)
            .finish_non_exhaustive()
    }
}
