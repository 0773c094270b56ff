//! Drives one execution from its current status to a terminal one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{IdempotencyKey, StepId};
use execution_store::PersistenceStore;
use tokio::sync::watch;

use crate::compensation::{CompensationCoordinator, Compensator, UnwindPolicy};
use crate::config::ExecutorConfig;
use crate::definition::SagaDefinition;
use crate::error::Result;
use crate::events::{
    SagaCompensatedData, SagaCompletedData, SagaEvent, SagaEventKind, SagaFailedData,
    SagaStartedData, StepAttemptData, StepFailedData,
};
use crate::execution::{FailureDetail, FailureKind, SagaExecution, StepResult};
use crate::sink::EventSink;
use crate::state::SagaStatus;
use crate::step::{Outcome, Step, StepAction, StepContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Forward,
    Compensation,
}

/// Final outcome of the attempt loop for one step.
struct Attempts {
    outcome: Outcome,
    attempts: u32,
    first_attempt_at: DateTime<Utc>,
    last_attempt_at: DateTime<Utc>,
    exhausted: bool,
    cancelled: bool,
}

/// Owns one execution while it is being driven.
///
/// Every mutation is persisted with the version read last, then reported to
/// the event sink.
pub(crate) struct ExecutionRun {
    execution: SagaExecution,
    definition: SagaDefinition,
    store: Arc<dyn PersistenceStore>,
    sink: Arc<dyn EventSink>,
    config: Arc<ExecutorConfig>,
    status_tx: watch::Sender<SagaStatus>,
    cancel_rx: watch::Receiver<bool>,
}

impl ExecutionRun {
    pub(crate) fn new(
        execution: SagaExecution,
        definition: SagaDefinition,
        store: Arc<dyn PersistenceStore>,
        sink: Arc<dyn EventSink>,
        config: Arc<ExecutorConfig>,
        status_tx: watch::Sender<SagaStatus>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            execution,
            definition,
            store,
            sink,
            config,
            status_tx,
            cancel_rx,
        }
    }

    /// Runs the execution to a terminal status.
    ///
    /// Business failures end up in the returned execution. Errors are fatal:
    /// a conflicting writer or an unusable store.
    #[tracing::instrument(
        skip(self),
        fields(execution_id = %self.execution.id(), saga = %self.definition.name())
    )]
    pub(crate) async fn run(mut self) -> Result<SagaExecution> {
        let started = Instant::now();

        if self.execution.status() == SagaStatus::Pending {
            self.transition(SagaStatus::Running).await?;
            self.publish(SagaEventKind::SagaStarted(SagaStartedData {
                step_count: self.definition.len(),
            }))
            .await;
        }

        if self.execution.status() == SagaStatus::Running {
            match self.run_forward().await? {
                None => {
                    self.transition(SagaStatus::Completed).await?;
                    self.publish(SagaEventKind::SagaCompleted(SagaCompletedData {
                        step_count: self.execution.step_results().len(),
                    }))
                    .await;
                    metrics::counter!("saga_completed").increment(1);
                    tracing::info!("saga completed successfully");
                }
                Some(failure) => {
                    tracing::warn!(
                        step = ?failure.step_id,
                        kind = ?failure.kind,
                        reason = %failure.reason,
                        "saga step failed, compensating"
                    );
                    self.execution.set_failure(failure.clone());
                    self.transition(SagaStatus::Compensating).await?;
                    self.publish(SagaEventKind::SagaCompensating(failure)).await;
                }
            }
        }

        if self.execution.status() == SagaStatus::Compensating {
            self.run_compensation().await?;
        }

        metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());
        Ok(self.execution)
    }

    /// Runs the remaining forward steps in order.
    ///
    /// Returns the failure that stopped forward progress, if any.
    async fn run_forward(&mut self) -> Result<Option<FailureDetail>> {
        // A recorded failure means forward progress stopped before a restart.
        if let Some(failed) = self.execution.step_results().iter().find(|r| !r.succeeded()) {
            let failure = self.execution.failure().cloned().unwrap_or_else(|| FailureDetail {
                step_id: Some(failed.step_id.clone()),
                kind: FailureKind::PermanentFailure,
                reason: failed.reason.clone().unwrap_or_default(),
            });
            return Ok(Some(failure));
        }

        let definition = self.definition.clone();
        let done = self.execution.step_results().len();

        for step in definition.steps().iter().skip(done) {
            if self.is_cancelled() {
                return Ok(Some(FailureDetail {
                    step_id: None,
                    kind: FailureKind::Cancelled,
                    reason: format!("cancelled before step '{}'", step.id()),
                }));
            }

            let key = step.idempotency_key(self.execution.id());
            let attempts = self.attempt(Phase::Forward, step, &key).await;
            let result = StepResult::new(
                step.id().clone(),
                key,
                attempts.attempts,
                attempts.outcome,
                attempts.first_attempt_at,
                attempts.last_attempt_at,
            );

            self.execution.record_step(result.clone())?;
            self.persist().await?;

            if result.succeeded() {
                self.publish(SagaEventKind::StepSucceeded(result)).await;
                continue;
            }

            let reason = result.reason.clone().unwrap_or_default();
            self.publish(SagaEventKind::StepFailed(StepFailedData {
                step_id: step.id().clone(),
                attempt: result.attempts,
                reason: reason.clone(),
                will_retry: false,
                result: Some(result),
            }))
            .await;

            let kind = if attempts.cancelled {
                FailureKind::Cancelled
            } else if attempts.exhausted {
                FailureKind::RetriesExhausted
            } else {
                FailureKind::PermanentFailure
            };
            return Ok(Some(FailureDetail {
                step_id: Some(step.id().clone()),
                kind,
                reason,
            }));
        }

        Ok(None)
    }

    /// Unwinds the succeeded steps that are not compensated yet.
    async fn run_compensation(&mut self) -> Result<()> {
        let order = self.execution.unwind_order();

        // Compensations recorded before a restart are not invoked again.
        let mut failed: Vec<StepId> = order
            .iter()
            .filter(|id| {
                self.execution
                    .compensation_result(id.as_str())
                    .is_some_and(|r| !r.succeeded())
            })
            .cloned()
            .collect();
        let pending: Vec<Step> = order
            .iter()
            .filter(|id| self.execution.compensation_result(id.as_str()).is_none())
            .filter_map(|id| self.definition.step(id.as_str()).cloned())
            .collect();

        tracing::info!(
            steps = pending.len(),
            already_failed = failed.len(),
            "compensation started"
        );

        if !failed.is_empty() && self.config.unwind == UnwindPolicy::Abort {
            failed.extend(pending.iter().map(|s| s.id().clone()));
        } else {
            let coordinator = CompensationCoordinator::new(self.config.unwind);
            failed.extend(coordinator.unwind(self, &pending).await?);
        }
        failed.sort_by_key(|id| order.iter().position(|o| o == id));

        let failure = self.execution.failure().cloned();

        self.execution.set_failed_compensations(failed.clone());

        if failed.is_empty() {
            self.transition(SagaStatus::Compensated).await?;
            self.publish(SagaEventKind::SagaCompensated(SagaCompensatedData {
                failure,
                compensated: order,
            }))
            .await;
            metrics::counter!("saga_compensated").increment(1);
            tracing::info!("saga compensated");
        } else {
            self.transition(SagaStatus::Failed).await?;
            self.publish(SagaEventKind::SagaFailed(SagaFailedData {
                failure,
                failed_compensations: failed.clone(),
            }))
            .await;
            metrics::counter!("saga_failed").increment(1);
            tracing::error!(
                failed_compensations = ?failed,
                "saga failed, compensations need manual remediation"
            );
        }

        Ok(())
    }

    /// Attempts a step's action (or compensation) until it succeeds or the
    /// retry policy stops it.
    async fn attempt(&mut self, phase: Phase, step: &Step, key: &IdempotencyKey) -> Attempts {
        let policy = match phase {
            Phase::Forward => step.retry_policy().unwrap_or(&self.config.retry),
            Phase::Compensation => step
                .compensation_retry_policy()
                .unwrap_or(&self.config.compensation_retry),
        }
        .clone();
        let timeout = step.timeout().or(self.config.attempt_timeout);
        // Compensations must tolerate repetition, so they are always retryable.
        let retryable = phase == Phase::Compensation || step.is_retryable();
        let action = match phase {
            Phase::Forward => step.action(),
            Phase::Compensation => step.compensation(),
        };

        let first_attempt_at = Utc::now();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let data = StepAttemptData {
                step_id: step.id().clone(),
                attempt,
                idempotency_key: key.clone(),
            };
            self.publish(match phase {
                Phase::Forward => SagaEventKind::StepStarted(data),
                Phase::Compensation => SagaEventKind::CompensationStarted(data),
            })
            .await;
            match phase {
                Phase::Forward => metrics::counter!("saga_step_attempts_total").increment(1),
                Phase::Compensation => {
                    metrics::counter!("saga_compensation_attempts_total").increment(1)
                }
            }

            let ctx = self.context(step, attempt, key.clone());
            let outcome = invoke(action, ctx, timeout, retryable).await;
            let last_attempt_at = Utc::now();

            if outcome.is_success() || !(retryable && policy.should_retry(&outcome, attempt)) {
                let exhausted = retryable && matches!(outcome, Outcome::TransientFailure(_));
                return Attempts {
                    outcome: policy.finalize(outcome, attempt),
                    attempts: attempt,
                    first_attempt_at,
                    last_attempt_at,
                    exhausted,
                    cancelled: false,
                };
            }

            let reason = outcome.reason().unwrap_or_default().to_string();
            tracing::warn!(
                step = %step.id(),
                ?phase,
                attempt,
                reason = %reason,
                "attempt failed, retrying"
            );
            let data = StepFailedData {
                step_id: step.id().clone(),
                attempt,
                reason: reason.clone(),
                will_retry: true,
                result: None,
            };
            self.publish(match phase {
                Phase::Forward => SagaEventKind::StepFailed(data),
                Phase::Compensation => SagaEventKind::CompensationFailed(data),
            })
            .await;

            let delay = policy.backoff_for(attempt);
            match phase {
                Phase::Forward => {
                    if backoff(&mut self.cancel_rx, delay).await {
                        return Attempts {
                            outcome: Outcome::PermanentFailure(format!(
                                "cancelled after {attempt} attempt(s): {reason}"
                            )),
                            attempts: attempt,
                            first_attempt_at,
                            last_attempt_at,
                            exhausted: false,
                            cancelled: true,
                        };
                    }
                }
                // Rollback proceeds regardless of cancellation.
                Phase::Compensation => tokio::time::sleep(delay).await,
            }
        }
    }

    fn context(&self, step: &Step, attempt: u32, key: IdempotencyKey) -> StepContext {
        StepContext {
            execution_id: self.execution.id(),
            saga_name: self.execution.saga_name().to_string(),
            step_id: step.id().clone(),
            attempt,
            idempotency_key: key,
            input: self.execution.input().clone(),
            outputs: self.execution.outputs(),
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    async fn transition(&mut self, next: SagaStatus) -> Result<()> {
        let from = self.execution.status();
        self.execution.transition(next)?;
        self.persist().await?;
        self.status_tx.send_replace(next);
        tracing::info!(%from, to = %next, "saga status changed");
        Ok(())
    }

    async fn persist(&mut self) -> Result<()> {
        let record = self.execution.to_record()?;
        let version = self.store.save(record, self.execution.version()).await?;
        self.execution.set_version(version);
        Ok(())
    }

    async fn publish(&self, kind: SagaEventKind) {
        let event = SagaEvent::new(self.execution.id(), self.execution.saga_name(), kind);
        let event_type = event.event_type();
        if let Err(e) = self.sink.publish(event).await {
            tracing::warn!(event = event_type, error = %e, "failed to publish saga event");
        }
    }
}

#[async_trait]
impl Compensator for ExecutionRun {
    async fn compensate(&mut self, step: &Step) -> Result<bool> {
        // Reuse the key the forward action ran with.
        let key = self
            .execution
            .step_result(step.id().as_str())
            .map(|r| r.idempotency_key.clone())
            .unwrap_or_else(|| step.idempotency_key(self.execution.id()));

        let attempts = self.attempt(Phase::Compensation, step, &key).await;
        let result = StepResult::new(
            step.id().clone(),
            key,
            attempts.attempts,
            attempts.outcome,
            attempts.first_attempt_at,
            attempts.last_attempt_at,
        );

        self.execution.record_compensation(result.clone())?;
        self.persist().await?;

        if result.succeeded() {
            self.publish(SagaEventKind::CompensationSucceeded(result))
                .await;
            return Ok(true);
        }

        self.publish(SagaEventKind::CompensationFailed(StepFailedData {
            step_id: step.id().clone(),
            attempt: result.attempts,
            reason: result.reason.clone().unwrap_or_default(),
            will_retry: false,
            result: Some(result),
        }))
        .await;
        Ok(false)
    }
}

/// Runs one attempt, turning a timeout into a failure outcome.
async fn invoke(
    action: &dyn StepAction,
    ctx: StepContext,
    timeout: Option<Duration>,
    retryable: bool,
) -> Outcome {
    let Some(limit) = timeout else {
        return action.run(ctx).await;
    };

    match tokio::time::timeout(limit, action.run(ctx)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            let reason = format!("attempt timed out after {}ms", limit.as_millis());
            if retryable {
                Outcome::TransientFailure(reason)
            } else {
                Outcome::PermanentFailure(reason)
            }
        }
    }
}

/// Waits out a retry delay. Returns true if cancellation was requested.
async fn backoff(cancel: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        let changed = tokio::select! {
            () = &mut sleep => None,
            changed = cancel.changed() => Some(changed.is_ok()),
        };

        match changed {
            None => return *cancel.borrow(),
            Some(true) => {
                if *cancel.borrow() {
                    return true;
                }
            }
            // Nobody can cancel anymore.
            Some(false) => {
                sleep.await;
                return false;
            }
        }
    }
}
