//! The saga executor: admission, background execution, cancellation and
//! recovery.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use common::ExecutionId;
use execution_store::{InMemoryExecutionStore, PersistenceStore, PersistenceStoreExt, Version};
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore, watch};

use crate::config::{AdmissionPolicy, ExecutorConfig};
use crate::definition::SagaDefinition;
use crate::error::{ConfigError, Result, SagaError};
use crate::execution::SagaExecution;
use crate::runner::ExecutionRun;
use crate::sink::{EventSink, TracingEventSink};
use crate::state::SagaStatus;

/// Where a background run stands.
#[derive(Debug, Clone, PartialEq)]
enum RunState {
    Active,
    Finished,
    Aborted {
        config: Option<ConfigError>,
        reason: String,
    },
}

/// Control channels of one execution driven by this executor.
#[derive(Clone)]
struct ExecutionHandle {
    cancel_tx: Arc<watch::Sender<bool>>,
    status_rx: watch::Receiver<SagaStatus>,
    run_rx: watch::Receiver<RunState>,
}

struct ExecutorInner {
    store: Arc<dyn PersistenceStore>,
    sink: Arc<dyn EventSink>,
    config: Arc<ExecutorConfig>,
    permits: Arc<Semaphore>,
    handles: RwLock<HashMap<ExecutionId, ExecutionHandle>>,
}

/// Runs saga executions in the background.
///
/// Each submission gets its own task. At most `max_concurrent` executions run
/// at once; the rest wait Pending or are rejected, depending on the
/// admission policy. The executor is cheap to clone.
#[derive(Clone)]
pub struct SagaExecutor {
    inner: Arc<ExecutorInner>,
}

impl SagaExecutor {
    /// Creates an executor over the given store and event sink.
    ///
    /// Fails with `ConfigError::InvalidSetting` if `config` is out of range.
    pub fn new<S, E>(
        store: S,
        sink: E,
        config: ExecutorConfig,
    ) -> std::result::Result<Self, ConfigError>
    where
        S: PersistenceStore + 'static,
        E: EventSink + 'static,
    {
        Self::from_parts(Arc::new(store), Arc::new(sink), config)
    }

    /// Creates an executor from shared store and sink handles.
    pub fn from_parts(
        store: Arc<dyn PersistenceStore>,
        sink: Arc<dyn EventSink>,
        config: ExecutorConfig,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let permits = Arc::new(Semaphore::new(config.max_concurrent));
        Ok(Self {
            inner: Arc::new(ExecutorInner {
                store,
                sink,
                config: Arc::new(config),
                permits,
                handles: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Creates an executor with an in-memory store and a tracing sink.
    pub fn in_memory(config: ExecutorConfig) -> std::result::Result<Self, ConfigError> {
        Self::new(InMemoryExecutionStore::new(), TracingEventSink, config)
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// Submits an execution of `definition` with a null input.
    pub async fn submit(&self, definition: &SagaDefinition) -> Result<ExecutionId> {
        self.submit_with_input(definition, Value::Null).await
    }

    /// Submits an execution of `definition` and returns immediately.
    ///
    /// The execution is persisted as Pending before this returns.
    #[tracing::instrument(skip(self, definition, input), fields(saga = %definition.name()))]
    pub async fn submit_with_input(
        &self,
        definition: &SagaDefinition,
        input: Value,
    ) -> Result<ExecutionId> {
        let permit = self.admit()?;

        let mut execution = SagaExecution::new(definition.name(), input);
        let version = self
            .inner
            .store
            .save(execution.to_record()?, Version::initial())
            .await?;
        execution.set_version(version);

        let execution_id = execution.id();
        metrics::counter!("saga_executions_total").increment(1);
        tracing::info!(%execution_id, "saga submitted");

        self.spawn(definition.clone(), execution, permit).await?;
        Ok(execution_id)
    }

    /// Submits an execution and waits for its terminal snapshot.
    pub async fn execute(&self, definition: &SagaDefinition, input: Value) -> Result<SagaExecution> {
        let execution_id = self.submit_with_input(definition, input).await?;
        self.wait(execution_id).await
    }

    /// Returns the latest persisted snapshot of an execution.
    pub async fn status(&self, execution_id: ExecutionId) -> Result<SagaExecution> {
        let record = self.inner.store.load_required(execution_id).await?;
        SagaExecution::from_record(&record)
    }

    /// Waits until the execution reaches a terminal status.
    ///
    /// Executions this executor is not driving resolve to their stored
    /// snapshot right away.
    pub async fn wait(&self, execution_id: ExecutionId) -> Result<SagaExecution> {
        let handle = self.inner.handles.read().await.get(&execution_id).cloned();
        let Some(handle) = handle else {
            return self.status(execution_id).await;
        };

        let mut run_rx = handle.run_rx;
        let state = run_rx
            .wait_for(|state| *state != RunState::Active)
            .await
            .map(|state| (*state).clone());

        match state {
            Ok(RunState::Aborted {
                config: Some(err), ..
            }) => Err(err.into()),
            Ok(RunState::Aborted { reason, .. }) => Err(SagaError::Aborted {
                execution_id,
                reason,
            }),
            Ok(_) => self.status(execution_id).await,
            Err(_) => Err(SagaError::Aborted {
                execution_id,
                reason: "execution task ended unexpectedly".to_string(),
            }),
        }
    }

    /// Requests cancellation of a running execution.
    ///
    /// Takes effect at the next attempt boundary and triggers compensation.
    /// Cancelling a terminal execution is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, execution_id: ExecutionId) -> Result<()> {
        let handle = self.inner.handles.read().await.get(&execution_id).cloned();
        match handle {
            Some(handle) => {
                if !handle.status_rx.borrow().is_terminal() {
                    handle.cancel_tx.send_replace(true);
                    tracing::info!("cancellation requested");
                }
                Ok(())
            }
            None => {
                let execution = self.status(execution_id).await?;
                if !execution.status().is_terminal() {
                    tracing::warn!(
                        status = %execution.status(),
                        "execution is not driven by this executor, nothing to cancel"
                    );
                }
                Ok(())
            }
        }
    }

    /// Continues a persisted execution from its last recorded state.
    ///
    /// Returns false if the execution was already terminal.
    #[tracing::instrument(skip(self, definition), fields(saga = %definition.name()))]
    pub async fn resume(
        &self,
        definition: &SagaDefinition,
        execution_id: ExecutionId,
    ) -> Result<bool> {
        let execution = self.status(execution_id).await?;
        check_definition(definition, &execution)?;

        if execution.status().is_terminal() {
            return Ok(false);
        }

        let permit = self.admit()?;
        tracing::info!(status = %execution.status(), "resuming saga execution");
        self.spawn(definition.clone(), execution, permit).await?;
        Ok(true)
    }

    /// Resumes every non-terminal execution in the store whose saga is among
    /// `definitions`. Returns the resumed ids.
    #[tracing::instrument(skip(self, definitions))]
    pub async fn recover(&self, definitions: &[SagaDefinition]) -> Result<Vec<ExecutionId>> {
        let mut resumed = Vec::new();

        for execution_id in self.inner.store.in_flight().await? {
            if self.is_driving(execution_id).await {
                continue;
            }

            let execution = self.status(execution_id).await?;
            let Some(definition) = definitions
                .iter()
                .find(|d| d.name() == execution.saga_name())
            else {
                tracing::warn!(
                    %execution_id,
                    saga = execution.saga_name(),
                    "no definition for in-flight execution, skipping"
                );
                continue;
            };

            if self.resume(definition, execution_id).await? {
                resumed.push(execution_id);
            }
        }

        tracing::info!(count = resumed.len(), "recovered in-flight executions");
        Ok(resumed)
    }

    /// Number of executions this executor is currently driving, queued ones
    /// included.
    pub async fn active_count(&self) -> usize {
        self.inner
            .handles
            .read()
            .await
            .values()
            .filter(|h| *h.run_rx.borrow() == RunState::Active)
            .count()
    }

    async fn is_driving(&self, execution_id: ExecutionId) -> bool {
        self.inner
            .handles
            .read()
            .await
            .get(&execution_id)
            .is_some_and(|h| *h.run_rx.borrow() == RunState::Active)
    }

    /// Takes a slot up front under the reject policy.
    fn admit(&self) -> Result<Option<OwnedSemaphorePermit>> {
        match self.inner.config.admission {
            AdmissionPolicy::Queue => Ok(None),
            AdmissionPolicy::Reject => match Arc::clone(&self.inner.permits).try_acquire_owned() {
                Ok(permit) => Ok(Some(permit)),
                Err(_) => {
                    let limit = self.inner.config.max_concurrent;
                    metrics::counter!("saga_admission_rejected_total").increment(1);
                    tracing::warn!(limit, "admission rejected, executor at capacity");
                    Err(SagaError::AdmissionRejected { limit })
                }
            },
        }
    }

    async fn spawn(
        &self,
        definition: SagaDefinition,
        execution: SagaExecution,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<()> {
        let execution_id = execution.id();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(execution.status());
        let (run_tx, run_rx) = watch::channel(RunState::Active);

        {
            let mut handles = self.inner.handles.write().await;
            if let Some(existing) = handles.get(&execution_id)
                && *existing.run_rx.borrow() == RunState::Active
            {
                return Err(ConfigError::AlreadyRunning(execution_id).into());
            }
            handles.insert(
                execution_id,
                ExecutionHandle {
                    cancel_tx: Arc::new(cancel_tx),
                    status_rx,
                    run_rx,
                },
            );
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let permit = match permit {
                Some(permit) => permit,
                None => match Arc::clone(&inner.permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        run_tx.send_replace(RunState::Aborted {
                            config: None,
                            reason: "executor closed".to_string(),
                        });
                        return;
                    }
                },
            };

            let run = ExecutionRun::new(
                execution,
                definition,
                Arc::clone(&inner.store),
                Arc::clone(&inner.sink),
                Arc::clone(&inner.config),
                status_tx,
                cancel_rx,
            );

            let result = AssertUnwindSafe(run.run()).catch_unwind().await;
            // Free the slot before anyone waiting on this run wakes up.
            drop(permit);

            match result {
                Ok(Ok(_)) => {
                    run_tx.send_replace(RunState::Finished);
                    inner.handles.write().await.remove(&execution_id);
                }
                // The snapshot keeps the last persisted state, so the
                // execution can be resumed.
                Err(_) => {
                    tracing::error!(%execution_id, "saga execution panicked");
                    run_tx.send_replace(RunState::Aborted {
                        config: None,
                        reason: "step action panicked".to_string(),
                    });
                }
                Ok(Err(e)) => {
                    tracing::error!(%execution_id, error = %e, "saga execution aborted");
                    let config = match e {
                        SagaError::Config(ref err) => Some(err.clone()),
                        _ => None,
                    };
                    run_tx.send_replace(RunState::Aborted {
                        config,
                        reason: e.to_string(),
                    });
                }
            }
        });

        Ok(())
    }
}

/// Checks that a stored execution was produced by `definition`.
fn check_definition(definition: &SagaDefinition, execution: &SagaExecution) -> Result<()> {
    let mismatch = || ConfigError::DefinitionMismatch {
        execution_id: execution.id(),
        stored: execution.saga_name().to_string(),
        supplied: definition.name().to_string(),
    };

    if execution.saga_name() != definition.name()
        || execution.step_results().len() > definition.len()
    {
        return Err(mismatch().into());
    }

    let steps_match = execution
        .step_results()
        .iter()
        .zip(definition.steps())
        .all(|(result, step)| &result.step_id == step.id());
    if !steps_match {
        return Err(mismatch().into());
    }

    Ok(())
}
