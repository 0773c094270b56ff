//! Event sinks: where the executor reports what happened.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::ExecutionId;
use thiserror::Error;

use crate::events::{SagaEvent, SagaEventKind};

/// Failure to deliver an event. Never affects the saga itself.
#[derive(Debug, Error)]
#[error("Event sink error: {0}")]
pub struct SinkError(pub String);

/// Receives every status transition and step result as it happens.
///
/// Publishing is fire-and-forget from the executor's point of view: errors are
/// logged and otherwise ignored.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: SagaEvent) -> Result<(), SinkError>;
}

/// Sink that writes events as structured tracing records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn publish(&self, event: SagaEvent) -> Result<(), SinkError> {
        let step = event.kind.step_id().map(|s| s.to_string());
        match &event.kind {
            SagaEventKind::StepFailed(data) | SagaEventKind::CompensationFailed(data) => {
                tracing::warn!(
                    execution_id = %event.execution_id,
                    saga = %event.saga_name,
                    event = event.event_type(),
                    step = ?step,
                    attempt = data.attempt,
                    will_retry = data.will_retry,
                    reason = %data.reason,
                    "saga event"
                );
            }
            SagaEventKind::SagaFailed(data) => {
                tracing::error!(
                    execution_id = %event.execution_id,
                    saga = %event.saga_name,
                    event = event.event_type(),
                    failed_compensations = ?data.failed_compensations,
                    "saga event"
                );
            }
            _ => {
                tracing::info!(
                    execution_id = %event.execution_id,
                    saga = %event.saga_name,
                    event = event.event_type(),
                    step = ?step,
                    "saga event"
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InMemorySinkState {
    events: Vec<SagaEvent>,
    fail_on_publish: bool,
}

/// In-memory sink that keeps every published event, for inspection in tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventSink {
    state: Arc<RwLock<InMemorySinkState>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the sink to reject every publish (events are still dropped).
    pub fn set_fail_on_publish(&self, fail: bool) {
        if let Ok(mut state) = self.state.write() {
            state.fail_on_publish = fail;
        }
    }

    /// Returns every event received so far.
    pub fn events(&self) -> Vec<SagaEvent> {
        self.state
            .read()
            .map(|s| s.events.clone())
            .unwrap_or_default()
    }

    /// Returns the events of one execution.
    pub fn events_for(&self, execution_id: ExecutionId) -> Vec<SagaEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.execution_id == execution_id)
            .collect()
    }

    /// Returns the event type names of one execution, in publish order.
    pub fn event_types_for(&self, execution_id: ExecutionId) -> Vec<&'static str> {
        self.events_for(execution_id)
            .iter()
            .map(SagaEvent::event_type)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn publish(&self, event: SagaEvent) -> Result<(), SinkError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| SinkError("sink state poisoned".to_string()))?;

        if state.fail_on_publish {
            return Err(SinkError("sink unavailable".to_string()));
        }

        state.events.push(event);
        Ok(())
    }
}
