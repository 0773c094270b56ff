//! Saga execution engine.
//!
//! A saga is an ordered list of steps, each pairing a forward action with a
//! compensating action. The [`SagaExecutor`] runs the forward actions in
//! order, retrying transient failures with exponential backoff. When a step
//! fails for good, or the execution is cancelled, the steps that already
//! succeeded are compensated in reverse order.
//!
//! Every status transition and step result is persisted through a
//! [`PersistenceStore`] with an optimistic version check, so an interrupted
//! execution can be resumed, and reported to an [`EventSink`].
//!
//! ```text
//! Pending → Running → Completed
//!              ↓
//!         Compensating → Compensated
//!              ↓
//!            Failed
//! ```

pub mod compensation;
pub mod config;
pub mod definition;
pub mod error;
pub mod events;
pub mod execution;
pub mod executor;
pub mod retry;
mod runner;
pub mod sink;
pub mod state;
pub mod step;

pub use common::{ExecutionId, IdempotencyKey, StepId};
pub use compensation::{CompensationCoordinator, UnwindPolicy};
pub use config::{AdmissionPolicy, ExecutorConfig};
pub use definition::{SagaDefinition, SagaDefinitionBuilder};
pub use error::{ConfigError, Result, SagaError};
pub use events::{SagaEvent, SagaEventKind};
pub use execution::{FailureDetail, FailureKind, SagaExecution, StepResult};
pub use execution_store::{InMemoryExecutionStore, PersistenceStore, PersistenceStoreExt};
pub use executor::SagaExecutor;
pub use retry::RetryPolicy;
pub use sink::{EventSink, InMemoryEventSink, SinkError, TracingEventSink};
pub use state::SagaStatus;
pub use step::{Outcome, OutcomeKind, Step, StepAction, StepContext};
