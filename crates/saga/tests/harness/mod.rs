//! Shared fixtures: in-memory downstream services and an order saga.

#![allow(dead_code)]

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use saga::{
    ExecutorConfig, InMemoryEventSink, InMemoryExecutionStore, Outcome, RetryPolicy,
    SagaDefinition, SagaExecutor, Step, StepContext,
};
use serde_json::json;
use tokio::sync::{Notify, watch};

/// Ordered record of every action and compensation invoked, across services.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    /// Entries of compensations only, in invocation order.
    pub fn compensations(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.starts_with("undo:"))
            .collect()
    }
}

#[derive(Debug, Default)]
struct ServiceState {
    /// Idempotency keys with an applied, not yet reverted, effect.
    active: BTreeSet<String>,
    applied: usize,
    forward_keys: Vec<String>,
    compensation_keys: Vec<String>,
    scripted: VecDeque<Outcome>,
    fail_always: Option<Outcome>,
    compensation_scripted: VecDeque<Outcome>,
    compensation_fail_always: Option<Outcome>,
}

/// A downstream service that applies an effect per idempotency key.
///
/// Repeating an action with the same key has no further effect, and so does
/// reverting one that was never applied.
#[derive(Debug, Clone)]
pub struct InMemoryService {
    action: &'static str,
    journal: Journal,
    state: Arc<Mutex<ServiceState>>,
}

impl InMemoryService {
    pub fn new(action: &'static str, journal: Journal) -> Self {
        Self {
            action,
            journal,
            state: Arc::default(),
        }
    }

    /// Fails the next forward calls with the given outcomes, in order.
    pub fn fail_next(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.state.lock().unwrap().scripted.extend(outcomes);
    }

    /// Fails every forward call with `outcome`.
    pub fn fail_always(&self, outcome: Outcome) {
        self.state.lock().unwrap().fail_always = Some(outcome);
    }

    /// Fails the next compensation calls with the given outcomes, in order.
    pub fn fail_next_compensation(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.state
            .lock()
            .unwrap()
            .compensation_scripted
            .extend(outcomes);
    }

    /// Fails every compensation call with `outcome`.
    pub fn fail_compensation_always(&self, outcome: Outcome) {
        self.state.lock().unwrap().compensation_fail_always = Some(outcome);
    }

    /// Number of effects currently in place.
    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    /// Number of distinct effects ever applied.
    pub fn applied_count(&self) -> usize {
        self.state.lock().unwrap().applied
    }

    pub fn forward_keys(&self) -> Vec<String> {
        self.state.lock().unwrap().forward_keys.clone()
    }

    pub fn compensation_keys(&self) -> Vec<String> {
        self.state.lock().unwrap().compensation_keys.clone()
    }

    pub fn apply(&self, ctx: &StepContext) -> Outcome {
        let key = ctx.idempotency_key.to_string();
        self.journal.push(self.action);

        let mut state = self.state.lock().unwrap();
        state.forward_keys.push(key.clone());

        if let Some(outcome) = state.scripted.pop_front() {
            return outcome;
        }
        if let Some(outcome) = state.fail_always.clone() {
            return outcome;
        }

        if state.active.insert(key.clone()) {
            state.applied += 1;
        }
        Outcome::Success(json!({ "id": format!("{}-{}", self.action, key) }))
    }

    pub fn revert(&self, ctx: &StepContext) -> Outcome {
        let key = ctx.idempotency_key.to_string();
        self.journal.push(format!("undo:{}", self.action));

        let mut state = self.state.lock().unwrap();
        state.compensation_keys.push(key.clone());

        if let Some(outcome) = state.compensation_scripted.pop_front() {
            return outcome;
        }
        if let Some(outcome) = state.compensation_fail_always.clone() {
            return outcome;
        }

        state.active.remove(&key);
        Outcome::success()
    }

    /// A step whose action and compensation go through this service.
    pub fn step(&self) -> Step {
        let forward = self.clone();
        let backward = self.clone();
        Step::new(
            self.action,
            move |ctx: StepContext| {
                let outcome = forward.apply(&ctx);
                async move { outcome }
            },
            move |ctx: StepContext| {
                let outcome = backward.revert(&ctx);
                async move { outcome }
            },
        )
    }
}

/// A latch that blocks steps until the test opens it.
#[derive(Debug, Clone)]
pub struct Gate {
    open: Arc<watch::Sender<bool>>,
    entered: Arc<Notify>,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            open: Arc::new(watch::channel(false).0),
            entered: Arc::new(Notify::new()),
        }
    }
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// Called by a step: signals arrival, then waits for the gate to open.
    pub async fn pass(&self) {
        self.entered.notify_one();
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await.is_ok();
    }

    /// Waits until a step has arrived at the gate.
    pub async fn arrived(&self) {
        self.entered.notified().await;
    }

    /// A step that waits at this gate and then succeeds.
    pub fn step(&self, id: &'static str, journal: &Journal) -> Step {
        let gate = self.clone();
        let forward = journal.clone();
        let backward = journal.clone();
        Step::new(
            id,
            move |_ctx: StepContext| {
                let gate = gate.clone();
                forward.push(id);
                async move {
                    gate.pass().await;
                    Outcome::success()
                }
            },
            move |_ctx: StepContext| {
                backward.push(format!("undo:{id}"));
                async { Outcome::success() }
            },
        )
    }
}

/// Executor settings without delays, so tests run instantly.
pub fn fast_config() -> ExecutorConfig {
    ExecutorConfig {
        retry: RetryPolicy::immediate(3),
        compensation_retry: RetryPolicy::immediate(3),
        ..ExecutorConfig::default()
    }
}

/// Installs a test subscriber when `RUST_LOG` is set.
pub fn init_tracing() {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    }
}

/// Order fulfillment: reserve inventory, charge payment, create shipment.
pub struct TestHarness {
    pub executor: SagaExecutor,
    pub store: InMemoryExecutionStore,
    pub sink: InMemoryEventSink,
    pub journal: Journal,
    pub inventory: InMemoryService,
    pub payment: InMemoryService,
    pub shipping: InMemoryService,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: ExecutorConfig) -> Self {
        init_tracing();
        let store = InMemoryExecutionStore::new();
        let sink = InMemoryEventSink::new();
        let journal = Journal::default();

        Self {
            executor: SagaExecutor::new(store.clone(), sink.clone(), config).unwrap(),
            store,
            sink,
            inventory: InMemoryService::new("reserve", journal.clone()),
            payment: InMemoryService::new("charge", journal.clone()),
            shipping: InMemoryService::new("ship", journal.clone()),
            journal,
        }
    }

    pub fn order_saga(&self) -> SagaDefinition {
        SagaDefinition::builder("order_fulfillment")
            .step(self.inventory.step())
            .step(self.payment.step())
            .step(self.shipping.step())
            .build()
            .unwrap()
    }
}
