//! Integration tests for order fulfillment sagas run by the executor.

mod harness;

use harness::{InMemoryService, Journal, TestHarness, fast_config};
use futures_util::future::join_all;
use saga::{
    ExecutorConfig, FailureKind, IdempotencyKey, Outcome, OutcomeKind, PersistenceStore,
    RetryPolicy, SagaDefinition, SagaStatus, Step, StepContext, StepId, UnwindPolicy,
};
use serde_json::{Value, json};

#[tokio::test]
async fn test_happy_path_full_order_fulfillment() {
    let h = TestHarness::new();

    let execution = h
        .executor
        .execute(&h.order_saga(), json!({ "order": "A-100" }))
        .await
        .unwrap();

    assert_eq!(execution.status(), SagaStatus::Completed);
    assert_eq!(execution.saga_name(), "order_fulfillment");
    assert_eq!(execution.step_results().len(), 3);
    for (result, expected) in execution.step_results().iter().zip(["reserve", "charge", "ship"]) {
        assert_eq!(result.step_id, expected);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.outcome, OutcomeKind::Success);
    }
    assert!(execution.compensation_results().is_empty());
    assert!(execution.failure().is_none());

    assert_eq!(h.journal.entries(), ["reserve", "charge", "ship"]);
    assert_eq!(h.inventory.active_count(), 1);
    assert_eq!(h.payment.active_count(), 1);
    assert_eq!(h.shipping.active_count(), 1);
}

#[tokio::test]
async fn test_reserve_failure_no_compensation_needed() {
    let h = TestHarness::new();
    h.inventory.fail_always(Outcome::permanent("out of stock"));

    let execution = h.executor.execute(&h.order_saga(), Value::Null).await.unwrap();

    assert_eq!(execution.status(), SagaStatus::Compensated);
    assert_eq!(execution.step_results().len(), 1);
    assert!(execution.compensation_results().is_empty());

    let failure = execution.failure().unwrap();
    assert_eq!(failure.step_id, Some(StepId::new("reserve")));
    assert_eq!(failure.kind, FailureKind::PermanentFailure);
    assert_eq!(failure.reason, "out of stock");

    assert_eq!(h.journal.entries(), ["reserve"]);
}

#[tokio::test]
async fn test_charge_failure_releases_inventory() {
    let h = TestHarness::new();
    h.payment.fail_always(Outcome::permanent("card declined"));

    let execution = h.executor.execute(&h.order_saga(), Value::Null).await.unwrap();

    assert_eq!(execution.status(), SagaStatus::Compensated);
    assert_eq!(h.journal.entries(), ["reserve", "charge", "undo:reserve"]);
    assert_eq!(h.inventory.active_count(), 0);
    assert_eq!(h.payment.active_count(), 0);
    assert_eq!(h.shipping.applied_count(), 0);
}

#[tokio::test]
async fn test_ship_failure_refunds_payment_releases_inventory() {
    let h = TestHarness::new();
    h.shipping.fail_always(Outcome::permanent("no carrier"));

    let execution = h.executor.execute(&h.order_saga(), Value::Null).await.unwrap();

    assert_eq!(execution.status(), SagaStatus::Compensated);
    assert_eq!(h.journal.compensations(), ["undo:charge", "undo:reserve"]);

    let compensated: Vec<&str> = execution
        .compensation_results()
        .iter()
        .map(|r| r.step_id.as_str())
        .collect();
    assert_eq!(compensated, ["charge", "reserve"]);
    assert!(execution.compensation_results().iter().all(|r| r.succeeded()));
    assert!(execution.failed_compensations().is_empty());

    assert_eq!(h.inventory.active_count(), 0);
    assert_eq!(h.payment.active_count(), 0);
    assert_eq!(h.shipping.active_count(), 0);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let h = TestHarness::new();
    h.payment.fail_next([
        Outcome::transient("gateway busy"),
        Outcome::transient("gateway busy"),
    ]);

    let execution = h.executor.execute(&h.order_saga(), Value::Null).await.unwrap();

    assert_eq!(execution.status(), SagaStatus::Completed);
    let charge = execution.step_result("charge").unwrap();
    assert_eq!(charge.attempts, 3);
    assert_eq!(charge.outcome, OutcomeKind::Success);
    assert!(charge.last_attempt_at >= charge.first_attempt_at);
    assert_eq!(h.payment.applied_count(), 1);
}

#[tokio::test]
async fn test_retries_exhausted_become_permanent() {
    let h = TestHarness::new();
    h.payment.fail_always(Outcome::transient("gateway busy"));

    let execution = h.executor.execute(&h.order_saga(), Value::Null).await.unwrap();

    assert_eq!(execution.status(), SagaStatus::Compensated);
    let charge = execution.step_result("charge").unwrap();
    assert_eq!(charge.attempts, 3);
    assert_eq!(charge.outcome, OutcomeKind::PermanentFailure);
    assert!(
        charge
            .reason
            .as_deref()
            .unwrap()
            .contains("gave up after 3 attempt(s)")
    );

    let failure = execution.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::RetriesExhausted);
    assert_eq!(h.journal.compensations(), ["undo:reserve"]);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let h = TestHarness::new();
    h.payment.fail_next([Outcome::permanent("card declined")]);

    let execution = h.executor.execute(&h.order_saga(), Value::Null).await.unwrap();

    assert_eq!(execution.step_result("charge").unwrap().attempts, 1);
    assert_eq!(h.payment.forward_keys().len(), 1);
}

#[tokio::test]
async fn test_step_retry_policy_overrides_default() {
    let h = TestHarness::new();
    h.payment.fail_always(Outcome::transient("gateway busy"));

    let definition = SagaDefinition::builder("order_fulfillment")
        .step(h.inventory.step())
        .step(h.payment.step().with_retry_policy(RetryPolicy::immediate(5)))
        .build()
        .unwrap();

    let execution = h.executor.execute(&definition, Value::Null).await.unwrap();
    assert_eq!(execution.step_result("charge").unwrap().attempts, 5);
}

#[tokio::test]
async fn test_idempotency_key_shared_by_attempts_and_compensation() {
    let h = TestHarness::new();
    h.payment.fail_next([Outcome::transient("gateway busy")]);
    h.shipping.fail_always(Outcome::permanent("no carrier"));

    let execution = h.executor.execute(&h.order_saga(), Value::Null).await.unwrap();

    let expected = IdempotencyKey::derive(execution.id(), &StepId::new("charge")).to_string();
    assert_eq!(expected, format!("{}:charge", execution.id()));
    assert_eq!(h.payment.forward_keys(), [expected.clone(), expected.clone()]);
    assert_eq!(h.payment.compensation_keys(), [expected.clone()]);

    let charge = execution.step_result("charge").unwrap();
    assert_eq!(charge.idempotency_key.as_str(), expected);
}

#[tokio::test]
async fn test_custom_idempotency_key() {
    let h = TestHarness::new();
    h.shipping.fail_always(Outcome::permanent("no carrier"));

    let definition = SagaDefinition::builder("order_fulfillment")
        .step(h.payment.step().with_idempotency_key(|execution_id, step_id| {
            IdempotencyKey::new(format!("pay-{step_id}-{execution_id}"))
        }))
        .step(h.shipping.step())
        .build()
        .unwrap();

    let execution = h.executor.execute(&definition, Value::Null).await.unwrap();

    let expected = format!("pay-charge-{}", execution.id());
    assert_eq!(h.payment.forward_keys(), [expected.clone()]);
    assert_eq!(h.payment.compensation_keys(), [expected]);
}

#[tokio::test]
async fn test_compensation_is_retried() {
    let h = TestHarness::new();
    h.shipping.fail_always(Outcome::permanent("no carrier"));
    h.payment.fail_next_compensation([Outcome::transient("refund queue full")]);

    let execution = h.executor.execute(&h.order_saga(), Value::Null).await.unwrap();

    assert_eq!(execution.status(), SagaStatus::Compensated);
    let refund = &execution.compensation_results()[0];
    assert_eq!(refund.step_id, "charge");
    assert_eq!(refund.attempts, 2);
    assert_eq!(h.payment.active_count(), 0);
}

#[tokio::test]
async fn test_step_compensation_retry_policy_overrides_default() {
    let h = TestHarness::new();
    h.shipping.fail_always(Outcome::permanent("no carrier"));
    h.payment.fail_next_compensation([
        Outcome::transient("refund queue full"),
        Outcome::transient("refund queue full"),
        Outcome::transient("refund queue full"),
        Outcome::transient("refund queue full"),
    ]);

    let definition = SagaDefinition::builder("order_fulfillment")
        .step(h.inventory.step())
        .step(
            h.payment
                .step()
                .with_compensation_retry_policy(RetryPolicy::immediate(5)),
        )
        .step(h.shipping.step())
        .build()
        .unwrap();

    let execution = h.executor.execute(&definition, Value::Null).await.unwrap();

    // The executor default allows 3 compensation attempts.
    assert_eq!(execution.status(), SagaStatus::Compensated);
    let refund = execution.compensation_results()[0].clone();
    assert_eq!(refund.step_id, "charge");
    assert_eq!(refund.attempts, 5);
    assert_eq!(refund.outcome, OutcomeKind::Success);
    assert_eq!(h.payment.compensation_keys().len(), 5);
    assert_eq!(h.payment.active_count(), 0);
}

#[tokio::test]
async fn test_compensation_falls_back_to_step_retry_policy() {
    let h = TestHarness::new();
    h.shipping.fail_always(Outcome::permanent("no carrier"));
    h.payment.fail_next_compensation([
        Outcome::transient("refund queue full"),
        Outcome::transient("refund queue full"),
        Outcome::transient("refund queue full"),
    ]);

    let definition = SagaDefinition::builder("order_fulfillment")
        .step(h.inventory.step())
        .step(h.payment.step().with_retry_policy(RetryPolicy::immediate(4)))
        .step(h.shipping.step())
        .build()
        .unwrap();

    let execution = h.executor.execute(&definition, Value::Null).await.unwrap();

    assert_eq!(execution.status(), SagaStatus::Compensated);
    let refund = &execution.compensation_results()[0];
    assert_eq!(refund.attempts, 4);
    assert_eq!(refund.outcome, OutcomeKind::Success);
}

#[tokio::test]
async fn test_step_compensation_retry_policy_can_be_stricter() {
    let h = TestHarness::new();
    h.shipping.fail_always(Outcome::permanent("no carrier"));
    h.payment.fail_next_compensation([Outcome::transient("refund queue full")]);

    let definition = SagaDefinition::builder("order_fulfillment")
        .step(h.inventory.step())
        .step(
            h.payment
                .step()
                .with_compensation_retry_policy(RetryPolicy::no_retry()),
        )
        .step(h.shipping.step())
        .build()
        .unwrap();

    let execution = h.executor.execute(&definition, Value::Null).await.unwrap();

    assert_eq!(execution.status(), SagaStatus::Failed);
    assert_eq!(execution.failed_compensations(), [StepId::new("charge")]);
    assert_eq!(execution.compensation_results()[0].attempts, 1);
}

#[tokio::test]
async fn test_best_effort_unwind_reports_failed_compensation() {
    let h = TestHarness::new();
    h.shipping.fail_always(Outcome::permanent("no carrier"));
    h.payment
        .fail_compensation_always(Outcome::permanent("refund rejected"));

    let execution = h.executor.execute(&h.order_saga(), Value::Null).await.unwrap();

    assert_eq!(execution.status(), SagaStatus::Failed);
    assert_eq!(execution.failed_compensations(), [StepId::new("charge")]);
    // The unwind continues past the failed refund.
    assert_eq!(h.journal.compensations(), ["undo:charge", "undo:reserve"]);
    assert_eq!(h.inventory.active_count(), 0);
    assert_eq!(h.payment.active_count(), 1);
}

#[tokio::test]
async fn test_abort_unwind_stops_at_failed_compensation() {
    let h = TestHarness::with_config(ExecutorConfig {
        unwind: UnwindPolicy::Abort,
        ..fast_config()
    });
    h.shipping.fail_always(Outcome::permanent("no carrier"));
    h.payment
        .fail_compensation_always(Outcome::permanent("refund rejected"));

    let execution = h.executor.execute(&h.order_saga(), Value::Null).await.unwrap();

    assert_eq!(execution.status(), SagaStatus::Failed);
    assert_eq!(
        execution.failed_compensations(),
        [StepId::new("charge"), StepId::new("reserve")]
    );
    assert_eq!(h.journal.compensations(), ["undo:charge"]);
    assert_eq!(h.inventory.active_count(), 1);
}

#[tokio::test]
async fn test_compensation_retries_exhausted() {
    let h = TestHarness::new();
    h.shipping.fail_always(Outcome::permanent("no carrier"));
    h.payment
        .fail_compensation_always(Outcome::transient("refund queue full"));

    let execution = h.executor.execute(&h.order_saga(), Value::Null).await.unwrap();

    assert_eq!(execution.status(), SagaStatus::Failed);
    let refund = &execution.compensation_results()[0];
    assert_eq!(refund.attempts, 3);
    assert_eq!(refund.outcome, OutcomeKind::PermanentFailure);
}

#[tokio::test]
async fn test_failure_at_each_position_compensates_prefix_in_reverse() {
    let names = ["s1", "s2", "s3", "s4"];

    for failing in 0..names.len() {
        let h = TestHarness::new();
        let services: Vec<InMemoryService> = names
            .iter()
            .map(|&name| InMemoryService::new(name, h.journal.clone()))
            .collect();
        services[failing].fail_always(Outcome::permanent("boom"));

        let definition = services
            .iter()
            .fold(SagaDefinition::builder("chain"), |builder, service| {
                builder.step(service.step())
            })
            .build()
            .unwrap();

        let execution = h.executor.execute(&definition, Value::Null).await.unwrap();

        let expected: Vec<String> = names[..failing]
            .iter()
            .rev()
            .map(|name| format!("undo:{name}"))
            .collect();
        assert_eq!(execution.status(), SagaStatus::Compensated);
        assert_eq!(h.journal.compensations(), expected, "failing step {failing}");
        assert!(services.iter().all(|s| s.active_count() == 0));
    }
}

#[tokio::test]
async fn test_step_outputs_and_input_visible_to_later_steps() {
    let h = TestHarness::new();
    let seen = Journal::default();
    let recorder = seen.clone();

    let definition = SagaDefinition::builder("order_fulfillment")
        .step(h.inventory.step())
        .step(Step::new(
            "label",
            move |ctx: StepContext| {
                let reservation = ctx.output("reserve").cloned().unwrap_or_default();
                recorder.push(format!("{}|{}", ctx.input["order"], reservation["id"]));
                async { Outcome::Success(json!({ "label": "L-1" })) }
            },
            |_ctx: StepContext| async { Outcome::success() },
        ))
        .build()
        .unwrap();

    let execution = h
        .executor
        .execute(&definition, json!({ "order": "A-7" }))
        .await
        .unwrap();

    let key = IdempotencyKey::derive(execution.id(), &StepId::new("reserve"));
    assert_eq!(seen.entries(), [format!("\"A-7\"|\"reserve-{key}\"")]);
    assert_eq!(
        execution.step_result("label").unwrap().output,
        Some(json!({ "label": "L-1" }))
    );
}

#[tokio::test]
async fn test_events_for_completed_execution() {
    let h = TestHarness::new();

    let execution = h.executor.execute(&h.order_saga(), Value::Null).await.unwrap();

    assert_eq!(
        h.sink.event_types_for(execution.id()),
        [
            "SagaStarted",
            "StepStarted",
            "StepSucceeded",
            "StepStarted",
            "StepSucceeded",
            "StepStarted",
            "StepSucceeded",
            "SagaCompleted",
        ]
    );
    assert!(
        h.sink
            .events_for(execution.id())
            .iter()
            .all(|e| e.saga_name == "order_fulfillment")
    );
}

#[tokio::test]
async fn test_events_for_compensated_execution() {
    let h = TestHarness::new();
    h.payment.fail_next([Outcome::transient("gateway busy")]);
    h.shipping.fail_always(Outcome::permanent("no carrier"));

    let execution = h.executor.execute(&h.order_saga(), Value::Null).await.unwrap();

    assert_eq!(
        h.sink.event_types_for(execution.id()),
        [
            "SagaStarted",
            "StepStarted",
            "StepSucceeded",
            "StepStarted",
            "StepFailed",
            "StepStarted",
            "StepSucceeded",
            "StepStarted",
            "StepFailed",
            "SagaCompensating",
            "CompensationStarted",
            "CompensationSucceeded",
            "CompensationStarted",
            "CompensationSucceeded",
            "SagaCompensated",
        ]
    );
}

#[tokio::test]
async fn test_sink_failure_does_not_affect_outcome() {
    let h = TestHarness::new();
    h.sink.set_fail_on_publish(true);
    h.shipping.fail_always(Outcome::permanent("no carrier"));

    let execution = h.executor.execute(&h.order_saga(), Value::Null).await.unwrap();

    assert_eq!(execution.status(), SagaStatus::Compensated);
    assert!(h.sink.is_empty());
}

#[tokio::test]
async fn test_status_reads_persisted_snapshot() {
    let h = TestHarness::new();

    let execution = h.executor.execute(&h.order_saga(), Value::Null).await.unwrap();
    let snapshot = h.executor.status(execution.id()).await.unwrap();

    assert_eq!(snapshot.status(), SagaStatus::Completed);
    assert_eq!(snapshot.step_results(), execution.step_results());
    assert_eq!(snapshot.version(), execution.version());

    let record = h.store.load(execution.id()).await.unwrap().unwrap();
    assert!(record.terminal);
    assert_eq!(record.status, "Completed");
    assert!(h.store.in_flight().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_executions_are_independent() {
    let h = TestHarness::new();
    h.shipping.fail_next([
        Outcome::permanent("no carrier"),
        Outcome::permanent("no carrier"),
        Outcome::permanent("no carrier"),
    ]);
    let definition = h.order_saga();

    let executions = join_all((0..10).map(|n| {
        let executor = h.executor.clone();
        let definition = definition.clone();
        async move { executor.execute(&definition, json!({ "n": n })).await }
    }))
    .await;

    let mut compensated = 0;
    for execution in executions {
        let execution = execution.unwrap();
        match execution.status() {
            SagaStatus::Completed => {
                assert_eq!(execution.step_results().len(), 3);
                assert!(execution.compensation_results().is_empty());
            }
            SagaStatus::Compensated => {
                compensated += 1;
                let undone: Vec<&str> = execution
                    .compensation_results()
                    .iter()
                    .map(|r| r.step_id.as_str())
                    .collect();
                assert_eq!(undone, ["charge", "reserve"]);
            }
            other => panic!("unexpected status {other}"),
        }
    }

    assert_eq!(compensated, 3);
    assert_eq!(h.inventory.active_count(), 7);
    assert_eq!(h.payment.active_count(), 7);
    assert_eq!(h.shipping.active_count(), 7);
    assert_eq!(h.executor.active_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_different_definitions_run_side_by_side() {
    let h = TestHarness::new();
    let other = Journal::default();
    let refunds = InMemoryService::new("refund", other.clone());
    let notices = InMemoryService::new("notify", other.clone());

    let orders = h.order_saga();
    let returns = SagaDefinition::builder("returns")
        .step(refunds.step())
        .step(notices.step())
        .build()
        .unwrap();

    let (order, ret) = tokio::join!(
        h.executor.execute(&orders, Value::Null),
        h.executor.execute(&returns, Value::Null),
    );
    let (order, ret) = (order.unwrap(), ret.unwrap());

    let order_steps: Vec<&str> = order.step_results().iter().map(|r| r.step_id.as_str()).collect();
    let return_steps: Vec<&str> = ret.step_results().iter().map(|r| r.step_id.as_str()).collect();
    assert_eq!(order_steps, ["reserve", "charge", "ship"]);
    assert_eq!(return_steps, ["refund", "notify"]);
    assert_eq!(h.journal.entries(), ["reserve", "charge", "ship"]);
    assert_eq!(other.entries(), ["refund", "notify"]);
}
