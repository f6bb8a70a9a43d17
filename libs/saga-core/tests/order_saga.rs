//! End-to-end saga scenarios over the in-memory store with scripted steps:
//! the order workflow's happy path, payment failure with compensation,
//! step timeout, partial compensation failure, and stuck-instance recovery.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use saga_core::{
    CompensationError, InMemorySagaStore, OrchestratorConfig, RecoveryWorker,
    RecoveryWorkerConfig, SagaDefinition, SagaOrchestrator, SagaStateStore, SagaStatus, SagaStep,
    StepContext, StepResult,
};

#[derive(Clone)]
enum Behavior {
    Succeed(Option<Value>),
    Fail(&'static str),
    Hang,
}

/// A step scripted for one scenario. Records every execution and
/// compensation into a shared effect log.
struct ScriptedStep {
    name: &'static str,
    behavior: Behavior,
    compensation_fails: bool,
    log: Arc<Mutex<Vec<String>>>,
    executions: Arc<AtomicU32>,
}

impl ScriptedStep {
    fn new(name: &'static str, behavior: Behavior, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            behavior,
            compensation_fails: false,
            log,
            executions: Arc::new(AtomicU32::new(0)),
        })
    }

    fn failing_compensation(
        name: &'static str,
        behavior: Behavior,
        log: Arc<Mutex<Vec<String>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            behavior,
            compensation_fails: true,
            log,
            executions: Arc::new(AtomicU32::new(0)),
        })
    }
}

#[async_trait]
impl SagaStep for ScriptedStep {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, _ctx: StepContext<'_>) -> StepResult {
        self.executions.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Succeed(delta) => {
                self.log.lock().unwrap().push(format!("exec:{}", self.name));
                StepResult::Success(delta.clone())
            }
            Behavior::Fail(reason) => StepResult::failure(*reason),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                StepResult::success()
            }
        }
    }

    async fn compensate(&self, _ctx: StepContext<'_>) -> Result<(), CompensationError> {
        if self.compensation_fails {
            return Err(CompensationError("participant unreachable".to_string()));
        }
        self.log.lock().unwrap().push(format!("comp:{}", self.name));
        Ok(())
    }
}

fn order_payload() -> Value {
    json!({
        "order_id": Uuid::new_v4(),
        "items": [
            {"sku": "A", "quantity": 2, "unit_price_cents": 1000},
            {"sku": "B", "quantity": 1, "unit_price_cents": 500},
        ],
        "total_cents": 2500,
    })
}

fn orchestrator(
    store: Arc<InMemorySagaStore>,
    definition: SagaDefinition,
) -> SagaOrchestrator {
    SagaOrchestrator::new(
        store,
        Arc::new(definition),
        OrchestratorConfig {
            step_timeout: Duration::from_millis(100),
            compensation_timeout: Duration::from_millis(100),
        },
    )
}

#[tokio::test]
async fn happy_path_completes_all_steps_in_order() {
    let store = Arc::new(InMemorySagaStore::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let definition = SagaDefinition::new("create-order")
        .step(ScriptedStep::new(
            "reserve-inventory",
            Behavior::Succeed(Some(json!({"reservation_id": "r-1"}))),
            log.clone(),
        ))
        .step(ScriptedStep::new(
            "charge-payment",
            Behavior::Succeed(Some(json!({"charge_id": "c-1"}))),
            log.clone(),
        ))
        .step(ScriptedStep::new(
            "create-shipment",
            Behavior::Succeed(Some(json!({"tracking_number": "TRK-1"}))),
            log.clone(),
        ))
        .step(ScriptedStep::new(
            "confirm-order",
            Behavior::Succeed(None),
            log.clone(),
        ));

    let orchestrator = orchestrator(store.clone(), definition);
    let correlation_id = Uuid::new_v4();

    let final_state = orchestrator
        .start(correlation_id, order_payload())
        .await
        .unwrap();

    assert_eq!(final_state.status, SagaStatus::Completed);
    assert_eq!(
        final_state.completed_steps,
        vec![
            "reserve-inventory",
            "charge-payment",
            "create-shipment",
            "confirm-order"
        ]
    );
    assert!(final_state.compensated_steps.is_empty());
    assert!(final_state.error.is_none());

    // Step deltas accumulated into the state payload.
    assert_eq!(final_state.state_data["reservation_id"], "r-1");
    assert_eq!(final_state.state_data["charge_id"], "c-1");
    assert_eq!(final_state.state_data["tracking_number"], "TRK-1");
    assert_eq!(final_state.state_data["total_cents"], 2500);

    // Declared order, each effect exactly once.
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "exec:reserve-inventory",
            "exec:charge-payment",
            "exec:create-shipment",
            "exec:confirm-order"
        ]
    );
}

#[tokio::test]
async fn payment_failure_compensates_in_reverse_order() {
    let store = Arc::new(InMemorySagaStore::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let shipment = ScriptedStep::new("create-shipment", Behavior::Succeed(None), log.clone());
    let definition = SagaDefinition::new("create-order")
        .step(ScriptedStep::new(
            "reserve-inventory",
            Behavior::Succeed(None),
            log.clone(),
        ))
        .step(ScriptedStep::new(
            "charge-payment",
            Behavior::Fail("card_declined"),
            log.clone(),
        ))
        .step(shipment.clone());

    let orchestrator = orchestrator(store.clone(), definition);
    let correlation_id = Uuid::new_v4();

    let final_state = orchestrator
        .start(correlation_id, order_payload())
        .await
        .unwrap();

    assert_eq!(final_state.status, SagaStatus::Compensated);
    assert_eq!(final_state.completed_steps, vec!["reserve-inventory"]);
    assert_eq!(final_state.compensated_steps, vec!["reserve-inventory"]);
    assert_eq!(final_state.error.as_deref(), Some("card_declined"));

    // The step after the failure never ran; only completed work was undone.
    assert_eq!(shipment.executions.load(Ordering::SeqCst), 0);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["exec:reserve-inventory", "comp:reserve-inventory"]
    );
}

#[tokio::test]
async fn failure_after_multiple_steps_unwinds_newest_first() {
    let store = Arc::new(InMemorySagaStore::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let definition = SagaDefinition::new("create-order")
        .step(ScriptedStep::new(
            "reserve-inventory",
            Behavior::Succeed(None),
            log.clone(),
        ))
        .step(ScriptedStep::new(
            "charge-payment",
            Behavior::Succeed(None),
            log.clone(),
        ))
        .step(ScriptedStep::new(
            "create-shipment",
            Behavior::Fail("no_carrier"),
            log.clone(),
        ));

    let orchestrator = orchestrator(store.clone(), definition);
    let final_state = orchestrator
        .start(Uuid::new_v4(), order_payload())
        .await
        .unwrap();

    assert_eq!(final_state.status, SagaStatus::Compensated);
    assert_eq!(
        final_state.compensated_steps,
        vec!["charge-payment", "reserve-inventory"]
    );
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "exec:reserve-inventory",
            "exec:charge-payment",
            "comp:charge-payment",
            "comp:reserve-inventory"
        ]
    );
}

#[tokio::test]
async fn step_timeout_is_a_business_failure() {
    let store = Arc::new(InMemorySagaStore::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let definition = SagaDefinition::new("create-order")
        .step(ScriptedStep::new(
            "reserve-inventory",
            Behavior::Succeed(None),
            log.clone(),
        ))
        .step(ScriptedStep::new(
            "charge-payment",
            Behavior::Hang,
            log.clone(),
        ));

    let orchestrator = orchestrator(store.clone(), definition);
    let final_state = orchestrator
        .start(Uuid::new_v4(), order_payload())
        .await
        .unwrap();

    assert_eq!(final_state.status, SagaStatus::Compensated);
    assert_eq!(final_state.error.as_deref(), Some("timeout"));
    assert_eq!(final_state.compensated_steps, vec!["reserve-inventory"]);
}

#[tokio::test]
async fn compensation_failure_continues_walk_and_ends_failed() {
    let store = Arc::new(InMemorySagaStore::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let definition = SagaDefinition::new("create-order")
        .step(ScriptedStep::new(
            "reserve-inventory",
            Behavior::Succeed(None),
            log.clone(),
        ))
        .step(ScriptedStep::failing_compensation(
            "charge-payment",
            Behavior::Succeed(None),
            log.clone(),
        ))
        .step(ScriptedStep::new(
            "create-shipment",
            Behavior::Fail("no_carrier"),
            log.clone(),
        ));

    let orchestrator = orchestrator(store.clone(), definition);
    let final_state = orchestrator
        .start(Uuid::new_v4(), order_payload())
        .await
        .unwrap();

    // charge-payment could not be undone, but reserve-inventory still was.
    assert_eq!(final_state.status, SagaStatus::Failed);
    assert_eq!(final_state.compensated_steps, vec!["reserve-inventory"]);
    let error = final_state.error.unwrap();
    assert!(error.contains("no_carrier"));
    assert!(error.contains("compensation 'charge-payment' failed"));
    assert!(log
        .lock()
        .unwrap()
        .contains(&"comp:reserve-inventory".to_string()));
}

#[tokio::test]
async fn version_increases_strictly_across_the_run() {
    let store = Arc::new(InMemorySagaStore::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let definition = SagaDefinition::new("create-order")
        .step(ScriptedStep::new(
            "reserve-inventory",
            Behavior::Succeed(None),
            log.clone(),
        ))
        .step(ScriptedStep::new(
            "charge-payment",
            Behavior::Succeed(None),
            log.clone(),
        ));

    let orchestrator = orchestrator(store.clone(), definition);
    let correlation_id = Uuid::new_v4();

    let final_state = orchestrator
        .start(correlation_id, order_payload())
        .await
        .unwrap();

    // create(1), InProgress(2), two step persists(3,4), Completed(5).
    assert_eq!(final_state.version, 5);

    let loaded = store.load(correlation_id).await.unwrap();
    assert_eq!(loaded.version, final_state.version);
    assert_eq!(loaded.status, SagaStatus::Completed);
}

#[tokio::test]
async fn recovery_resumes_stuck_saga_without_rerunning_done_steps() {
    let store = Arc::new(InMemorySagaStore::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let reserve = ScriptedStep::new("reserve-inventory", Behavior::Succeed(None), log.clone());
    let charge = ScriptedStep::new("charge-payment", Behavior::Succeed(None), log.clone());
    let ship = ScriptedStep::new("create-shipment", Behavior::Succeed(None), log.clone());

    let definition = SagaDefinition::new("create-order")
        .step(reserve.clone())
        .step(charge.clone())
        .step(ship.clone());

    // Simulate an orchestrator that died after step 2 succeeded: the
    // persisted state says two steps are done and the third never started.
    let correlation_id = Uuid::new_v4();
    let mut crashed = saga_core::SagaState::new("create-order", correlation_id, order_payload());
    crashed.status = SagaStatus::InProgress;
    crashed.current_step = 2;
    crashed.completed_steps = vec![
        "reserve-inventory".to_string(),
        "charge-payment".to_string(),
    ];
    store.create(&crashed).await.unwrap();

    let orchestrator = Arc::new(orchestrator(store.clone(), definition));
    let worker = RecoveryWorker::new(
        store.clone(),
        RecoveryWorkerConfig {
            scan_interval: Duration::from_millis(10),
            stuck_threshold: Duration::ZERO,
        },
    )
    .register_orchestrator(orchestrator);

    let report = worker.scan().await.unwrap();
    assert_eq!(report.resumed, 1);

    let final_state = store.load(correlation_id).await.unwrap();
    assert_eq!(final_state.status, SagaStatus::Completed);
    assert_eq!(final_state.completed_steps.len(), 3);

    // Only the interrupted step ran; the first two were not re-executed.
    assert_eq!(reserve.executions.load(Ordering::SeqCst), 0);
    assert_eq!(charge.executions.load(Ordering::SeqCst), 0);
    assert_eq!(ship.executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn recovery_resumes_interrupted_compensation() {
    let store = Arc::new(InMemorySagaStore::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let reserve = ScriptedStep::new("reserve-inventory", Behavior::Succeed(None), log.clone());
    let charge = ScriptedStep::new("charge-payment", Behavior::Succeed(None), log.clone());

    let definition = SagaDefinition::new("create-order")
        .step(reserve.clone())
        .step(charge.clone());

    // Died mid-compensation: charge-payment already undone, the rest not.
    let correlation_id = Uuid::new_v4();
    let mut crashed = saga_core::SagaState::new("create-order", correlation_id, order_payload());
    crashed.status = SagaStatus::Compensating;
    crashed.current_step = 2;
    crashed.completed_steps = vec![
        "reserve-inventory".to_string(),
        "charge-payment".to_string(),
    ];
    crashed.compensated_steps = vec!["charge-payment".to_string()];
    crashed.error = Some("no_carrier".to_string());
    store.create(&crashed).await.unwrap();

    let orchestrator = Arc::new(orchestrator(store.clone(), definition));
    let worker = RecoveryWorker::new(
        store.clone(),
        RecoveryWorkerConfig {
            scan_interval: Duration::from_millis(10),
            stuck_threshold: Duration::ZERO,
        },
    )
    .register_orchestrator(orchestrator);

    worker.scan().await.unwrap();

    let final_state = store.load(correlation_id).await.unwrap();
    assert_eq!(final_state.status, SagaStatus::Compensated);
    assert_eq!(
        final_state.compensated_steps,
        vec!["charge-payment", "reserve-inventory"]
    );
    // Only the not-yet-undone step was compensated on resume.
    assert_eq!(*log.lock().unwrap(), vec!["comp:reserve-inventory"]);
}

#[tokio::test]
async fn duplicate_start_is_rejected() {
    let store = Arc::new(InMemorySagaStore::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let definition = SagaDefinition::new("create-order").step(ScriptedStep::new(
        "reserve-inventory",
        Behavior::Succeed(None),
        log.clone(),
    ));

    let orchestrator = orchestrator(store.clone(), definition);
    let correlation_id = Uuid::new_v4();

    orchestrator
        .start(correlation_id, order_payload())
        .await
        .unwrap();
    let err = orchestrator
        .start(correlation_id, order_payload())
        .await
        .unwrap_err();

    assert!(matches!(err, saga_core::SagaError::DuplicateCorrelation(_)));
}
