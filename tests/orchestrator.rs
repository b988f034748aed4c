//! End-to-end orchestration scenarios against a real on-disk store.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;

use armitage::admin::Admin;
use armitage::circuit::manager::{AdmissionDecision, CircuitManager};
use armitage::circuit::DenyReason;
use armitage::claim::ClaimEngine;
use armitage::config::{CircuitsConfig, Config};
use armitage::stage::collaborators::{
    ExportChecker, NoopLlm, ProcessVerifier, TieredPromptBuilder,
};
use armitage::stage::StageExecutor;
use armitage::store::{ReleaseDisposition, Store};
use armitage::types::{ClaimOutcome, Complexity, Stage, TaskSpec, TaskStatus, WorkerStatus};
use armitage::worker::pool::{PoolOptions, WorkerPool};

async fn open_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(&dir.path().join("state.db"))
        .await
        .expect("open store");
    (store, dir)
}

fn t0() -> DateTime<Utc> {
    armitage::types::parse_ts("2026-01-01T00:00:00Z").expect("ts")
}

fn spec(key: &str, phase: i64, sequence: i64, depends_on: Vec<String>) -> TaskSpec {
    TaskSpec {
        task_key: key.to_owned(),
        title: format!("task {key}"),
        goal: String::new(),
        phase,
        sequence,
        complexity: Complexity::Medium,
        depends_on,
        acceptance_criteria: Vec::new(),
        test_file: None,
        impl_file: None,
        verify_command: Vec::new(),
        module_exports: Vec::new(),
        hints: None,
    }
}

/// Scenario 1: two workers race for one task; exactly one wins and the
/// winner's claim is audited.
#[tokio::test]
async fn two_workers_race_for_one_task() {
    let (store, _dir) = open_store().await;
    let now = t0();
    let task_id = store
        .insert_task(&spec("T1", 0, 0, Vec::new()), now)
        .await
        .expect("insert");

    let engine = ClaimEngine::new(store.clone(), 300);
    let (a, b) = tokio::join!(engine.claim_next(1, now), engine.claim_next(2, now));
    let a = a.expect("claim a");
    let b = b.expect("claim b");
    assert!(a.is_some() != b.is_some(), "exactly one worker wins");

    let winner = a.or(b).expect("winner");
    assert_eq!(winner.status, TaskStatus::InProgress);
    assert_eq!(winner.version, 2);
    assert!(winner.claim_by.is_some());

    let audit = store.list_claim_audit(task_id).await.expect("audit");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].worker_id, winner.claim_by.expect("claimant"));
    assert!(audit[0].outcome.is_none(), "claim is still live");
}

/// Scenario 2: a worker dies mid-task; the reaper reverts the task, the
/// stale scan catches the worker, and another worker picks the task up.
#[tokio::test]
async fn worker_dies_mid_task() {
    let (store, _dir) = open_store().await;
    let now = t0();
    store
        .insert_task(&spec("T1", 0, 0, Vec::new()), now)
        .await
        .expect("insert");
    store.register_worker(1, None, now).await.expect("register");
    store.register_worker(2, None, now).await.expect("register");

    let engine = ClaimEngine::new(store.clone(), 300);
    let task = engine.claim_next(1, now).await.expect("claim").expect("some");
    store
        .heartbeat(1, WorkerStatus::Active, Some(task.id), now)
        .await
        .expect("heartbeat");
    // Worker 1 stops heartbeating here.

    let at_301 = now.checked_add_signed(Duration::seconds(301)).expect("ts");
    let reaped = engine.reap_expired(at_301).await.expect("reap");
    assert_eq!(reaped, vec![task.id]);

    let row = store.get_task(task.id).await.expect("get");
    assert_eq!(row.status, TaskStatus::Pending);
    assert_eq!(row.version, 3);
    assert!(row.claim_by.is_none());

    let audit = store.list_claim_audit(task.id).await.expect("audit");
    assert_eq!(audit[0].outcome, Some(ClaimOutcome::Timeout));

    // Just past t = 600 s the worker itself is stale.
    let at_601 = now.checked_add_signed(Duration::seconds(601)).expect("ts");
    let stale = store
        .stale_workers(at_601, Duration::minutes(10))
        .await
        .expect("scan");
    assert!(stale.iter().any(|w| w.id == 1));

    // Any subsequent claim from another worker returns the task.
    let reclaimed = engine
        .claim_next(2, at_601)
        .await
        .expect("claim")
        .expect("some");
    assert_eq!(reclaimed.id, task.id);
    assert_eq!(reclaimed.claim_by, Some(2));
}

/// Scenario 3: a stage breaker trips after exactly five failures, cools
/// down into a probe, and either closes or re-opens with an extension.
#[tokio::test]
async fn stage_breaker_trip_and_recovery_cycle() {
    let (store, _dir) = open_store().await;
    let circuits = CircuitManager::new(store.clone(), CircuitsConfig::default());
    let now = t0();

    // Five consecutive failures from distinct workers (so only the stage
    // breaker accumulates).
    for worker_id in 1..5 {
        circuits
            .record_outcome(worker_id, "TDD-17", Stage::Green, false, now)
            .await
            .expect("record");
        let decision = circuits
            .check_admission(10, "TDD-17", Stage::Green, now)
            .await
            .expect("check");
        assert_eq!(
            decision,
            AdmissionDecision::Admitted,
            "breaker must not trip before the threshold"
        );
    }
    circuits
        .record_outcome(5, "TDD-17", Stage::Green, false, now)
        .await
        .expect("record");

    let decision = circuits
        .check_admission(10, "TDD-17", Stage::Green, now)
        .await
        .expect("check");
    assert_eq!(decision, AdmissionDecision::Denied(DenyReason::StageOpen));

    // After the cooldown one probe is admitted; its failure re-opens the
    // breaker with one extension consumed.
    let after = now.checked_add_signed(Duration::seconds(61)).expect("ts");
    let decision = circuits
        .check_admission(10, "TDD-17", Stage::Green, after)
        .await
        .expect("check");
    assert_eq!(decision, AdmissionDecision::Admitted);
    circuits
        .record_outcome(10, "TDD-17", Stage::Green, false, after)
        .await
        .expect("record");

    let decision = circuits
        .check_admission(10, "TDD-17", Stage::Green, after)
        .await
        .expect("check");
    assert_eq!(decision, AdmissionDecision::Denied(DenyReason::StageOpen));

    // Second cooldown, successful probe: closed again.
    let again = after.checked_add_signed(Duration::seconds(61)).expect("ts");
    let decision = circuits
        .check_admission(11, "TDD-17", Stage::Green, again)
        .await
        .expect("check");
    assert_eq!(decision, AdmissionDecision::Admitted);
    circuits
        .record_outcome(11, "TDD-17", Stage::Green, true, again)
        .await
        .expect("record");
    let decision = circuits
        .check_admission(12, "TDD-17", Stage::Green, again)
        .await
        .expect("check");
    assert_eq!(decision, AdmissionDecision::Admitted);
}

/// Scenario 4: the system breaker opens on the aggregate failure rate and
/// a manual reset restores admissions.
#[tokio::test]
async fn system_breaker_opens_then_manual_reset() {
    let (store, _dir) = open_store().await;
    let circuits = CircuitManager::new(store.clone(), CircuitsConfig::default());
    let admin = Admin::new(store.clone(), CircuitsConfig::default());
    let now = t0();

    // Mostly healthy traffic spread over distinct workers and tasks, then
    // a failure burst pushing the 30-attempt window to a 20% rate.
    for i in 0..25_i64 {
        circuits
            .record_outcome(i, &format!("OK-{i}"), Stage::Green, true, now)
            .await
            .expect("record");
    }
    for i in 0..6_i64 {
        circuits
            .record_outcome(
                i.checked_add(30).expect("id"),
                &format!("BAD-{i}"),
                Stage::Green,
                false,
                now,
            )
            .await
            .expect("record");
    }

    let decision = circuits
        .check_admission(99, "NEXT", Stage::Red, now)
        .await
        .expect("check");
    assert_eq!(decision, AdmissionDecision::Denied(DenyReason::SystemOpen));

    let state = admin
        .reset_circuit(armitage::types::CircuitLevel::System, "system", now)
        .await
        .expect("reset");
    assert_eq!(state, armitage::types::CircuitState::Closed);

    let decision = circuits
        .check_admission(99, "NEXT", Stage::Red, now)
        .await
        .expect("check");
    assert_eq!(decision, AdmissionDecision::Admitted);
}

/// While the system breaker is open, workers stop issuing claims
/// entirely instead of churning through claim/release cycles.
#[tokio::test]
async fn open_system_breaker_stops_claim_issuance() {
    let (store, _dir) = open_store().await;
    let now = Utc::now();

    // Trip the system breaker at wall-clock time so its 300 s cooldown
    // spans the whole test. Distinct workers and task keys keep the other
    // breaker levels quiet.
    let circuits = CircuitManager::new(store.clone(), CircuitsConfig::default());
    for i in 0..10_i64 {
        circuits
            .record_outcome(i, &format!("SEED-{i}"), Stage::Green, false, now)
            .await
            .expect("record");
    }

    store
        .insert_task(&spec("T1", 0, 0, Vec::new()), now)
        .await
        .expect("insert");
    store
        .insert_task(&spec("T2", 0, 1, Vec::new()), now)
        .await
        .expect("insert");

    let mut config = Config::default();
    config.pool.poll_interval_seconds = 1;
    let config = Arc::new(config);
    let executor = StageExecutor::new(
        store.clone(),
        Arc::new(TieredPromptBuilder),
        Arc::new(NoopLlm),
        Arc::new(ProcessVerifier::new(std::time::Duration::from_secs(5))),
        Arc::new(ExportChecker),
    );
    let pool = WorkerPool::new(store.clone(), Arc::clone(&config), executor);

    // The pool cannot finish on its own (the tasks stay pending), so stop
    // it externally after a few poll cycles.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        let _ = shutdown_tx.send(true);
    });

    let summary = pool
        .run(
            PoolOptions {
                workers: 1,
                resume: false,
            },
            shutdown_rx,
        )
        .await
        .expect("run");

    // No claim was ever issued: versions and the claim audit are untouched
    // and nothing ran against the budget.
    for key in ["T1", "T2"] {
        let task = store.get_task_by_key(key).await.expect("get");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.version, 1, "an open system breaker must not cause claim churn");
        assert!(store.list_claim_audit(task.id).await.expect("audit").is_empty());
    }
    assert_eq!(summary.invocations_used, 0);
}

/// Scenario 5: a full pool run halts at the invocation budget and the
/// terminal summary reports exactly the budget spent.
#[tokio::test]
async fn budget_exhaustion_halts_the_run() {
    let (store, _dir) = open_store().await;
    let now = Utc::now();
    for (i, key) in ["T1", "T2", "T3"].iter().enumerate() {
        store
            .insert_task(
                &spec(key, 0, i64::try_from(i).expect("small"), Vec::new()),
                now,
            )
            .await
            .expect("insert");
    }

    let mut config = Config::default();
    config.pool.max_invocations_per_session = 4;
    config.pool.poll_interval_seconds = 1;
    let config = Arc::new(config);

    let executor = StageExecutor::new(
        store.clone(),
        Arc::new(TieredPromptBuilder),
        Arc::new(NoopLlm),
        Arc::new(ProcessVerifier::new(std::time::Duration::from_secs(5))),
        Arc::new(ExportChecker),
    );
    let pool = WorkerPool::new(store.clone(), Arc::clone(&config), executor);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let summary = pool
        .run(
            PoolOptions {
                workers: 2,
                resume: false,
            },
            shutdown_rx,
        )
        .await
        .expect("run");

    assert_eq!(summary.invocations_used, 4);
    assert_eq!(summary.max_invocations, 4);

    // Nothing is stranded in progress; whatever the budget cut off went
    // back to pending for the next run. Two invocations per task means at
    // most two of the three can have finished.
    let count = |status: TaskStatus| {
        summary
            .status_counts
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    };
    assert_eq!(count(TaskStatus::InProgress), 0);
    assert!(count(TaskStatus::Passing) >= 1);
    assert!(count(TaskStatus::Pending) >= 1);
    assert_eq!(
        count(TaskStatus::Passing).saturating_add(count(TaskStatus::Pending)),
        3
    );
}

/// Scenario 6: dependency chains gate claiming until the prerequisite
/// passes, then release in (phase, sequence) order.
#[tokio::test]
async fn dependency_chain_gates_claims() {
    let (store, _dir) = open_store().await;
    let now = t0();
    store
        .insert_task(&spec("T2", 0, 1, vec!["T1".to_owned()]), now)
        .await
        .expect("insert");
    store
        .insert_task(&spec("T1", 0, 0, Vec::new()), now)
        .await
        .expect("insert");

    let engine = ClaimEngine::new(store.clone(), 300);

    let first = engine.claim_next(1, now).await.expect("claim").expect("some");
    assert_eq!(first.task_key, "T1");

    // T2 is never returned while its dependency is unfinished.
    assert!(engine.claim_next(2, now).await.expect("claim").is_none());

    engine
        .release(first.id, first.version, ReleaseDisposition::Passing, now)
        .await
        .expect("release");

    let second = engine.claim_next(2, now).await.expect("claim").expect("some");
    assert_eq!(second.task_key, "T2");
}

/// A full pool run over a dependency chain with the default collaborators
/// drives every task to passing.
#[tokio::test]
async fn pool_completes_dependency_chain() {
    let (store, _dir) = open_store().await;
    let now = Utc::now();
    store
        .insert_task(&spec("A", 0, 0, Vec::new()), now)
        .await
        .expect("insert");
    store
        .insert_task(&spec("B", 0, 1, vec!["A".to_owned()]), now)
        .await
        .expect("insert");
    store
        .insert_task(&spec("C", 1, 0, vec!["A".to_owned(), "B".to_owned()]), now)
        .await
        .expect("insert");

    let mut config = Config::default();
    config.pool.poll_interval_seconds = 1;
    let config = Arc::new(config);

    let executor = StageExecutor::new(
        store.clone(),
        Arc::new(TieredPromptBuilder),
        Arc::new(NoopLlm),
        Arc::new(ProcessVerifier::new(std::time::Duration::from_secs(5))),
        Arc::new(ExportChecker),
    );
    let pool = WorkerPool::new(store.clone(), Arc::clone(&config), executor);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let summary = pool
        .run(
            PoolOptions {
                workers: 2,
                resume: false,
            },
            shutdown_rx,
        )
        .await
        .expect("run");

    let passing = summary
        .status_counts
        .iter()
        .find(|(s, _)| *s == TaskStatus::Passing)
        .map(|(_, n)| *n)
        .unwrap_or(0);
    assert_eq!(passing, 3);

    // Attempts exist for every LLM stage of every task.
    for key in ["A", "B", "C"] {
        let task = store.get_task_by_key(key).await.expect("get");
        let attempts = store.list_attempts(task.id).await.expect("attempts");
        assert!(
            attempts.iter().any(|a| a.stage == Stage::Red && a.success),
            "missing RED attempt for {key}"
        );
        assert!(
            attempts.iter().any(|a| a.stage == Stage::Green && a.success),
            "missing GREEN attempt for {key}"
        );
    }
}
