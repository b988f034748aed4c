//! Worker: the claim → execute → report loop.
//!
//! Each worker is an independent tokio task. One iteration heartbeats,
//! asks the claim engine for a runnable task, walks the TDD pipeline with
//! all three breakers consulted before every stage, and releases the
//! claim with the outcome. Denials and budget exhaustion release the task
//! back to pending; the worker never sits on a claim it cannot progress.

pub mod pool;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::circuit::manager::{AdmissionDecision, CircuitManager};
use crate::circuit::DenyReason;
use crate::claim::ClaimEngine;
use crate::config::Config;
use crate::error::{ErrorClass, StageFailure};
use crate::stage::{StageDisposition, StageExecutor};
use crate::store::{ReleaseDisposition, Store, TaskRow};
use crate::types::{Stage, WorkerStatus};

use self::pool::{BudgetStatus, InvocationBudget};

/// Shared dependencies handed to every worker in the pool.
pub struct WorkerDeps {
    /// State database.
    pub store: Store,
    /// Claim engine over the store.
    pub claims: ClaimEngine,
    /// Three-level breaker hierarchy.
    pub circuits: CircuitManager,
    /// Stage executor over the collaborators.
    pub executor: StageExecutor,
    /// Run-scoped invocation budget.
    pub budget: Arc<InvocationBudget>,
    /// Orchestrator configuration.
    pub config: Arc<Config>,
    /// Row id of the current run.
    pub run_id: i64,
    /// Raised when a worker observes a broken invariant; the pool stops
    /// the whole run.
    pub abort: watch::Sender<bool>,
}

/// How one stage run ended, after admission checks and bounded retries.
#[derive(Debug)]
enum StageRun {
    /// Stage succeeded.
    Ok,
    /// A breaker denied admission.
    Denied(DenyReason),
    /// The invocation budget is exhausted; no more LLM stages this run.
    BudgetExhausted,
    /// The verify command failed: candidate for a FIX round.
    TestsFailed,
    /// Static review violations.
    Review(Vec<String>),
    /// Classified infrastructure failure (retries already spent).
    Failed(StageFailure),
}

/// A single pool worker.
pub struct Worker {
    id: i64,
    deps: Arc<WorkerDeps>,
}

impl Worker {
    /// Create worker `id` over the shared dependencies.
    pub fn new(id: i64, deps: Arc<WorkerDeps>) -> Self {
        Self { id, deps }
    }

    /// Run the worker loop until shutdown or budget exhaustion.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(worker_id = self.id, "worker started");
        let poll_interval =
            std::time::Duration::from_secs(self.deps.config.pool.poll_interval_seconds.max(1));

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            if self.deps.budget.is_exhausted() {
                info!(worker_id = self.id, "invocation budget exhausted, stopping");
                break;
            }

            if let Err(e) = self
                .deps
                .store
                .heartbeat(self.id, WorkerStatus::Idle, None, Utc::now())
                .await
            {
                warn!(worker_id = self.id, error = %e, "heartbeat failed");
            }

            // An open system breaker stops claim issuance outright; a
            // claimed task could only be denied and released again.
            match self.deps.circuits.claims_allowed(Utc::now()).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(worker_id = self.id, "system breaker open, holding claims");
                    idle_wait(poll_interval, &mut shutdown_rx).await;
                    continue;
                }
                Err(e) => {
                    warn!(worker_id = self.id, error = %e, "system breaker check failed");
                    idle_wait(poll_interval, &mut shutdown_rx).await;
                    continue;
                }
            }

            let claimed = match self.deps.claims.claim_next(self.id, Utc::now()).await {
                Ok(task) => task,
                Err(e) if e.is_retryable() => {
                    debug!(worker_id = self.id, error = %e, "claim attempt lost, will re-poll");
                    None
                }
                Err(e) => {
                    error!(worker_id = self.id, error = %e, "claim failed");
                    None
                }
            };

            match claimed {
                Some(task) => {
                    let disposition = self.process_task(task).await;
                    // A released task means a breaker or the budget said
                    // no: back off before the next claim attempt.
                    if disposition == ReleaseDisposition::Released {
                        idle_wait(poll_interval, &mut shutdown_rx).await;
                    }
                }
                None => idle_wait(poll_interval, &mut shutdown_rx).await,
            }
        }

        info!(worker_id = self.id, "worker stopped");
    }

    /// Walk the pipeline for a claimed task and release the claim.
    /// Returns the disposition the pipeline decided on.
    async fn process_task(&self, task: TaskRow) -> ReleaseDisposition {
        info!(worker_id = self.id, task_key = %task.task_key, "processing task");
        if let Err(e) = self
            .deps
            .store
            .heartbeat(self.id, WorkerStatus::Active, Some(task.id), Utc::now())
            .await
        {
            warn!(worker_id = self.id, error = %e, "heartbeat failed");
        }

        let disposition = self.run_pipeline(&task).await;

        match self
            .deps
            .claims
            .release(task.id, task.version, disposition, Utc::now())
            .await
        {
            Ok(_) => {
                info!(
                    worker_id = self.id,
                    task_key = %task.task_key,
                    status = %disposition.target_status(),
                    "task released"
                );
            }
            // The lease may have expired under us and been reaped; the
            // task already belongs to someone else.
            Err(e) => {
                warn!(worker_id = self.id, task_key = %task.task_key, error = %e, "release failed");
            }
        }
        disposition
    }

    /// RED → RED_FIX? → GREEN → VERIFY → (FIX → RE_VERIFY)*.
    async fn run_pipeline(&self, task: &TaskRow) -> ReleaseDisposition {
        // RED, with one RED_FIX round when RED fails recoverably.
        match self.run_stage(task, Stage::Red).await {
            StageRun::Ok => {}
            StageRun::Denied(_) | StageRun::BudgetExhausted => {
                return ReleaseDisposition::Released;
            }
            StageRun::Failed(failure) if failure.class.is_retryable() => {
                match self.run_stage(task, Stage::RedFix).await {
                    StageRun::Ok => {}
                    StageRun::Denied(_) | StageRun::BudgetExhausted => {
                        return ReleaseDisposition::Released;
                    }
                    StageRun::Failed(f) => return self.dispose(&f),
                    StageRun::TestsFailed | StageRun::Review(_) => {
                        return ReleaseDisposition::Blocked;
                    }
                }
            }
            StageRun::Failed(failure) => return self.dispose(&failure),
            StageRun::TestsFailed | StageRun::Review(_) => return ReleaseDisposition::Blocked,
        }

        // GREEN.
        match self.run_stage(task, Stage::Green).await {
            StageRun::Ok => {}
            StageRun::Denied(_) | StageRun::BudgetExhausted => {
                return ReleaseDisposition::Released;
            }
            StageRun::Failed(failure) => return self.dispose(&failure),
            StageRun::TestsFailed | StageRun::Review(_) => return ReleaseDisposition::Blocked,
        }

        // VERIFY, then bounded FIX → RE_VERIFY rounds.
        let mut verdict = self.run_stage(task, Stage::Verify).await;
        let mut fix_rounds: u32 = 0;
        loop {
            match verdict {
                StageRun::Ok => return ReleaseDisposition::Passing,
                StageRun::Denied(_) | StageRun::BudgetExhausted => {
                    return ReleaseDisposition::Released;
                }
                StageRun::Review(messages) => {
                    warn!(task_key = %task.task_key, ?messages, "static review blocked task");
                    return ReleaseDisposition::BlockedStaticReview;
                }
                StageRun::Failed(failure) => return self.dispose(&failure),
                StageRun::TestsFailed => {
                    if fix_rounds >= self.deps.config.stages.max_fix_rounds {
                        info!(task_key = %task.task_key, "fix rounds exhausted");
                        return ReleaseDisposition::Blocked;
                    }
                    fix_rounds = fix_rounds.saturating_add(1);
                    match self.run_stage(task, Stage::Fix).await {
                        StageRun::Ok => {
                            verdict = self.run_stage(task, Stage::ReVerify).await;
                        }
                        StageRun::Denied(_) | StageRun::BudgetExhausted => {
                            return ReleaseDisposition::Released;
                        }
                        StageRun::Failed(f) => return self.dispose(&f),
                        StageRun::TestsFailed | StageRun::Review(_) => {
                            return ReleaseDisposition::Blocked;
                        }
                    }
                }
            }
        }
    }

    /// One stage with admission checks, budget accounting, bounded
    /// transient retries, and breaker reporting.
    async fn run_stage(&self, task: &TaskRow, stage: Stage) -> StageRun {
        let max_attempts = self.deps.config.stages.max_stage_attempts.max(1);
        let mut last_failure: Option<StageFailure> = None;

        for attempt in 1..=max_attempts {
            match self
                .deps
                .circuits
                .check_admission(self.id, &task.task_key, stage, Utc::now())
                .await
            {
                Ok(AdmissionDecision::Admitted) => {}
                Ok(AdmissionDecision::Denied(reason)) => return StageRun::Denied(reason),
                Err(e) => {
                    warn!(worker_id = self.id, error = %e, "admission check failed");
                    last_failure = Some(StageFailure::transient(e.to_string()));
                    continue;
                }
            }

            if stage.is_llm_stage() {
                match self.deps.budget.try_acquire() {
                    BudgetStatus::Admitted { used, warning } => {
                        if warning {
                            warn!(
                                used,
                                max = self.deps.budget.max(),
                                "invocation budget warning threshold crossed"
                            );
                        }
                    }
                    BudgetStatus::Exhausted => return StageRun::BudgetExhausted,
                }
            }

            let report = match self.deps.executor.execute(task, stage).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(worker_id = self.id, error = %e, "stage execution failed to persist");
                    last_failure = Some(StageFailure::transient(e.to_string()));
                    continue;
                }
            };

            if report.invoked_llm {
                if let Err(e) = self
                    .deps
                    .store
                    .record_invocation(
                        self.deps.run_id,
                        self.id,
                        Some(task.id),
                        Some(stage),
                        i64::try_from(report.tokens).unwrap_or(i64::MAX),
                        Some(report.duration_ms),
                        Utc::now(),
                    )
                    .await
                {
                    warn!(worker_id = self.id, error = %e, "failed to record invocation");
                }
            }

            let success = report.disposition.is_success();
            if let Err(e) = self
                .deps
                .circuits
                .record_outcome(self.id, &task.task_key, stage, success, Utc::now())
                .await
            {
                warn!(worker_id = self.id, error = %e, "failed to report outcome to breakers");
            }

            match report.disposition {
                StageDisposition::Success => return StageRun::Ok,
                StageDisposition::TestsFailed => return StageRun::TestsFailed,
                StageDisposition::ReviewViolations { messages } => {
                    return StageRun::Review(messages);
                }
                StageDisposition::Failure(failure) => {
                    if failure.class.is_retryable() && attempt < max_attempts {
                        debug!(
                            worker_id = self.id,
                            task_key = %task.task_key,
                            stage = %stage,
                            attempt,
                            "retryable stage failure, retrying"
                        );
                        last_failure = Some(failure);
                        continue;
                    }
                    return StageRun::Failed(failure);
                }
            }
        }

        StageRun::Failed(
            last_failure.unwrap_or_else(|| StageFailure::transient("stage retries exhausted")),
        )
    }

    /// Map a final stage failure onto the release disposition.
    ///
    /// An invariant violation additionally raises the pool abort signal:
    /// the failure is already recorded with full context on the attempt
    /// trail, and the run must not continue on a store the workers no
    /// longer agree with.
    fn dispose(&self, failure: &StageFailure) -> ReleaseDisposition {
        match failure.class {
            ErrorClass::FatalTask => ReleaseDisposition::Blocked,
            // The task is not at fault: give it back so another worker can
            // try; the worker breaker accumulates the failures.
            ErrorClass::FatalWorker | ErrorClass::FatalSystem => ReleaseDisposition::Released,
            ErrorClass::Transient | ErrorClass::Contention => ReleaseDisposition::Failed,
            ErrorClass::InvariantViolated => {
                error!(worker_id = self.id, error = %failure, "invariant violated, aborting run");
                let _ = self.deps.abort.send(true);
                ReleaseDisposition::Released
            }
        }
    }
}

/// Sleep one poll interval, waking immediately on shutdown.
async fn idle_wait(interval: std::time::Duration, shutdown_rx: &mut watch::Receiver<bool>) {
    tokio::select! {
        () = tokio::time::sleep(interval) => {}
        _ = shutdown_rx.changed() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::collaborators::{
        ExportChecker, NoopLlm, ProcessVerifier, TieredPromptBuilder,
    };
    use crate::store::test_support::open_store;
    use crate::types::{Complexity, TaskSpec};

    fn spec(key: &str) -> TaskSpec {
        TaskSpec {
            task_key: key.to_owned(),
            title: key.to_owned(),
            goal: String::new(),
            phase: 0,
            sequence: 0,
            complexity: Complexity::Low,
            depends_on: Vec::new(),
            acceptance_criteria: Vec::new(),
            test_file: None,
            impl_file: None,
            verify_command: Vec::new(),
            module_exports: Vec::new(),
            hints: None,
        }
    }

    async fn deps_for(store: &Store) -> (Arc<WorkerDeps>, watch::Receiver<bool>) {
        let config = Arc::new(Config::default());
        let executor = StageExecutor::new(
            store.clone(),
            Arc::new(TieredPromptBuilder),
            Arc::new(NoopLlm),
            Arc::new(ProcessVerifier::new(std::time::Duration::from_secs(5))),
            Arc::new(ExportChecker),
        );
        let run_id = store
            .create_run("run-test", 100, Utc::now())
            .await
            .expect("run");
        let (abort_tx, abort_rx) = watch::channel(false);
        let deps = Arc::new(WorkerDeps {
            store: store.clone(),
            claims: ClaimEngine::new(store.clone(), 300),
            circuits: CircuitManager::new(store.clone(), config.circuits.clone()),
            executor,
            budget: Arc::new(InvocationBudget::new(100, 80)),
            config,
            run_id,
            abort: abort_tx,
        });
        (deps, abort_rx)
    }

    #[tokio::test]
    async fn test_invariant_violation_raises_the_abort_signal() {
        let (store, _dir) = open_store().await;
        let now = Utc::now();
        store.insert_task(&spec("T1"), now).await.expect("insert");
        store.register_worker(1, None, now).await.expect("register");

        let task = store
            .claim_next(1, now, chrono::Duration::seconds(300))
            .await
            .expect("claim")
            .expect("some");
        // The claim vanishes behind the worker's back: the store and the
        // worker now disagree about who owns the task.
        store
            .release(task.id, task.version, ReleaseDisposition::Released, now)
            .await
            .expect("release");

        let (deps, abort_rx) = deps_for(&store).await;
        let worker = Worker::new(1, deps);
        let disposition = worker.run_pipeline(&task).await;

        assert_eq!(disposition, ReleaseDisposition::Released);
        assert!(
            *abort_rx.borrow(),
            "an invariant violation must raise the pool abort signal"
        );
    }

    #[tokio::test]
    async fn test_ordinary_failures_do_not_raise_abort() {
        let (store, _dir) = open_store().await;
        let (deps, abort_rx) = deps_for(&store).await;
        let worker = Worker::new(1, Arc::clone(&deps));

        assert_eq!(
            worker.dispose(&StageFailure::fatal_task("bad schema")),
            ReleaseDisposition::Blocked
        );
        assert_eq!(
            worker.dispose(&StageFailure::fatal_worker("no auth")),
            ReleaseDisposition::Released
        );
        assert_eq!(
            worker.dispose(&StageFailure::transient("blip")),
            ReleaseDisposition::Failed
        );
        assert!(!*abort_rx.borrow());

        assert_eq!(
            worker.dispose(&StageFailure::invariant_violated("claim vanished")),
            ReleaseDisposition::Released
        );
        assert!(*abort_rx.borrow());
    }
}
