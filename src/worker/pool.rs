//! Worker pool: spawns N workers, owns the invocation budget, scans for
//! stale workers, reaps expired claims, and orchestrates graceful
//! shutdown.
//!
//! The pool is the supervisor: it owns the worker lifetimes through a
//! `JoinSet`, propagates cancellation over a watch channel, and stops on
//! its own when no runnable work remains.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{Worker, WorkerDeps};
use crate::circuit::manager::CircuitManager;
use crate::claim::ClaimEngine;
use crate::config::Config;
use crate::stage::StageExecutor;
use crate::store::Store;
use crate::types::TaskStatus;

/// Outcome of one budget acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    /// The invocation was admitted.
    Admitted {
        /// Counter value after this acquisition.
        used: u32,
        /// True exactly once, when the warning threshold is crossed.
        warning: bool,
    },
    /// The budget is spent; no further invocations this run.
    Exhausted,
}

/// Run-scoped invocation counter with a one-shot warning threshold.
///
/// Lock-free: acquisition is a compare-exchange loop, so two workers
/// racing for the last slot cannot both win it.
#[derive(Debug)]
pub struct InvocationBudget {
    used: AtomicU32,
    max: u32,
    warn_at: u32,
    warned: AtomicBool,
}

impl InvocationBudget {
    /// Create a budget of `max` invocations warning at `warn_pct` percent.
    pub fn new(max: u32, warn_pct: u8) -> Self {
        let warn_at = u32::try_from(
            u64::from(max)
                .saturating_mul(u64::from(warn_pct))
                .checked_div(100)
                .unwrap_or(u64::from(max)),
        )
        .unwrap_or(max);
        Self {
            used: AtomicU32::new(0),
            max,
            warn_at,
            warned: AtomicBool::new(false),
        }
    }

    /// Atomically take one invocation slot.
    pub fn try_acquire(&self) -> BudgetStatus {
        loop {
            let used = self.used.load(Ordering::Acquire);
            if used >= self.max {
                return BudgetStatus::Exhausted;
            }
            let next = used.saturating_add(1);
            if self
                .used
                .compare_exchange(used, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let warning = next >= self.warn_at && !self.warned.swap(true, Ordering::AcqRel);
                return BudgetStatus::Admitted { used: next, warning };
            }
        }
    }

    /// Invocations consumed so far.
    pub fn used(&self) -> u32 {
        self.used.load(Ordering::Acquire)
    }

    /// Configured cap.
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Whether the cap has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.used() >= self.max
    }
}

/// What resume mode did before the workers started.
#[derive(Debug, Clone, Default)]
pub struct ResumeReport {
    /// Tasks reverted from in-progress back to pending.
    pub reverted: Vec<i64>,
}

impl ResumeReport {
    /// Human-readable one-liner for the operator.
    pub fn format_message(&self) -> String {
        if self.reverted.is_empty() {
            return "Resume: no orphaned tasks found.".to_owned();
        }
        format!(
            "Resume: {} orphaned task(s) reverted to pending.",
            self.reverted.len()
        )
    }
}

/// Terminal summary of one run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Opaque run identity.
    pub run_uuid: String,
    /// Invocations consumed.
    pub invocations_used: i64,
    /// Budget cap.
    pub max_invocations: i64,
    /// Task counts by status at the end of the run.
    pub status_counts: Vec<(TaskStatus, i64)>,
    /// Whether the run was aborted by an invariant violation.
    pub aborted: bool,
}

impl RunSummary {
    /// Human-readable multi-line report for the operator.
    pub fn format_message(&self) -> String {
        let headline = if self.aborted {
            format!(
                "Run {} ABORTED on an invariant violation. invocations_used={} of {}.",
                self.run_uuid, self.invocations_used, self.max_invocations
            )
        } else {
            format!(
                "Run {} finished. invocations_used={} of {}.",
                self.run_uuid, self.invocations_used, self.max_invocations
            )
        };
        let mut parts = vec![headline];
        for (status, count) in &self.status_counts {
            parts.push(format!("- {status}: {count}"));
        }
        parts.join("\n")
    }
}

/// Options for one pool run.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Number of workers to spawn.
    pub workers: u32,
    /// Revert orphaned in-progress tasks before starting.
    pub resume: bool,
}

/// Supervisor for a fleet of workers.
pub struct WorkerPool {
    store: Store,
    config: Arc<Config>,
    executor: StageExecutor,
}

impl WorkerPool {
    /// Build a pool over the store and a wired stage executor.
    pub fn new(store: Store, config: Arc<Config>, executor: StageExecutor) -> Self {
        Self {
            store,
            config,
            executor,
        }
    }

    /// Run a full orchestration session.
    ///
    /// Returns when no runnable work remains, every worker stopped (budget
    /// exhaustion), or the external shutdown signal fires.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unusable; worker-level failures
    /// are absorbed into the audit trail instead.
    pub async fn run(
        &self,
        options: PoolOptions,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<RunSummary> {
        let now = Utc::now();
        let stale_threshold = ChronoDuration::minutes(
            i64::try_from(self.config.pool.stale_worker_threshold_minutes).unwrap_or(i64::MAX),
        );

        if options.resume {
            let cutoff = now.checked_sub_signed(stale_threshold).unwrap_or(now);
            let reverted = self.store.reset_orphaned_tasks(cutoff, now).await?;
            let report = ResumeReport { reverted };
            info!("{}", report.format_message());
        }

        let run_uuid = Uuid::new_v4().to_string();
        let max_invocations = i64::from(self.config.pool.max_invocations_per_session);
        let run_id = self.store.create_run(&run_uuid, max_invocations, now).await?;
        let budget = Arc::new(InvocationBudget::new(
            self.config.pool.max_invocations_per_session,
            self.config.pool.budget_warning_threshold_pct,
        ));

        let claims = ClaimEngine::new(self.store.clone(), self.config.claims.claim_timeout_seconds);
        let circuits = CircuitManager::new(self.store.clone(), self.config.circuits.clone());
        // Workers raise this when they hit a broken invariant; the pool
        // stops the whole run.
        let (abort_tx, mut abort_rx) = watch::channel(false);
        let deps = Arc::new(WorkerDeps {
            store: self.store.clone(),
            claims: claims.clone(),
            circuits,
            executor: self.executor.clone(),
            budget: Arc::clone(&budget),
            config: Arc::clone(&self.config),
            run_id,
            abort: abort_tx,
        });

        // Pool-internal shutdown so completion can stop workers too.
        let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
        let mut join_set = JoinSet::new();
        let worker_count = options.workers.max(1);
        for id in 1..=i64::from(worker_count) {
            self.store.register_worker(id, None, Utc::now()).await?;
            let worker = Worker::new(id, Arc::clone(&deps));
            join_set.spawn(worker.run(worker_shutdown_rx.clone()));
        }
        info!(workers = worker_count, run_uuid = %run_uuid, "pool started");

        let scan_secs = self.config.pool.poll_interval_seconds.max(1);
        let mut scan_interval =
            tokio::time::interval(std::time::Duration::from_secs(scan_secs));
        let mut aborted = false;

        loop {
            tokio::select! {
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("shutdown signal received");
                        break;
                    }
                }
                result = abort_rx.changed() => {
                    if result.is_ok() && *abort_rx.borrow() {
                        error!("invariant violation reported, aborting run");
                        aborted = true;
                        break;
                    }
                }
                _ = scan_interval.tick() => {
                    let now = Utc::now();

                    if let Err(e) = claims.reap_expired(now).await {
                        error!(error = %e, "claim reap failed");
                    }

                    match self.store.stale_workers(now, stale_threshold).await {
                        Ok(stale) => {
                            for worker in stale {
                                warn!(worker_id = worker.id, "worker is stale, marking dead");
                                if let Err(e) =
                                    self.store.mark_worker_dead(worker.id, now).await
                                {
                                    error!(error = %e, "failed to mark worker dead");
                                }
                            }
                        }
                        Err(e) => error!(error = %e, "stale worker scan failed"),
                    }

                    match self.store.task_status_counts().await {
                        Ok(counts) => {
                            let active: i64 = counts
                                .iter()
                                .filter(|(status, _)| {
                                    matches!(
                                        status,
                                        TaskStatus::Pending | TaskStatus::InProgress
                                    )
                                })
                                .map(|(_, n)| *n)
                                .sum();
                            if active == 0 {
                                info!("no runnable work remains");
                                break;
                            }
                        }
                        Err(e) => error!(error = %e, "status scan failed"),
                    }
                }
                joined = join_set.join_next(), if !join_set.is_empty() => {
                    if let Some(Err(e)) = joined {
                        error!(error = %e, "worker task panicked");
                    }
                    if join_set.is_empty() {
                        info!("all workers stopped");
                        break;
                    }
                }
            }
        }

        // Graceful drain: stop claims, give in-flight stages the grace
        // period, then abandon them (their claims expire naturally).
        let _ = worker_shutdown_tx.send(true);
        let grace =
            std::time::Duration::from_secs(self.config.pool.shutdown_grace_seconds.max(1));
        let drained = tokio::time::timeout(grace, async {
            while join_set.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("shutdown grace expired, abandoning in-flight stages");
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
        }

        let now = Utc::now();
        for id in 1..=i64::from(worker_count) {
            if let Err(e) = self.store.mark_worker_dead(id, now).await {
                error!(error = %e, "failed to mark worker dead at shutdown");
            }
        }
        self.store.finish_run(run_id, now).await?;

        let run = self.store.get_run(run_id).await?;
        let summary = RunSummary {
            run_uuid,
            invocations_used: run.invocations_used,
            max_invocations,
            status_counts: self.store.task_status_counts().await?,
            aborted,
        };
        info!("{}", summary.format_message());
        Ok(summary)
    }
}
