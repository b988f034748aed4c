//! Operator surface: circuit resets, health, listings, and task recovery.
//!
//! Everything here is safe to call while a pool is running; mutations go
//! through the same CAS paths the workers use.

use chrono::{DateTime, Utc};

use crate::circuit::manager::CircuitManager;
use crate::config::CircuitsConfig;
use crate::store::{CircuitHealth, CircuitRow, Store, StoreResult, TaskRow, WorkerRow};
use crate::types::{CircuitLevel, CircuitState, TaskStatus};

/// Handle for operator commands.
#[derive(Debug, Clone)]
pub struct Admin {
    store: Store,
    circuits: CircuitManager,
}

impl Admin {
    /// Build an admin handle over the store.
    pub fn new(store: Store, circuits_config: CircuitsConfig) -> Self {
        let circuits = CircuitManager::new(store.clone(), circuits_config);
        Self { store, circuits }
    }

    /// Manually reset one breaker. Counters (extensions included) are
    /// zeroed and a `manual_reset` event is appended; returns the state
    /// after the reset.
    ///
    /// # Errors
    ///
    /// Propagates store failures; resetting a breaker that was never
    /// created simply creates it closed.
    pub async fn reset_circuit(
        &self,
        level: CircuitLevel,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<CircuitState> {
        self.circuits.reset(level, identifier, now).await
    }

    /// Per-level breaker state counts.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn health(&self) -> StoreResult<CircuitHealth> {
        self.store.circuit_health().await
    }

    /// Breakers filtered by level and/or state.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_circuits(
        &self,
        level: Option<CircuitLevel>,
        state: Option<CircuitState>,
    ) -> StoreResult<Vec<CircuitRow>> {
        self.store.list_circuits(level, state).await
    }

    /// All registered workers, dead rows included.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_workers(&self) -> StoreResult<Vec<WorkerRow>> {
        self.store.list_workers().await
    }

    /// Tasks, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> StoreResult<Vec<TaskRow>> {
        self.store.list_tasks(status).await
    }

    /// Operator recovery: blocked → pending with a new version.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` when the task is not blocked.
    pub async fn retry_task(&self, task_key: &str, now: DateTime<Utc>) -> StoreResult<i64> {
        self.store.retry_task(task_key, now).await
    }

    /// External verification hook: passing → complete.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` when the task is not passing.
    pub async fn mark_task_complete(
        &self,
        task_key: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<i64> {
        self.store.mark_task_complete(task_key, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::open_store;
    use crate::types::Stage;

    fn t0() -> DateTime<Utc> {
        crate::types::parse_ts("2026-01-01T00:00:00Z").expect("ts")
    }

    #[tokio::test]
    async fn test_reset_circuit_closes_open_breaker() {
        let (store, _dir) = open_store().await;
        let admin = Admin::new(store.clone(), CircuitsConfig::default());
        let now = t0();

        // Trip a stage breaker through the manager the workers use.
        for worker_id in 11..16 {
            admin
                .circuits
                .record_outcome(worker_id, "T1", Stage::Green, false, now)
                .await
                .expect("record");
        }
        let health = admin.health().await.expect("health");
        assert_eq!(health.stage.open_count, 1);

        let identifier = Stage::Green.breaker_identifier("T1");
        let state = admin
            .reset_circuit(CircuitLevel::Stage, &identifier, now)
            .await
            .expect("reset");
        assert_eq!(state, CircuitState::Closed);

        let health = admin.health().await.expect("health");
        assert_eq!(health.stage.open_count, 0);
    }

    #[tokio::test]
    async fn test_list_circuits_filters() {
        let (store, _dir) = open_store().await;
        let admin = Admin::new(store.clone(), CircuitsConfig::default());
        let now = t0();

        admin
            .circuits
            .record_outcome(1, "T1", Stage::Green, true, now)
            .await
            .expect("record");

        let all = admin.list_circuits(None, None).await.expect("list");
        // stage + worker + system breakers were created lazily.
        assert_eq!(all.len(), 3);

        let stages = admin
            .list_circuits(Some(CircuitLevel::Stage), None)
            .await
            .expect("list");
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].identifier, "T1:green");

        let open = admin
            .list_circuits(None, Some(CircuitState::Open))
            .await
            .expect("list");
        assert!(open.is_empty());
    }
}
