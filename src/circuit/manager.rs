//! Persistence-coupled circuit breaker manager.
//!
//! Wraps the pure transitions in `circuit` with load → mutate → CAS
//! write-back, bounded retries on contention, event appends, and the
//! flapping scan. The hierarchy is a veto: system, then worker, then
//! stage must all admit before a stage may execute.

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, warn};

use super::{
    manual_reset, on_failure, on_success, try_admit, AdmitDecision, CircuitConfig, DenyReason,
    PendingEvent,
};
use crate::config::CircuitsConfig;
use crate::store::{CircuitRow, NewCircuitEvent, Store, StoreError, StoreResult};
use crate::types::{CircuitEventType, CircuitLevel, CircuitState, Stage};

/// Bounded local retries when a breaker CAS loses.
const CAS_ATTEMPTS: u32 = 3;

/// Identifier of the single system-level breaker.
pub const SYSTEM_IDENTIFIER: &str = "system";

/// Result of the hierarchical admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// All three breakers admit; the stage may run.
    Admitted,
    /// At least one breaker denies.
    Denied(DenyReason),
}

/// Coordinates the three-level breaker hierarchy against the store.
#[derive(Debug, Clone)]
pub struct CircuitManager {
    store: Store,
    config: CircuitsConfig,
}

impl CircuitManager {
    /// Build a manager over the given store with the configured thresholds.
    pub fn new(store: Store, config: CircuitsConfig) -> Self {
        Self { store, config }
    }

    /// Breaker identifier for a worker.
    pub fn worker_identifier(worker_id: i64) -> String {
        format!("worker-{worker_id}")
    }

    /// Ask all three breakers for permission to run `stage` of `task_key`.
    ///
    /// Order: system → worker → stage; the first denial wins. Probe slots
    /// taken from half-open breakers earlier in the chain are handed back
    /// when a later breaker denies.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Contention`] when CAS retries are exhausted,
    /// which the caller should treat as transient.
    pub async fn check_admission(
        &self,
        worker_id: i64,
        task_key: &str,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> StoreResult<AdmissionDecision> {
        let checks = [
            (CircuitLevel::System, SYSTEM_IDENTIFIER.to_owned()),
            (CircuitLevel::Worker, Self::worker_identifier(worker_id)),
            (CircuitLevel::Stage, stage.breaker_identifier(task_key)),
        ];

        let mut probes_taken: Vec<(CircuitLevel, String)> = Vec::new();
        for (level, identifier) in checks {
            let decision = self
                .with_breaker(level, &identifier, now, |row, config| {
                    try_admit(row, config, level, now)
                })
                .await?;
            match decision {
                AdmitDecision::Admit => {}
                AdmitDecision::AdmitProbe => probes_taken.push((level, identifier)),
                AdmitDecision::Deny(reason) => {
                    for (probe_level, probe_identifier) in probes_taken {
                        self.release_probe(probe_level, &probe_identifier, now).await?;
                    }
                    debug!(
                        worker_id,
                        task_key,
                        stage = %stage,
                        reason = reason.as_str(),
                        "admission denied"
                    );
                    return Ok(AdmissionDecision::Denied(reason));
                }
            }
        }
        Ok(AdmissionDecision::Admitted)
    }

    /// Report a stage outcome to all three breakers, in order
    /// stage → worker → system.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Contention`] when CAS retries are exhausted.
    pub async fn record_outcome(
        &self,
        worker_id: i64,
        task_key: &str,
        stage: Stage,
        success: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let reports = [
            (CircuitLevel::Stage, stage.breaker_identifier(task_key)),
            (CircuitLevel::Worker, Self::worker_identifier(worker_id)),
            (CircuitLevel::System, SYSTEM_IDENTIFIER.to_owned()),
        ];
        for (level, identifier) in reports {
            self.with_breaker(level, &identifier, now, |row, config| {
                let events = if success {
                    on_success(row, config, now)
                } else {
                    on_failure(row, config, now)
                };
                ((), events, true)
            })
            .await?;
        }
        Ok(())
    }

    /// Whether the system breaker currently permits issuing new claims.
    ///
    /// Workers consult this before calling `claim_next` so an open system
    /// breaker stops claim issuance instead of producing claim/release
    /// churn on tasks no stage is allowed to run. Read-only: a breaker
    /// whose cooldown has elapsed reports `true` and the subsequent
    /// admission check takes the probe slot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn claims_allowed(&self, now: DateTime<Utc>) -> StoreResult<bool> {
        let Some(row) = self
            .store
            .get_circuit(CircuitLevel::System, SYSTEM_IDENTIFIER)
            .await?
        else {
            return Ok(true);
        };
        let config = CircuitConfig::for_level(CircuitLevel::System, &self.config);
        Ok(!super::still_open(&row, &config, now))
    }

    /// Operator reset of one breaker. Returns the state after the reset.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Contention`] when CAS retries are exhausted.
    pub async fn reset(
        &self,
        level: CircuitLevel,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<CircuitState> {
        self.with_breaker(level, identifier, now, |row, _config| {
            let events = manual_reset(row, now);
            (row.state, events, true)
        })
        .await
    }

    /// Hand back a half-open probe slot taken during a partial admission.
    async fn release_probe(
        &self,
        level: CircuitLevel,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.with_breaker(level, identifier, now, |row, _config| {
            if row.state == CircuitState::HalfOpen && row.half_open_requests > 0 {
                row.half_open_requests = 0;
                ((), Vec::new(), true)
            } else {
                ((), Vec::new(), false)
            }
        })
        .await
    }

    /// Load → mutate → CAS loop shared by every breaker operation.
    ///
    /// The mutator returns its result, the events to append, and whether
    /// the row changed. Events are appended only after a successful
    /// write-back; a committed state change triggers the flap scan.
    async fn with_breaker<R>(
        &self,
        level: CircuitLevel,
        identifier: &str,
        now: DateTime<Utc>,
        mut mutate: impl FnMut(&mut CircuitRow, &CircuitConfig) -> (R, Vec<PendingEvent>, bool),
    ) -> StoreResult<R> {
        let config = CircuitConfig::for_level(level, &self.config);
        let snapshot = config.snapshot();

        let mut attempt: u32 = 0;
        loop {
            let mut row = self
                .store
                .get_or_create_circuit(level, identifier, &snapshot, now)
                .await?;
            let (result, events, mutated) = mutate(&mut row, &config);

            if mutated {
                match self.store.cas_circuit(&row).await {
                    Ok(_) => {}
                    Err(StoreError::Contention { .. })
                        if attempt.saturating_add(1) < CAS_ATTEMPTS =>
                    {
                        attempt = attempt.saturating_add(1);
                        let jitter_ms = rand::thread_rng().gen_range(10..=50);
                        tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let mut state_changed = false;
            for event in &events {
                if event.event_type == CircuitEventType::StateChange {
                    state_changed = true;
                }
                self.store
                    .record_circuit_event(&NewCircuitEvent {
                        circuit_id: row.id,
                        event_type: event.event_type,
                        from_state: event.from_state,
                        to_state: event.to_state,
                        context: event.context.clone(),
                        at: now,
                    })
                    .await?;
            }

            if state_changed {
                self.flap_scan(&row, &config, now).await?;
            }

            return Ok(result);
        }
    }

    /// After a committed state change, look for rapid oscillation and
    /// append a `flapping_detected` event. Observability only; the state
    /// machine is untouched.
    async fn flap_scan(
        &self,
        row: &CircuitRow,
        config: &CircuitConfig,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let since = now.checked_sub_signed(config.flap_window).unwrap_or(now);
        let changes = self.store.count_state_changes_since(row.id, since).await?;
        if changes >= i64::from(config.flap_threshold) {
            warn!(
                identifier = %row.identifier,
                changes,
                window_seconds = config.flap_window.num_seconds(),
                "circuit is flapping"
            );
            self.store
                .record_circuit_event(&NewCircuitEvent {
                    circuit_id: row.id,
                    event_type: CircuitEventType::FlappingDetected,
                    from_state: None,
                    to_state: None,
                    context: Some(serde_json::json!({
                        "state_changes": changes,
                        "window_seconds": config.flap_window.num_seconds(),
                    })),
                    at: now,
                })
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::open_store;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        crate::types::parse_ts("2026-01-01T00:00:00Z").expect("ts")
    }

    async fn manager() -> (CircuitManager, tempfile::TempDir) {
        let (store, dir) = open_store().await;
        (CircuitManager::new(store, CircuitsConfig::default()), dir)
    }

    #[tokio::test]
    async fn test_admission_granted_on_fresh_breakers() {
        let (manager, _dir) = manager().await;
        let decision = manager
            .check_admission(1, "T1", Stage::Red, t0())
            .await
            .expect("check");
        assert_eq!(decision, AdmissionDecision::Admitted);
    }

    #[tokio::test]
    async fn test_stage_breaker_trips_after_five_failures_and_denies() {
        let (manager, _dir) = manager().await;
        let now = t0();

        // Distinct workers, so only the stage breaker accumulates.
        for worker_id in 11..15 {
            manager
                .record_outcome(worker_id, "T1", Stage::Green, false, now)
                .await
                .expect("record");
        }
        let decision = manager
            .check_admission(20, "T1", Stage::Green, now)
            .await
            .expect("check");
        assert_eq!(decision, AdmissionDecision::Admitted, "4 failures must not trip");

        manager
            .record_outcome(15, "T1", Stage::Green, false, now)
            .await
            .expect("record");

        let decision = manager
            .check_admission(20, "T1", Stage::Green, now)
            .await
            .expect("check");
        assert_eq!(decision, AdmissionDecision::Denied(DenyReason::StageOpen));

        // Other stages of the same task keep their own breakers.
        let decision = manager
            .check_admission(20, "T1", Stage::Verify, now)
            .await
            .expect("check");
        assert_eq!(decision, AdmissionDecision::Admitted);
    }

    #[tokio::test]
    async fn test_cooldown_then_probe_then_close() {
        let (manager, _dir) = manager().await;
        let now = t0();
        for worker_id in 11..16 {
            manager
                .record_outcome(worker_id, "T1", Stage::Green, false, now)
                .await
                .expect("record");
        }

        // After the stage cooldown (60 s), one probe is admitted.
        let later = now.checked_add_signed(Duration::seconds(61)).expect("ts");
        let decision = manager
            .check_admission(21, "T1", Stage::Green, later)
            .await
            .expect("check");
        assert_eq!(decision, AdmissionDecision::Admitted);

        // A concurrent second caller is told to wait for the probe.
        let decision = manager
            .check_admission(22, "T1", Stage::Green, later)
            .await
            .expect("check");
        assert_eq!(decision, AdmissionDecision::Denied(DenyReason::Probing));

        // Probe success closes the breaker (stage recovery_successes = 1).
        manager
            .record_outcome(21, "T1", Stage::Green, true, later)
            .await
            .expect("record");
        let decision = manager
            .check_admission(22, "T1", Stage::Green, later)
            .await
            .expect("check");
        assert_eq!(decision, AdmissionDecision::Admitted);
    }

    #[tokio::test]
    async fn test_worker_breaker_denies_only_that_worker() {
        let (manager, _dir) = manager().await;
        let now = t0();
        // Worker 1 fails five different stages: its own breaker trips while
        // each stage breaker has only one failure.
        for key in ["T1", "T2", "T3", "T4", "T5"] {
            manager
                .record_outcome(1, key, Stage::Green, false, now)
                .await
                .expect("record");
        }

        let decision = manager
            .check_admission(1, "T6", Stage::Green, now)
            .await
            .expect("check");
        assert_eq!(decision, AdmissionDecision::Denied(DenyReason::WorkerOpen));

        let decision = manager
            .check_admission(2, "T6", Stage::Green, now)
            .await
            .expect("check");
        assert_eq!(decision, AdmissionDecision::Admitted);
    }

    #[tokio::test]
    async fn test_system_open_denies_everyone() {
        let (manager, _dir) = manager().await;
        let now = t0();
        // Spread failures across workers and tasks so only the system
        // window accumulates: 10 failures ≥ min_samples at 100% rate.
        for (i, key) in ["A", "B", "C", "D", "E", "F", "G", "H", "I", "J"]
            .iter()
            .enumerate()
        {
            let worker_id = i64::try_from(i).expect("small");
            manager
                .record_outcome(worker_id, key, Stage::Green, false, now)
                .await
                .expect("record");
        }

        let decision = manager
            .check_admission(99, "Z", Stage::Red, now)
            .await
            .expect("check");
        assert_eq!(decision, AdmissionDecision::Denied(DenyReason::SystemOpen));
    }

    #[tokio::test]
    async fn test_claims_allowed_tracks_system_breaker() {
        let (manager, _dir) = manager().await;
        let now = t0();
        assert!(manager.claims_allowed(now).await.expect("check"));

        // Trip the system breaker: ten failures spread across workers and
        // tasks so nothing else accumulates.
        for i in 0..10_i64 {
            manager
                .record_outcome(i, &format!("T{i}"), Stage::Green, false, now)
                .await
                .expect("record");
        }
        assert!(!manager.claims_allowed(now).await.expect("check"));

        // Once the cooldown (300 s) has elapsed the gate reopens so an
        // admission check can take the probe.
        let later = now.checked_add_signed(Duration::seconds(301)).expect("ts");
        assert!(manager.claims_allowed(later).await.expect("check"));
    }

    #[tokio::test]
    async fn test_manual_reset_closes_and_is_idempotent() {
        let (manager, _dir) = manager().await;
        let now = t0();
        for _ in 0..5 {
            manager
                .record_outcome(1, "T1", Stage::Green, false, now)
                .await
                .expect("record");
        }
        let identifier = Stage::Green.breaker_identifier("T1");

        let state = manager
            .reset(CircuitLevel::Stage, &identifier, now)
            .await
            .expect("reset");
        assert_eq!(state, CircuitState::Closed);

        // Second reset: state unchanged, another audit event written.
        let state = manager
            .reset(CircuitLevel::Stage, &identifier, now)
            .await
            .expect("reset");
        assert_eq!(state, CircuitState::Closed);

        let row = manager
            .store
            .get_circuit(CircuitLevel::Stage, &identifier)
            .await
            .expect("get")
            .expect("exists");
        let events = manager
            .store
            .list_circuit_events(row.id)
            .await
            .expect("events");
        let resets = events
            .iter()
            .filter(|e| e.event_type == CircuitEventType::ManualReset)
            .count();
        assert_eq!(resets, 2);
        assert_eq!(super::super::replay(&events), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_flapping_detected_after_rapid_oscillation() {
        let (manager, _dir) = manager().await;
        let mut now = t0();
        let identifier = Stage::Green.breaker_identifier("T1");

        // Trip → probe-fail → trip ... the trip is one state change, each
        // failed probe adds two (open→half-open, half-open→open). Distinct
        // workers keep the worker breakers out of the way.
        for worker_id in 11..16 {
            manager
                .record_outcome(worker_id, "T1", Stage::Green, false, now)
                .await
                .expect("record");
        }
        for worker_id in [21, 22] {
            now = now.checked_add_signed(Duration::seconds(61)).expect("ts");
            let decision = manager
                .check_admission(worker_id, "T1", Stage::Green, now)
                .await
                .expect("check");
            assert_eq!(decision, AdmissionDecision::Admitted);
            manager
                .record_outcome(worker_id, "T1", Stage::Green, false, now)
                .await
                .expect("record");
        }

        let row = manager
            .store
            .get_circuit(CircuitLevel::Stage, &identifier)
            .await
            .expect("get")
            .expect("exists");
        let events = manager
            .store
            .list_circuit_events(row.id)
            .await
            .expect("events");
        assert!(
            events
                .iter()
                .any(|e| e.event_type == CircuitEventType::FlappingDetected),
            "5 state changes within the flap window must be flagged"
        );
    }
}
