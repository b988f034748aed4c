//! Circuit breaker rows and their append-only event streams.
//!
//! Breaker *state* lives in a mutable row guarded by a version CAS;
//! *history* lives in `circuit_events`. Views over the history (health,
//! flap counts, replay) are plain queries.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{Store, StoreError, StoreResult};
use crate::types::{fmt_ts, parse_ts, CircuitEventType, CircuitLevel, CircuitState};

/// A circuit breaker row as stored.
#[derive(Debug, Clone)]
pub struct CircuitRow {
    /// Row id.
    pub id: i64,
    /// Hierarchy level.
    pub level: CircuitLevel,
    /// Scope identifier, e.g. `"TDD-17:green"`, `"worker-3"`, `"system"`.
    pub identifier: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures (stage/worker levels).
    pub failure_count: i64,
    /// Successes accumulated in half-open probing.
    pub success_count: i64,
    /// In-flight half-open probes (capped at 1).
    pub half_open_requests: i64,
    /// Half-open → open cycles consumed.
    pub extensions: i64,
    /// Most recent attempt outcomes, oldest first (system level window).
    pub window: Vec<bool>,
    /// When the breaker last opened.
    pub opened_at: Option<DateTime<Utc>>,
    /// When a failure was last recorded.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// When a success was last recorded.
    pub last_success_at: Option<DateTime<Utc>>,
    /// When the state last changed.
    pub last_state_change_at: Option<DateTime<Utc>>,
    /// Config snapshot captured at creation.
    pub config: serde_json::Value,
    /// Optimistic-lock token.
    pub version: i64,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

impl CircuitRow {
    fn from_row(row: &SqliteRow) -> StoreResult<Self> {
        let level_raw: String = row.try_get("level")?;
        let state_raw: String = row.try_get("state")?;
        let window_raw: String = row.try_get("failure_counts")?;
        let config_raw: String = row.try_get("config")?;
        let opened_at: Option<String> = row.try_get("opened_at")?;
        let last_failure_at: Option<String> = row.try_get("last_failure_at")?;
        let last_success_at: Option<String> = row.try_get("last_success_at")?;
        let last_state_change_at: Option<String> = row.try_get("last_state_change_at")?;
        let created_at: String = row.try_get("created_at")?;

        let parse_opt = |s: Option<String>| -> StoreResult<Option<DateTime<Utc>>> {
            s.map(|v| parse_ts(&v)).transpose().map_err(StoreError::corrupt)
        };

        Ok(Self {
            id: row.try_get("id")?,
            level: level_raw.parse().map_err(StoreError::corrupt)?,
            identifier: row.try_get("identifier")?,
            state: state_raw.parse().map_err(StoreError::corrupt)?,
            failure_count: row.try_get("failure_count")?,
            success_count: row.try_get("success_count")?,
            half_open_requests: row.try_get("half_open_requests")?,
            extensions: row.try_get("extensions")?,
            window: serde_json::from_str(&window_raw).map_err(StoreError::corrupt)?,
            opened_at: parse_opt(opened_at)?,
            last_failure_at: parse_opt(last_failure_at)?,
            last_success_at: parse_opt(last_success_at)?,
            last_state_change_at: parse_opt(last_state_change_at)?,
            config: serde_json::from_str(&config_raw).map_err(StoreError::corrupt)?,
            version: row.try_get("version")?,
            created_at: parse_ts(&created_at).map_err(StoreError::corrupt)?,
        })
    }
}

/// Input for one audit event.
#[derive(Debug, Clone)]
pub struct NewCircuitEvent {
    /// Breaker the event belongs to.
    pub circuit_id: i64,
    /// What happened.
    pub event_type: CircuitEventType,
    /// State before, for state-change events.
    pub from_state: Option<CircuitState>,
    /// State after, for state-change events.
    pub to_state: Option<CircuitState>,
    /// Structured context (reason, counters, flags).
    pub context: Option<serde_json::Value>,
    /// Event time.
    pub at: DateTime<Utc>,
}

/// A stored audit event.
#[derive(Debug, Clone)]
pub struct CircuitEventRow {
    /// Row id.
    pub id: i64,
    /// Breaker the event belongs to.
    pub circuit_id: i64,
    /// What happened.
    pub event_type: CircuitEventType,
    /// State before, for state-change events.
    pub from_state: Option<CircuitState>,
    /// State after, for state-change events.
    pub to_state: Option<CircuitState>,
    /// Structured context.
    pub context: Option<serde_json::Value>,
    /// Event time.
    pub created_at: DateTime<Utc>,
}

impl CircuitEventRow {
    fn from_row(row: &SqliteRow) -> StoreResult<Self> {
        let event_raw: String = row.try_get("event_type")?;
        let from_raw: Option<String> = row.try_get("from_state")?;
        let to_raw: Option<String> = row.try_get("to_state")?;
        let context_raw: Option<String> = row.try_get("context")?;
        let created_at: String = row.try_get("created_at")?;

        let event_type = match event_raw.as_str() {
            "state_change" => CircuitEventType::StateChange,
            "failure_recorded" => CircuitEventType::FailureRecorded,
            "success_recorded" => CircuitEventType::SuccessRecorded,
            "threshold_reached" => CircuitEventType::ThresholdReached,
            "recovery_started" => CircuitEventType::RecoveryStarted,
            "recovery_succeeded" => CircuitEventType::RecoverySucceeded,
            "recovery_failed" => CircuitEventType::RecoveryFailed,
            "manual_reset" => CircuitEventType::ManualReset,
            "flapping_detected" => CircuitEventType::FlappingDetected,
            "extension_applied" => CircuitEventType::ExtensionApplied,
            other => return Err(StoreError::Corrupt(format!("unknown event type: {other}"))),
        };

        Ok(Self {
            id: row.try_get("id")?,
            circuit_id: row.try_get("circuit_id")?,
            event_type,
            from_state: from_raw
                .map(|s| s.parse())
                .transpose()
                .map_err(StoreError::corrupt)?,
            to_state: to_raw
                .map(|s| s.parse())
                .transpose()
                .map_err(StoreError::corrupt)?,
            context: context_raw
                .map(|s| serde_json::from_str(&s))
                .transpose()
                .map_err(StoreError::corrupt)?,
            created_at: parse_ts(&created_at).map_err(StoreError::corrupt)?,
        })
    }
}

/// Per-level health counts for the admin surface.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct LevelHealth {
    /// Breakers in `closed`.
    pub closed_count: i64,
    /// Breakers in `open`.
    pub open_count: i64,
    /// Breakers in `half_open`.
    pub half_open_count: i64,
    /// All breakers at this level.
    pub total: i64,
}

/// Health counts across all three levels.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CircuitHealth {
    /// Stage-level counts.
    pub stage: LevelHealth,
    /// Worker-level counts.
    pub worker: LevelHealth,
    /// System-level counts.
    pub system: LevelHealth,
}

impl Store {
    /// Fetch a breaker row if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn get_circuit(
        &self,
        level: CircuitLevel,
        identifier: &str,
    ) -> StoreResult<Option<CircuitRow>> {
        let row = sqlx::query("SELECT * FROM circuit_breakers WHERE level = ?1 AND identifier = ?2")
            .bind(level.as_str())
            .bind(identifier)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(CircuitRow::from_row).transpose()
    }

    /// Fetch a breaker row, creating it closed with the given config
    /// snapshot when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn get_or_create_circuit(
        &self,
        level: CircuitLevel,
        identifier: &str,
        config: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> StoreResult<CircuitRow> {
        sqlx::query(
            r"INSERT INTO circuit_breakers (level, identifier, config, created_at)
              VALUES (?1, ?2, ?3, ?4)
              ON CONFLICT (level, identifier) DO NOTHING",
        )
        .bind(level.as_str())
        .bind(identifier)
        .bind(config.to_string())
        .bind(fmt_ts(now))
        .execute(self.pool())
        .await?;

        self.get_circuit(level, identifier)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "circuit",
                id: identifier.to_owned(),
            })
    }

    /// Write back a mutated breaker row, guarded by its loaded version.
    ///
    /// The row's `version` field is the *expected* version; on success the
    /// stored version becomes `version + 1` and is returned.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Contention`] when another writer got there
    /// first; the caller should reload and retry.
    pub async fn cas_circuit(&self, row: &CircuitRow) -> StoreResult<i64> {
        let window = serde_json::to_string(&row.window).map_err(StoreError::corrupt)?;
        let updated = sqlx::query(
            r"UPDATE circuit_breakers
              SET state = ?1, failure_count = ?2, success_count = ?3,
                  half_open_requests = ?4, extensions = ?5, failure_counts = ?6,
                  opened_at = ?7, last_failure_at = ?8, last_success_at = ?9,
                  last_state_change_at = ?10, version = version + 1
              WHERE id = ?11 AND version = ?12",
        )
        .bind(row.state.as_str())
        .bind(row.failure_count)
        .bind(row.success_count)
        .bind(row.half_open_requests)
        .bind(row.extensions)
        .bind(&window)
        .bind(row.opened_at.map(fmt_ts))
        .bind(row.last_failure_at.map(fmt_ts))
        .bind(row.last_success_at.map(fmt_ts))
        .bind(row.last_state_change_at.map(fmt_ts))
        .bind(row.id)
        .bind(row.version)
        .execute(self.pool())
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::Contention {
                entity: "circuit",
                id: row.identifier.clone(),
            });
        }
        Ok(row.version.saturating_add(1))
    }

    /// Append an audit event to a breaker's stream.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn record_circuit_event(&self, event: &NewCircuitEvent) -> StoreResult<()> {
        sqlx::query(
            r"INSERT INTO circuit_events
                (circuit_id, event_type, from_state, to_state, context, created_at)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(event.circuit_id)
        .bind(event.event_type.as_str())
        .bind(event.from_state.map(CircuitState::as_str))
        .bind(event.to_state.map(CircuitState::as_str))
        .bind(event.context.as_ref().map(ToString::to_string))
        .bind(fmt_ts(event.at))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Count state-change events for a breaker since `since` (flap scan).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn count_state_changes_since(
        &self,
        circuit_id: i64,
        since: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let row = sqlx::query(
            r"SELECT COUNT(*) AS n FROM circuit_events
              WHERE circuit_id = ?1 AND event_type = 'state_change' AND created_at >= ?2",
        )
        .bind(circuit_id)
        .bind(fmt_ts(since))
        .fetch_one(self.pool())
        .await?;
        Ok(row.try_get("n")?)
    }

    /// Full event stream for a breaker, in append order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn list_circuit_events(&self, circuit_id: i64) -> StoreResult<Vec<CircuitEventRow>> {
        let rows = sqlx::query("SELECT * FROM circuit_events WHERE circuit_id = ?1 ORDER BY id")
            .bind(circuit_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(CircuitEventRow::from_row).collect()
    }

    /// Breakers filtered by level and/or state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn list_circuits(
        &self,
        level: Option<CircuitLevel>,
        state: Option<CircuitState>,
    ) -> StoreResult<Vec<CircuitRow>> {
        let rows = sqlx::query(
            r"SELECT * FROM circuit_breakers
              WHERE (?1 IS NULL OR level = ?1)
                AND (?2 IS NULL OR state = ?2)
              ORDER BY level, identifier",
        )
        .bind(level.map(CircuitLevel::as_str))
        .bind(state.map(CircuitState::as_str))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(CircuitRow::from_row).collect()
    }

    /// Per-level state counts for the admin health view.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn circuit_health(&self) -> StoreResult<CircuitHealth> {
        let rows = sqlx::query(
            "SELECT level, state, COUNT(*) AS n FROM circuit_breakers GROUP BY level, state",
        )
        .fetch_all(self.pool())
        .await?;

        let mut health = CircuitHealth {
            stage: LevelHealth { closed_count: 0, open_count: 0, half_open_count: 0, total: 0 },
            worker: LevelHealth { closed_count: 0, open_count: 0, half_open_count: 0, total: 0 },
            system: LevelHealth { closed_count: 0, open_count: 0, half_open_count: 0, total: 0 },
        };

        for row in &rows {
            let level_raw: String = row.try_get("level")?;
            let state_raw: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            let level: CircuitLevel = level_raw.parse().map_err(StoreError::corrupt)?;
            let state: CircuitState = state_raw.parse().map_err(StoreError::corrupt)?;

            let slot = match level {
                CircuitLevel::Stage => &mut health.stage,
                CircuitLevel::Worker => &mut health.worker,
                CircuitLevel::System => &mut health.system,
            };
            match state {
                CircuitState::Closed => slot.closed_count = slot.closed_count.saturating_add(n),
                CircuitState::Open => slot.open_count = slot.open_count.saturating_add(n),
                CircuitState::HalfOpen => {
                    slot.half_open_count = slot.half_open_count.saturating_add(n);
                }
            }
            slot.total = slot.total.saturating_add(n);
        }

        Ok(health)
    }
}
