//! Circuit breaker core: the closed/open/half-open state machine.
//!
//! This module is pure: it mutates a loaded [`CircuitRow`] in memory and
//! returns the audit events the caller must append. Persistence (CAS
//! write-back, event append, flap scan) lives in [`manager`].
//!
//! Three levels share the machine with different thresholds: stage and
//! worker breakers count consecutive failures; the system breaker keeps a
//! sliding window of the most recent attempt outcomes and trips on the
//! failure rate.

pub mod manager;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::config::CircuitsConfig;
use crate::store::CircuitRow;
use crate::types::{CircuitEventType, CircuitLevel, CircuitState};

/// Threshold configuration for one breaker.
///
/// Snapshotted as JSON onto the row at creation so a breaker keeps the
/// config it was born with.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures that trip (counter mode).
    pub failure_threshold: u32,
    /// Failure-rate percentage that trips (window mode); `None` selects
    /// counter mode.
    pub failure_rate_percent: Option<u8>,
    /// Attempts kept in the sliding window (window mode).
    pub window_size: u32,
    /// Minimum window occupancy before the rate is evaluated.
    pub min_samples: u32,
    /// Minimum open duration before a probe is admitted.
    pub cooldown: Duration,
    /// Half-open successes required to close.
    pub recovery_successes: u32,
    /// Half-open → open cycles allowed before manual reset is required.
    pub max_extensions: u32,
    /// State changes within `flap_window` that signal flapping.
    pub flap_threshold: u32,
    /// History horizon for flapping detection.
    pub flap_window: Duration,
}

impl CircuitConfig {
    /// Breaker config for the given hierarchy level.
    pub fn for_level(level: CircuitLevel, config: &CircuitsConfig) -> Self {
        let seconds = |s: u64| Duration::seconds(i64::try_from(s).unwrap_or(i64::MAX));
        let flap_window = seconds(config.flap_window_seconds);
        match level {
            CircuitLevel::Stage => Self {
                failure_threshold: config.stage_failure_threshold,
                failure_rate_percent: None,
                window_size: 0,
                min_samples: 0,
                cooldown: seconds(config.stage_cooldown_seconds),
                recovery_successes: config.stage_recovery_successes,
                max_extensions: config.max_extensions,
                flap_threshold: config.flap_threshold,
                flap_window,
            },
            CircuitLevel::Worker => Self {
                failure_threshold: config.worker_failure_threshold,
                failure_rate_percent: None,
                window_size: 0,
                min_samples: 0,
                cooldown: seconds(config.worker_cooldown_seconds),
                recovery_successes: config.worker_recovery_successes,
                max_extensions: config.max_extensions,
                flap_threshold: config.flap_threshold,
                flap_window,
            },
            CircuitLevel::System => Self {
                failure_threshold: 0,
                failure_rate_percent: Some(config.system_failure_rate_percent),
                window_size: config.system_failure_window,
                min_samples: config.system_min_samples,
                cooldown: seconds(config.system_cooldown_seconds),
                recovery_successes: config.system_recovery_successes,
                max_extensions: config.max_extensions,
                flap_threshold: config.flap_threshold,
                flap_window,
            },
        }
    }

    /// JSON snapshot stored on the breaker row at creation.
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "failure_threshold": self.failure_threshold,
            "failure_rate_percent": self.failure_rate_percent,
            "window_size": self.window_size,
            "min_samples": self.min_samples,
            "cooldown_seconds": self.cooldown.num_seconds(),
            "recovery_successes": self.recovery_successes,
            "max_extensions": self.max_extensions,
            "flap_threshold": self.flap_threshold,
            "flap_window_seconds": self.flap_window.num_seconds(),
        })
    }
}

/// An audit event produced by a pure transition, to be appended by the
/// caller after the CAS write-back succeeds.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    /// What happened.
    pub event_type: CircuitEventType,
    /// State before, for state-change events.
    pub from_state: Option<CircuitState>,
    /// State after, for state-change events.
    pub to_state: Option<CircuitState>,
    /// Structured context.
    pub context: Option<serde_json::Value>,
}

impl PendingEvent {
    fn state_change(from: CircuitState, to: CircuitState, context: serde_json::Value) -> Self {
        Self {
            event_type: CircuitEventType::StateChange,
            from_state: Some(from),
            to_state: Some(to),
            context: Some(context),
        }
    }

    fn plain(event_type: CircuitEventType, context: serde_json::Value) -> Self {
        Self {
            event_type,
            from_state: None,
            to_state: None,
            context: Some(context),
        }
    }
}

/// Outcome of an admission check against one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    /// The breaker is closed; proceed.
    Admit,
    /// The breaker is half-open and this caller won the probe slot.
    AdmitProbe,
    /// The breaker denies execution.
    Deny(DenyReason),
}

/// Why an admission was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The system breaker is open.
    SystemOpen,
    /// The caller's worker breaker is open.
    WorkerOpen,
    /// The `(task, stage)` breaker is open.
    StageOpen,
    /// A half-open breaker already has its probe in flight.
    Probing,
}

impl DenyReason {
    /// Stable string form used in logs and release context.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SystemOpen => "system-open",
            Self::WorkerOpen => "worker-open",
            Self::StageOpen => "stage-open",
            Self::Probing => "probing",
        }
    }

    /// The open-denial reason for a hierarchy level.
    pub fn open_for_level(level: CircuitLevel) -> Self {
        match level {
            CircuitLevel::System => Self::SystemOpen,
            CircuitLevel::Worker => Self::WorkerOpen,
            CircuitLevel::Stage => Self::StageOpen,
        }
    }
}

/// Ask one breaker for permission to execute.
///
/// Closed admits. Open admits nothing until `cooldown` has elapsed, at
/// which point the breaker transitions to half-open and this caller takes
/// the single probe slot, unless the extension budget is exhausted, in
/// which case the breaker stays open for manual reset. Half-open admits
/// only the probe-slot winner.
///
/// Returns the decision, the events to append, and whether the row was
/// mutated (and therefore needs a CAS write-back).
pub fn try_admit(
    row: &mut CircuitRow,
    config: &CircuitConfig,
    level: CircuitLevel,
    now: DateTime<Utc>,
) -> (AdmitDecision, Vec<PendingEvent>, bool) {
    match row.state {
        CircuitState::Closed => (AdmitDecision::Admit, Vec::new(), false),
        CircuitState::Open => {
            if still_open(row, config, now) {
                return (
                    AdmitDecision::Deny(DenyReason::open_for_level(level)),
                    Vec::new(),
                    false,
                );
            }
            row.state = CircuitState::HalfOpen;
            row.success_count = 0;
            row.half_open_requests = 1;
            row.last_state_change_at = Some(now);
            let events = vec![
                PendingEvent::plain(
                    CircuitEventType::RecoveryStarted,
                    json!({"cooldown_seconds": config.cooldown.num_seconds()}),
                ),
                PendingEvent::state_change(
                    CircuitState::Open,
                    CircuitState::HalfOpen,
                    json!({"reason": "cooldown-elapsed"}),
                ),
            ];
            (AdmitDecision::AdmitProbe, events, true)
        }
        CircuitState::HalfOpen => {
            if row.half_open_requests >= 1 {
                return (AdmitDecision::Deny(DenyReason::Probing), Vec::new(), false);
            }
            row.half_open_requests = 1;
            (AdmitDecision::AdmitProbe, Vec::new(), true)
        }
    }
}

/// Whether an open breaker would still deny a probe at `now`.
///
/// True while the cooldown has not elapsed, and permanently once the
/// extension budget is spent (only manual reset recovers from that).
/// Read-only: callers use this to peek at a breaker without taking the
/// probe slot.
pub fn still_open(row: &CircuitRow, config: &CircuitConfig, now: DateTime<Utc>) -> bool {
    if row.state != CircuitState::Open {
        return false;
    }
    if row.extensions >= i64::from(config.max_extensions) {
        return true;
    }
    !row.opened_at
        .and_then(|t| t.checked_add_signed(config.cooldown))
        .is_some_and(|t| now >= t)
}

/// Record a successful execution.
pub fn on_success(
    row: &mut CircuitRow,
    config: &CircuitConfig,
    now: DateTime<Utc>,
) -> Vec<PendingEvent> {
    row.last_success_at = Some(now);
    push_window(row, config, true);

    let mut events = vec![PendingEvent::plain(
        CircuitEventType::SuccessRecorded,
        json!({"state": row.state.as_str()}),
    )];

    match row.state {
        CircuitState::Closed => {
            // Success resets the consecutive-failure counter.
            row.failure_count = 0;
            row.success_count = row.success_count.saturating_add(1);
        }
        CircuitState::HalfOpen => {
            row.success_count = row.success_count.saturating_add(1);
            row.half_open_requests = 0;
            if row.success_count >= i64::from(config.recovery_successes) {
                row.state = CircuitState::Closed;
                row.failure_count = 0;
                row.success_count = 0;
                row.extensions = 0;
                row.opened_at = None;
                row.last_state_change_at = Some(now);
                events.push(PendingEvent::plain(
                    CircuitEventType::RecoverySucceeded,
                    json!({"recovery_successes": config.recovery_successes}),
                ));
                events.push(PendingEvent::state_change(
                    CircuitState::HalfOpen,
                    CircuitState::Closed,
                    json!({"reason": "recovery"}),
                ));
            }
        }
        // A success reported against an open breaker is an in-flight stage
        // that finished after the trip; counted in the window only.
        CircuitState::Open => {}
    }

    events
}

/// Record a failed execution.
pub fn on_failure(
    row: &mut CircuitRow,
    config: &CircuitConfig,
    now: DateTime<Utc>,
) -> Vec<PendingEvent> {
    row.last_failure_at = Some(now);
    row.failure_count = row.failure_count.saturating_add(1);
    push_window(row, config, false);

    let mut events = vec![PendingEvent::plain(
        CircuitEventType::FailureRecorded,
        json!({"failure_count": row.failure_count, "state": row.state.as_str()}),
    )];

    match row.state {
        CircuitState::Closed => {
            if should_trip(row, config) {
                row.state = CircuitState::Open;
                row.opened_at = Some(now);
                row.last_state_change_at = Some(now);
                events.push(PendingEvent::plain(
                    CircuitEventType::ThresholdReached,
                    json!({"failure_count": row.failure_count}),
                ));
                events.push(PendingEvent::state_change(
                    CircuitState::Closed,
                    CircuitState::Open,
                    json!({"reason": "threshold"}),
                ));
            }
        }
        CircuitState::HalfOpen => {
            // A failed probe re-opens and consumes one extension.
            row.state = CircuitState::Open;
            row.opened_at = Some(now);
            row.half_open_requests = 0;
            row.success_count = 0;
            row.extensions = row.extensions.saturating_add(1);
            row.last_state_change_at = Some(now);
            events.push(PendingEvent::plain(
                CircuitEventType::RecoveryFailed,
                json!({"extensions": row.extensions}),
            ));
            events.push(PendingEvent::plain(
                CircuitEventType::ExtensionApplied,
                json!({"extensions": row.extensions, "max_extensions": config.max_extensions}),
            ));
            events.push(PendingEvent::state_change(
                CircuitState::HalfOpen,
                CircuitState::Open,
                json!({"reason": "probe-failed"}),
            ));
        }
        CircuitState::Open => {}
    }

    events
}

/// Operator reset: close the breaker and zero every counter, including
/// extensions. Always appends a `manual_reset` event; a state change is
/// appended only when the state actually moved.
pub fn manual_reset(row: &mut CircuitRow, now: DateTime<Utc>) -> Vec<PendingEvent> {
    let previous = row.state;
    row.failure_count = 0;
    row.success_count = 0;
    row.half_open_requests = 0;
    row.extensions = 0;
    row.window.clear();
    row.opened_at = None;

    let mut events = vec![PendingEvent::plain(
        CircuitEventType::ManualReset,
        json!({"zeroed": true, "from": previous.as_str()}),
    )];

    if previous != CircuitState::Closed {
        row.state = CircuitState::Closed;
        row.last_state_change_at = Some(now);
        events.push(PendingEvent::state_change(
            previous,
            CircuitState::Closed,
            json!({"reason": "manual-reset"}),
        ));
    }

    events
}

/// Reconstruct the terminal state from an event stream.
///
/// The stream is authoritative: the last state-change (or manual reset)
/// wins; a stream with neither means the breaker never left closed.
pub fn replay(events: &[crate::store::CircuitEventRow]) -> CircuitState {
    let mut state = CircuitState::Closed;
    for event in events {
        match event.event_type {
            CircuitEventType::StateChange => {
                if let Some(to) = event.to_state {
                    state = to;
                }
            }
            CircuitEventType::ManualReset => state = CircuitState::Closed,
            _ => {}
        }
    }
    state
}

/// Append an outcome to the sliding window, trimming to `window_size`.
/// Counter-mode breakers keep no window.
fn push_window(row: &mut CircuitRow, config: &CircuitConfig, success: bool) {
    if config.failure_rate_percent.is_none() {
        return;
    }
    row.window.push(success);
    let cap = usize::try_from(config.window_size).unwrap_or(usize::MAX);
    while row.window.len() > cap {
        row.window.remove(0);
    }
}

/// Whether a closed breaker should open after the failure just recorded.
fn should_trip(row: &CircuitRow, config: &CircuitConfig) -> bool {
    match config.failure_rate_percent {
        None => row.failure_count >= i64::from(config.failure_threshold),
        Some(rate) => {
            let samples = row.window.len();
            if samples < usize::try_from(config.min_samples).unwrap_or(usize::MAX) {
                return false;
            }
            let failures = row.window.iter().filter(|ok| !**ok).count();
            // failures / samples >= rate / 100, kept in integers.
            failures.saturating_mul(100) >= usize::from(rate).saturating_mul(samples)
        }
    }
}
