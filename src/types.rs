//! Core domain types shared across the orchestrator.
//!
//! Every enum here maps one-to-one onto a CHECK-constrained column in the
//! schema, so `as_str` / `FromStr` round-trip through the database.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker; runnable once dependencies are satisfied.
    Pending,
    /// Claimed by exactly one worker holding a live lease.
    InProgress,
    /// All pipeline stages succeeded; tests pass.
    Passing,
    /// Verified and merged by the external coordinator. Terminal.
    Complete,
    /// Unrecoverable failure for this task. Terminal until operator retry.
    Blocked,
    /// Static review found unfixable violations. Terminal until operator retry.
    BlockedStaticReview,
}

impl TaskStatus {
    /// Database string representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Passing => "passing",
            Self::Complete => "complete",
            Self::Blocked => "blocked",
            Self::BlockedStaticReview => "blocked_static_review",
        }
    }

    /// Whether this status satisfies a dependency edge.
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, Self::Passing | Self::Complete)
    }

    /// Whether this status is terminal (no worker will progress it).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Blocked | Self::BlockedStaticReview)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "passing" => Ok(Self::Passing),
            "complete" => Ok(Self::Complete),
            "blocked" => Ok(Self::Blocked),
            "blocked_static_review" => Ok(Self::BlockedStaticReview),
            other => Err(anyhow::anyhow!("unknown task status: {other}")),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task complexity, used as a model-tier hint by the prompt builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Small, mechanical change.
    Low,
    /// Typical feature-sized task.
    Medium,
    /// Cross-cutting or subtle task.
    High,
}

impl Complexity {
    /// Database string representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::str::FromStr for Complexity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(anyhow::anyhow!("unknown complexity: {other}")),
        }
    }
}

/// One step of the TDD pipeline.
///
/// Fixed order: RED → RED_FIX (only when RED fails recoverably) → GREEN →
/// VERIFY → (FIX → RE_VERIFY)*.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Write a failing test.
    Red,
    /// Repair a recoverably-broken RED output.
    RedFix,
    /// Write the implementation that makes the test pass.
    Green,
    /// Run the task's verify command and static checks.
    Verify,
    /// Repair the implementation after a failed VERIFY.
    Fix,
    /// Re-run verification after a FIX round.
    ReVerify,
}

impl Stage {
    /// Database string representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::RedFix => "red_fix",
            Self::Green => "green",
            Self::Verify => "verify",
            Self::Fix => "fix",
            Self::ReVerify => "re_verify",
        }
    }

    /// Whether this stage invokes the LLM (and therefore counts against the
    /// invocation budget).
    pub fn is_llm_stage(self) -> bool {
        matches!(self, Self::Red | Self::RedFix | Self::Green | Self::Fix)
    }

    /// Breaker identifier for this stage on the given task,
    /// e.g. `"TDD-17:green"`.
    pub fn breaker_identifier(self, task_key: &str) -> String {
        format!("{task_key}:{}", self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "red" => Ok(Self::Red),
            "red_fix" => Ok(Self::RedFix),
            "green" => Ok(Self::Green),
            "verify" => Ok(Self::Verify),
            "fix" => Ok(Self::Fix),
            "re_verify" => Ok(Self::ReVerify),
            other => Err(anyhow::anyhow!("unknown stage: {other}")),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registered worker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Executing a stage or claiming.
    Active,
    /// Polling with no runnable task.
    Idle,
    /// Marked dead on shutdown or after missing heartbeats.
    Dead,
}

impl WorkerStatus {
    /// Database string representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Dead => "dead",
        }
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "dead" => Ok(Self::Dead),
            other => Err(anyhow::anyhow!("unknown worker status: {other}")),
        }
    }
}

/// Why a claim ended, recorded in the claim audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimOutcome {
    /// The pipeline finished successfully.
    Completed,
    /// The pipeline failed for this worker.
    Failed,
    /// The worker gave the task back (breaker denial or shutdown).
    Released,
    /// The lease expired and the reaper reclaimed the task.
    Timeout,
}

impl ClaimOutcome {
    /// Database string representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Released => "released",
            Self::Timeout => "timeout",
        }
    }
}

/// Circuit breaker hierarchy level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitLevel {
    /// One breaker per `(task, stage)` pair.
    Stage,
    /// One breaker per worker.
    Worker,
    /// The single system-wide breaker.
    System,
}

impl CircuitLevel {
    /// Database string representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stage => "stage",
            Self::Worker => "worker",
            Self::System => "system",
        }
    }
}

impl std::str::FromStr for CircuitLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stage" => Ok(Self::Stage),
            "worker" => Ok(Self::Worker),
            "system" => Ok(Self::System),
            other => Err(anyhow::anyhow!("unknown circuit level: {other}")),
        }
    }
}

impl std::fmt::Display for CircuitLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; requests admitted.
    Closed,
    /// Tripped; all requests denied until the cooldown elapses.
    Open,
    /// Probing; a single request is admitted to test recovery.
    HalfOpen,
}

impl CircuitState {
    /// Database string representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::str::FromStr for CircuitState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half_open" => Ok(Self::HalfOpen),
            other => Err(anyhow::anyhow!("unknown circuit state: {other}")),
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit event types appended to a breaker's event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitEventType {
    /// The breaker moved between states.
    StateChange,
    /// A failure was counted.
    FailureRecorded,
    /// A success was counted.
    SuccessRecorded,
    /// The failure threshold was reached.
    ThresholdReached,
    /// A half-open probe began.
    RecoveryStarted,
    /// Half-open probing accumulated enough successes to close.
    RecoverySucceeded,
    /// A half-open probe failed and the breaker re-opened.
    RecoveryFailed,
    /// An operator reset the breaker.
    ManualReset,
    /// Rapid state oscillation was detected (observability only).
    FlappingDetected,
    /// A half-open → open cycle consumed one extension.
    ExtensionApplied,
}

impl CircuitEventType {
    /// Database string representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StateChange => "state_change",
            Self::FailureRecorded => "failure_recorded",
            Self::SuccessRecorded => "success_recorded",
            Self::ThresholdReached => "threshold_reached",
            Self::RecoveryStarted => "recovery_started",
            Self::RecoverySucceeded => "recovery_succeeded",
            Self::RecoveryFailed => "recovery_failed",
            Self::ManualReset => "manual_reset",
            Self::FlappingDetected => "flapping_detected",
            Self::ExtensionApplied => "extension_applied",
        }
    }
}

/// A task definition as produced by decomposition ingestion.
///
/// This is the external input shape; `Store::insert_task` turns it into a
/// row with `status = pending` and `version = 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Human-readable unique key, e.g. `"TDD-17"`.
    pub task_key: String,
    /// Short title.
    pub title: String,
    /// What the task should achieve.
    #[serde(default)]
    pub goal: String,
    /// Ordering phase (coarse).
    #[serde(default)]
    pub phase: i64,
    /// Ordering sequence within the phase (fine).
    #[serde(default)]
    pub sequence: i64,
    /// Complexity, used as a model-tier hint.
    #[serde(default = "default_complexity")]
    pub complexity: Complexity,
    /// Keys of tasks that must be passing or complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Acceptance criteria shown to the LLM.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Path of the test file this task owns.
    #[serde(default)]
    pub test_file: Option<String>,
    /// Path of the implementation file this task owns.
    #[serde(default)]
    pub impl_file: Option<String>,
    /// Verification command as an argv vector (never run via a shell).
    #[serde(default)]
    pub verify_command: Vec<String>,
    /// Names the implementation file must export.
    #[serde(default)]
    pub module_exports: Vec<String>,
    /// Free-form implementation hints passed to the prompt builder.
    #[serde(default)]
    pub hints: Option<String>,
}

fn default_complexity() -> Complexity {
    Complexity::Medium
}

/// Format a timestamp as a fixed-width RFC 3339 UTC string.
///
/// Microsecond precision with a trailing `Z`, so lexicographic comparison
/// in SQL matches chronological order.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp previously written by [`fmt_ts`].
///
/// # Errors
///
/// Returns an error if the string is not valid RFC 3339.
pub fn parse_ts(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}
