//! Core error taxonomy.
//!
//! Collaborator and store failures are mapped onto a small closed set of
//! classes that drive the retry policy: transient errors retry at the same
//! worker, contention retries locally with a bound, fatal-task blocks the
//! task, fatal-worker feeds the worker breaker, and fatal-system feeds the
//! system breaker.

/// Recovery class of a failure, driving retry and breaker policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retryable at the same worker within `max_stage_attempts`
    /// (I/O blip, timeout, collaborator rate limit).
    Transient,
    /// Optimistic-lock CAS lost; retry locally up to 3 times.
    Contention,
    /// Unrecoverable for this task; the task transitions to blocked.
    FatalTask,
    /// Unrecoverable for this worker (auth failure, broken environment);
    /// the worker breaker records the failure.
    FatalWorker,
    /// Aggregated failure rate; the system breaker opens.
    FatalSystem,
    /// Broken invariant; recorded with full context, aborts the run.
    InvariantViolated,
}

impl ErrorClass {
    /// Whether the same worker may retry the failed stage.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Contention)
    }
}

/// A classified stage failure surfaced by the stage executor.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{class:?} failure in stage execution: {message}")]
pub struct StageFailure {
    /// Recovery class driving the worker's retry policy.
    pub class: ErrorClass,
    /// Human-readable description, recorded on the attempt row.
    pub message: String,
}

impl StageFailure {
    /// Build a transient (retryable) failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    /// Build a fatal-task failure.
    pub fn fatal_task(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::FatalTask,
            message: message.into(),
        }
    }

    /// Build a fatal-worker failure.
    pub fn fatal_worker(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::FatalWorker,
            message: message.into(),
        }
    }

    /// Build an invariant-violation failure. The worker that surfaces one
    /// raises the pool abort signal: the whole run stops, not just the task.
    pub fn invariant_violated(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::InvariantViolated,
            message: message.into(),
        }
    }
}
