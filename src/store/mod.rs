//! Persistent store backed by SQLite.
//!
//! Single-writer durable state for tasks, attempts, workers, claims,
//! runs, invocations, and circuit breakers. The schema is applied inline
//! via `include_str!` on first open. The pool is capped at one connection:
//! every transaction serializes through it, which is what makes the
//! select-then-CAS patterns below race-free across concurrent workers.
//!
//! All mutating methods take `now` from the caller so tests control the
//! clock, and every mutation of a versioned row goes through a
//! compare-and-swap on `version`.

mod attempts;
mod circuits;
mod runs;
mod tasks;
mod workers;

pub use attempts::{AttemptRow, NewAttempt};
pub use circuits::{CircuitEventRow, CircuitHealth, CircuitRow, LevelHealth, NewCircuitEvent};
pub use runs::RunRow;
pub use tasks::{ClaimAuditRow, ReleaseDisposition, TaskRow};
pub use workers::WorkerRow;

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Failure modes of store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Optimistic-lock CAS lost; the caller should retry.
    #[error("optimistic lock lost on {entity} {id}")]
    Contention {
        /// Entity kind, e.g. `"task"` or `"circuit"`.
        entity: &'static str,
        /// Row identifier.
        id: String,
    },
    /// The addressed row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Row identifier.
        id: String,
    },
    /// The requested state transition is not legal from the current state.
    #[error("invalid transition for {entity} {id}: {detail}")]
    InvalidTransition {
        /// Entity kind.
        entity: &'static str,
        /// Row identifier.
        id: String,
        /// What was attempted and why it is illegal.
        detail: String,
    },
    /// A uniqueness constraint rejected the write.
    #[error("{entity} already exists: {id}")]
    Duplicate {
        /// Entity kind.
        entity: &'static str,
        /// Row identifier.
        id: String,
    },
    /// A stored value failed to parse back into its domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),
    /// Transient I/O failure; retry with backoff.
    #[error("store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

impl StoreError {
    /// Whether the caller may usefully retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Contention { .. } | Self::Unavailable(_))
    }

    /// Map a sqlx error, translating unique-constraint violations.
    fn from_sqlx(e: sqlx::Error, entity: &'static str, id: &str) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                return Self::Duplicate {
                    entity,
                    id: id.to_owned(),
                };
            }
        }
        Self::Unavailable(e)
    }

    /// Map a domain-parse failure to [`StoreError::Corrupt`].
    fn corrupt(e: impl std::fmt::Display) -> Self {
        Self::Corrupt(e.to_string())
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Handle to the orchestrator state database.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the state database at the given path and apply the
    /// schema migration.
    ///
    /// WAL journal mode, foreign keys on, and a busy timeout so queued
    /// writers wait instead of failing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migration fails.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Corrupt(format!(
                        "failed to create state directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF")
            .pragma("foreign_keys", "ON")
            .pragma("busy_timeout", "5000");

        // Single writer: all transactions serialize through one connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let migration_sql = include_str!("../../migrations/001_schema.sql");
        sqlx::raw_sql(migration_sql).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying connection pool.
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
