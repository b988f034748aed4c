//! Execution runs and the invocation trail.
//!
//! A run groups everything one orchestration session does; invocations
//! are append-only and mirrored into the run's used counter so a crashed
//! run still shows how much budget it burned.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{Store, StoreError, StoreResult};
use crate::types::{fmt_ts, parse_ts, Stage};

/// An execution run row.
#[derive(Debug, Clone)]
pub struct RunRow {
    /// Row id.
    pub id: i64,
    /// Opaque run identity.
    pub run_uuid: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished, if it has.
    pub completed_at: Option<DateTime<Utc>>,
    /// Budget cap for this run.
    pub max_invocations: i64,
    /// Invocations consumed so far.
    pub invocations_used: i64,
}

impl RunRow {
    fn from_row(row: &SqliteRow) -> StoreResult<Self> {
        let started_at: String = row.try_get("started_at")?;
        let completed_at: Option<String> = row.try_get("completed_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            run_uuid: row.try_get("run_uuid")?,
            started_at: parse_ts(&started_at).map_err(StoreError::corrupt)?,
            completed_at: completed_at
                .map(|s| parse_ts(&s))
                .transpose()
                .map_err(StoreError::corrupt)?,
            max_invocations: row.try_get("max_invocations")?,
            invocations_used: row.try_get("invocations_used")?,
        })
    }
}

impl Store {
    /// Create a run row and return its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn create_run(
        &self,
        run_uuid: &str,
        max_invocations: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO runs (run_uuid, started_at, max_invocations) VALUES (?1, ?2, ?3)",
        )
        .bind(run_uuid)
        .bind(fmt_ts(now))
        .bind(max_invocations)
        .execute(self.pool())
        .await
        .map_err(|e| StoreError::from_sqlx(e, "run", run_uuid))?;
        Ok(result.last_insert_rowid())
    }

    /// Append an invocation and bump the run's used counter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown run.
    pub async fn record_invocation(
        &self,
        run_id: i64,
        worker_id: i64,
        task_id: Option<i64>,
        stage: Option<Stage>,
        tokens: i64,
        duration_ms: Option<i64>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r"INSERT INTO invocations (run_id, worker_id, task_id, stage, at, tokens, duration_ms)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(run_id)
        .bind(worker_id)
        .bind(task_id)
        .bind(stage.map(Stage::as_str))
        .bind(fmt_ts(now))
        .bind(tokens)
        .bind(duration_ms)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(
            "UPDATE runs SET invocations_used = invocations_used + 1 WHERE id = ?1",
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "run",
                id: run_id.to_string(),
            });
        }

        tx.commit().await?;
        Ok(())
    }

    /// Stamp the run's completion time.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn finish_run(&self, run_id: i64, now: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE runs SET completed_at = ?1 WHERE id = ?2")
            .bind(fmt_ts(now))
            .bind(run_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Fetch a run row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown run.
    pub async fn get_run(&self, run_id: i64) -> StoreResult<RunRow> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?1")
            .bind(run_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or(StoreError::NotFound {
                entity: "run",
                id: run_id.to_string(),
            })?;
        RunRow::from_row(&row)
    }

    /// The most recently started run, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn latest_run(&self) -> StoreResult<Option<RunRow>> {
        let row = sqlx::query("SELECT * FROM runs ORDER BY id DESC LIMIT 1")
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(RunRow::from_row).transpose()
    }
}
