//! Worker registry and heartbeat trail.
//!
//! Worker rows are retained after death for audit; heartbeats are
//! append-only.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{Store, StoreError, StoreResult};
use crate::types::{fmt_ts, parse_ts, WorkerStatus};

/// A registered worker row.
#[derive(Debug, Clone)]
pub struct WorkerRow {
    /// Worker id (distinct per pool member).
    pub id: i64,
    /// Current status.
    pub status: WorkerStatus,
    /// First registration time.
    pub registered_at: DateTime<Utc>,
    /// Most recent heartbeat time.
    pub last_heartbeat: DateTime<Utc>,
    /// Task currently claimed, if any.
    pub current_task_id: Option<i64>,
    /// Branch this worker writes to.
    pub branch: Option<String>,
}

impl WorkerRow {
    fn from_row(row: &SqliteRow) -> StoreResult<Self> {
        let status_raw: String = row.try_get("status")?;
        let registered_at: String = row.try_get("registered_at")?;
        let last_heartbeat: String = row.try_get("last_heartbeat")?;
        Ok(Self {
            id: row.try_get("id")?,
            status: status_raw.parse().map_err(StoreError::corrupt)?,
            registered_at: parse_ts(&registered_at).map_err(StoreError::corrupt)?,
            last_heartbeat: parse_ts(&last_heartbeat).map_err(StoreError::corrupt)?,
            current_task_id: row.try_get("current_task_id")?,
            branch: row.try_get("branch")?,
        })
    }
}

impl Store {
    /// Register a worker (or revive a previous row with the same id).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn register_worker(
        &self,
        worker_id: i64,
        branch: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let ts = fmt_ts(now);
        sqlx::query(
            r"INSERT INTO workers (id, status, registered_at, last_heartbeat, branch)
              VALUES (?1, 'active', ?2, ?2, ?3)
              ON CONFLICT (id) DO UPDATE SET
                status = 'active',
                last_heartbeat = ?2,
                current_task_id = NULL,
                branch = ?3",
        )
        .bind(worker_id)
        .bind(&ts)
        .bind(branch)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Record a heartbeat: update `last_heartbeat` and append to the trail.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unregistered worker.
    pub async fn heartbeat(
        &self,
        worker_id: i64,
        status: WorkerStatus,
        task_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let ts = fmt_ts(now);
        let mut tx = self.pool().begin().await?;

        let updated = sqlx::query("UPDATE workers SET last_heartbeat = ?1, status = ?2 WHERE id = ?3")
            .bind(&ts)
            .bind(status.as_str())
            .bind(worker_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "worker",
                id: worker_id.to_string(),
            });
        }

        sqlx::query("INSERT INTO heartbeats (worker_id, at, status, task_id) VALUES (?1, ?2, ?3, ?4)")
            .bind(worker_id)
            .bind(&ts)
            .bind(status.as_str())
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Mark a worker dead (graceful shutdown or stale detection).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn mark_worker_dead(&self, worker_id: i64, now: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "UPDATE workers SET status = 'dead', last_heartbeat = ?1, current_task_id = NULL
             WHERE id = ?2",
        )
        .bind(fmt_ts(now))
        .bind(worker_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Workers whose last heartbeat is strictly older than the threshold
    /// and which are not already dead.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn stale_workers(
        &self,
        now: DateTime<Utc>,
        stale_threshold: Duration,
    ) -> StoreResult<Vec<WorkerRow>> {
        let cutoff = fmt_ts(now.checked_sub_signed(stale_threshold).unwrap_or(now));
        let rows = sqlx::query(
            "SELECT * FROM workers WHERE status != 'dead' AND last_heartbeat < ?1 ORDER BY id",
        )
        .bind(&cutoff)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(WorkerRow::from_row).collect()
    }

    /// All worker rows, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn list_workers(&self) -> StoreResult<Vec<WorkerRow>> {
        let rows = sqlx::query("SELECT * FROM workers ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(WorkerRow::from_row).collect()
    }
}
