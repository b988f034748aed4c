//! Task rows: ingestion, claiming, release, and expiry reaping.
//!
//! `claim_next` is the hot path: candidate selection and the version CAS
//! run in one transaction on the single writer connection, so exactly one
//! of any number of concurrent callers wins a given task.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{Store, StoreError, StoreResult};
use crate::types::{fmt_ts, parse_ts, ClaimOutcome, Complexity, TaskSpec, TaskStatus};

/// A task row as stored.
#[derive(Debug, Clone)]
pub struct TaskRow {
    /// Opaque numeric id.
    pub id: i64,
    /// Human-readable unique key.
    pub task_key: String,
    /// Short title.
    pub title: String,
    /// What the task should achieve.
    pub goal: String,
    /// Ordering phase.
    pub phase: i64,
    /// Ordering sequence within the phase.
    pub sequence: i64,
    /// Complexity hint.
    pub complexity: Complexity,
    /// Keys of prerequisite tasks.
    pub depends_on: Vec<String>,
    /// Acceptance criteria shown to the LLM.
    pub acceptance_criteria: Vec<String>,
    /// Test file path.
    pub test_file: Option<String>,
    /// Implementation file path.
    pub impl_file: Option<String>,
    /// Verify command argv vector.
    pub verify_command: Vec<String>,
    /// Names the implementation must export.
    pub module_exports: Vec<String>,
    /// Free-form implementation hints.
    pub hints: Option<String>,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Claiming worker, when a claim exists.
    pub claim_by: Option<i64>,
    /// When the live claim was taken.
    pub claimed_at: Option<DateTime<Utc>>,
    /// When the live claim expires.
    pub claim_expires_at: Option<DateTime<Utc>>,
    /// Optimistic-lock token; strictly increases on every mutation.
    pub version: i64,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn from_row(row: &SqliteRow) -> StoreResult<Self> {
        let status_raw: String = row.try_get("status")?;
        let complexity_raw: String = row.try_get("complexity")?;
        let depends_on: String = row.try_get("depends_on")?;
        let acceptance: String = row.try_get("acceptance_criteria")?;
        let verify_command: String = row.try_get("verify_command")?;
        let module_exports: String = row.try_get("module_exports")?;
        let claimed_at: Option<String> = row.try_get("claimed_at")?;
        let claim_expires_at: Option<String> = row.try_get("claim_expires_at")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(Self {
            id: row.try_get("id")?,
            task_key: row.try_get("task_key")?,
            title: row.try_get("title")?,
            goal: row.try_get("goal")?,
            phase: row.try_get("phase")?,
            sequence: row.try_get("sequence")?,
            complexity: complexity_raw.parse().map_err(StoreError::corrupt)?,
            depends_on: serde_json::from_str(&depends_on).map_err(StoreError::corrupt)?,
            acceptance_criteria: serde_json::from_str(&acceptance).map_err(StoreError::corrupt)?,
            test_file: row.try_get("test_file")?,
            impl_file: row.try_get("impl_file")?,
            verify_command: serde_json::from_str(&verify_command).map_err(StoreError::corrupt)?,
            module_exports: serde_json::from_str(&module_exports).map_err(StoreError::corrupt)?,
            hints: row.try_get("hints")?,
            status: status_raw.parse().map_err(StoreError::corrupt)?,
            claim_by: row.try_get("claim_by")?,
            claimed_at: claimed_at
                .map(|s| parse_ts(&s))
                .transpose()
                .map_err(StoreError::corrupt)?,
            claim_expires_at: claim_expires_at
                .map(|s| parse_ts(&s))
                .transpose()
                .map_err(StoreError::corrupt)?,
            version: row.try_get("version")?,
            created_at: parse_ts(&created_at).map_err(StoreError::corrupt)?,
            updated_at: parse_ts(&updated_at).map_err(StoreError::corrupt)?,
        })
    }
}

/// How a worker hands a task back, mapped onto status + claim audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseDisposition {
    /// The whole pipeline succeeded; task becomes `passing`.
    Passing,
    /// Retryable failure past the attempt limit; task returns to `pending`
    /// so a different worker can try.
    Failed,
    /// Breaker denial or shutdown; task returns to `pending`.
    Released,
    /// Fatal-task failure; task becomes `blocked`.
    Blocked,
    /// Unfixable static review; task becomes `blocked_static_review`.
    BlockedStaticReview,
}

impl ReleaseDisposition {
    /// The task status this disposition transitions to.
    pub fn target_status(self) -> TaskStatus {
        match self {
            Self::Passing => TaskStatus::Passing,
            Self::Failed | Self::Released => TaskStatus::Pending,
            Self::Blocked => TaskStatus::Blocked,
            Self::BlockedStaticReview => TaskStatus::BlockedStaticReview,
        }
    }

    /// The claim-audit outcome recorded alongside the transition.
    pub fn claim_outcome(self) -> ClaimOutcome {
        match self {
            Self::Passing => ClaimOutcome::Completed,
            Self::Released => ClaimOutcome::Released,
            Self::Failed | Self::Blocked | Self::BlockedStaticReview => ClaimOutcome::Failed,
        }
    }
}

/// One row of the claim audit trail.
#[derive(Debug, Clone)]
pub struct ClaimAuditRow {
    /// Claimed task.
    pub task_id: i64,
    /// Claiming worker.
    pub worker_id: i64,
    /// When the claim was taken.
    pub claimed_at: DateTime<Utc>,
    /// When the claim ended, if it has.
    pub released_at: Option<DateTime<Utc>>,
    /// How the claim ended, if it has.
    pub outcome: Option<ClaimOutcome>,
}

fn parse_claim_outcome(raw: &str) -> StoreResult<ClaimOutcome> {
    match raw {
        "completed" => Ok(ClaimOutcome::Completed),
        "failed" => Ok(ClaimOutcome::Failed),
        "released" => Ok(ClaimOutcome::Released),
        "timeout" => Ok(ClaimOutcome::Timeout),
        other => Err(StoreError::Corrupt(format!("unknown claim outcome: {other}"))),
    }
}

/// Candidate selection for `claim_next`.
///
/// Runnable: pending (or in-progress with an expired lease), with every
/// dependency in a terminal-success status. Deterministic order:
/// `(phase, sequence, task_key)`.
const CANDIDATE_SQL: &str = r"
    SELECT id, version FROM tasks AS t
    WHERE (
        t.status = 'pending'
        OR (t.status = 'in_progress'
            AND t.claim_expires_at IS NOT NULL
            AND t.claim_expires_at < ?1)
    )
    AND NOT EXISTS (
        SELECT 1 FROM json_each(t.depends_on) AS dep
        WHERE NOT EXISTS (
            SELECT 1 FROM tasks AS d
            WHERE d.task_key = dep.value
              AND d.status IN ('passing', 'complete')
        )
    )
    ORDER BY t.phase, t.sequence, t.task_key
    LIMIT 1";

impl Store {
    /// Insert a task from a decomposition spec with status `pending` and
    /// version 1.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] when the task key already exists.
    pub async fn insert_task(&self, spec: &TaskSpec, now: DateTime<Utc>) -> StoreResult<i64> {
        let ts = fmt_ts(now);
        let depends_on = serde_json::to_string(&spec.depends_on).map_err(StoreError::corrupt)?;
        let acceptance =
            serde_json::to_string(&spec.acceptance_criteria).map_err(StoreError::corrupt)?;
        let verify_command =
            serde_json::to_string(&spec.verify_command).map_err(StoreError::corrupt)?;
        let module_exports =
            serde_json::to_string(&spec.module_exports).map_err(StoreError::corrupt)?;

        let result = sqlx::query(
            r"INSERT INTO tasks
                (task_key, title, goal, phase, sequence, complexity, depends_on,
                 acceptance_criteria, test_file, impl_file, verify_command,
                 module_exports, hints, created_at, updated_at)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
        )
        .bind(&spec.task_key)
        .bind(&spec.title)
        .bind(&spec.goal)
        .bind(spec.phase)
        .bind(spec.sequence)
        .bind(spec.complexity.as_str())
        .bind(&depends_on)
        .bind(&acceptance)
        .bind(&spec.test_file)
        .bind(&spec.impl_file)
        .bind(&verify_command)
        .bind(&module_exports)
        .bind(&spec.hints)
        .bind(&ts)
        .execute(self.pool())
        .await
        .map_err(|e| StoreError::from_sqlx(e, "task", &spec.task_key))?;

        Ok(result.last_insert_rowid())
    }

    /// Fetch a task by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no such task exists.
    pub async fn get_task(&self, task_id: i64) -> StoreResult<TaskRow> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(task_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or(StoreError::NotFound {
                entity: "task",
                id: task_id.to_string(),
            })?;
        TaskRow::from_row(&row)
    }

    /// Fetch a task by its human key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no such task exists.
    pub async fn get_task_by_key(&self, task_key: &str) -> StoreResult<TaskRow> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_key = ?1")
            .bind(task_key)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "task",
                id: task_key.to_owned(),
            })?;
        TaskRow::from_row(&row)
    }

    /// List tasks, optionally filtered by status, in `(phase, sequence,
    /// task_key)` order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> StoreResult<Vec<TaskRow>> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT * FROM tasks WHERE status = ?1 ORDER BY phase, sequence, task_key",
                )
                .bind(s.as_str())
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM tasks ORDER BY phase, sequence, task_key")
                    .fetch_all(self.pool())
                    .await?
            }
        };
        rows.iter().map(TaskRow::from_row).collect()
    }

    /// Count tasks grouped by status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn task_status_counts(&self) -> StoreResult<Vec<(TaskStatus, i64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(self.pool())
            .await?;
        rows.iter()
            .map(|row| {
                let raw: String = row.try_get("status")?;
                let n: i64 = row.try_get("n")?;
                let status: TaskStatus = raw.parse().map_err(StoreError::corrupt)?;
                Ok((status, n))
            })
            .collect()
    }

    /// Atomically claim the next runnable task for `worker_id`.
    ///
    /// Selects the lowest `(phase, sequence, task_key)` runnable task, sets
    /// it in-progress with a lease of `claim_ttl`, bumps the version, and
    /// writes the claim audit row. Returns `None` when nothing is runnable.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Contention`] when the version CAS loses (the
    /// caller retries), [`StoreError::Unavailable`] on I/O failure.
    pub async fn claim_next(
        &self,
        worker_id: i64,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> StoreResult<Option<TaskRow>> {
        let ts = fmt_ts(now);
        let expires = fmt_ts(now.checked_add_signed(claim_ttl).unwrap_or(now));

        let mut tx = self.pool().begin().await?;

        let Some(candidate) = sqlx::query(CANDIDATE_SQL)
            .bind(&ts)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };
        let task_id: i64 = candidate.try_get("id")?;
        let version: i64 = candidate.try_get("version")?;

        let updated = sqlx::query(
            r"UPDATE tasks
              SET status = 'in_progress', claim_by = ?1, claimed_at = ?2,
                  claim_expires_at = ?3, version = version + 1, updated_at = ?2
              WHERE id = ?4 AND version = ?5",
        )
        .bind(worker_id)
        .bind(&ts)
        .bind(&expires)
        .bind(task_id)
        .bind(version)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::Contention {
                entity: "task",
                id: task_id.to_string(),
            });
        }

        // A takeover of an expired lease closes out the stale audit row.
        sqlx::query(
            "UPDATE task_claims SET outcome = 'timeout', released_at = ?1
             WHERE task_id = ?2 AND outcome IS NULL",
        )
        .bind(&ts)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO task_claims (task_id, worker_id, claimed_at) VALUES (?1, ?2, ?3)")
            .bind(task_id)
            .bind(worker_id)
            .bind(&ts)
            .execute(&mut *tx)
            .await?;

        // On a lease takeover the previous holder no longer owns the task.
        sqlx::query("UPDATE workers SET current_task_id = NULL WHERE current_task_id = ?1 AND id != ?2")
            .bind(task_id)
            .bind(worker_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE workers SET current_task_id = ?1, status = 'active' WHERE id = ?2")
            .bind(task_id)
            .bind(worker_id)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(task_id)
            .fetch_one(&mut *tx)
            .await?;
        let task = TaskRow::from_row(&row)?;

        tx.commit().await?;
        Ok(Some(task))
    }

    /// Release a claimed task, transitioning it per the disposition.
    ///
    /// Clears the claim, bumps the version, and closes the claim audit row.
    /// Returns the new version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Contention`] when `expected_version` is stale,
    /// [`StoreError::InvalidTransition`] when the task is not in progress,
    /// [`StoreError::NotFound`] when the task does not exist.
    pub async fn release(
        &self,
        task_id: i64,
        expected_version: i64,
        disposition: ReleaseDisposition,
        now: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let ts = fmt_ts(now);
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query("SELECT status, version, claim_by FROM tasks WHERE id = ?1")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "task",
                id: task_id.to_string(),
            })?;
        let status_raw: String = row.try_get("status")?;
        let version: i64 = row.try_get("version")?;
        let claim_by: Option<i64> = row.try_get("claim_by")?;
        let status: TaskStatus = status_raw.parse().map_err(StoreError::corrupt)?;

        if status != TaskStatus::InProgress {
            return Err(StoreError::InvalidTransition {
                entity: "task",
                id: task_id.to_string(),
                detail: format!("release from {status}, expected in_progress"),
            });
        }
        if version != expected_version {
            return Err(StoreError::Contention {
                entity: "task",
                id: task_id.to_string(),
            });
        }

        let target = disposition.target_status();
        let updated = sqlx::query(
            r"UPDATE tasks
              SET status = ?1, claim_by = NULL, claimed_at = NULL,
                  claim_expires_at = NULL, version = version + 1, updated_at = ?2
              WHERE id = ?3 AND version = ?4",
        )
        .bind(target.as_str())
        .bind(&ts)
        .bind(task_id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Contention {
                entity: "task",
                id: task_id.to_string(),
            });
        }

        sqlx::query(
            "UPDATE task_claims SET outcome = ?1, released_at = ?2
             WHERE task_id = ?3 AND outcome IS NULL",
        )
        .bind(disposition.claim_outcome().as_str())
        .bind(&ts)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        if let Some(worker_id) = claim_by {
            sqlx::query(
                "UPDATE workers SET current_task_id = NULL
                 WHERE id = ?1 AND current_task_id = ?2",
            )
            .bind(worker_id)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(expected_version.saturating_add(1))
    }

    /// Revert every in-progress task whose lease expired before `now` back
    /// to pending, auditing the outcome as `timeout`. Returns reaped ids.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn reap_expired_claims(&self, now: DateTime<Utc>) -> StoreResult<Vec<i64>> {
        let ts = fmt_ts(now);
        let mut tx = self.pool().begin().await?;

        let rows = sqlx::query(
            "SELECT id, claim_by FROM tasks
             WHERE status = 'in_progress'
               AND claim_expires_at IS NOT NULL AND claim_expires_at < ?1",
        )
        .bind(&ts)
        .fetch_all(&mut *tx)
        .await?;

        let mut reaped = Vec::with_capacity(rows.len());
        for row in &rows {
            let task_id: i64 = row.try_get("id")?;
            let claim_by: Option<i64> = row.try_get("claim_by")?;

            sqlx::query(
                r"UPDATE tasks
                  SET status = 'pending', claim_by = NULL, claimed_at = NULL,
                      claim_expires_at = NULL, version = version + 1, updated_at = ?1
                  WHERE id = ?2 AND status = 'in_progress'",
            )
            .bind(&ts)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "UPDATE task_claims SET outcome = 'timeout', released_at = ?1
                 WHERE task_id = ?2 AND outcome IS NULL",
            )
            .bind(&ts)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

            if let Some(worker_id) = claim_by {
                sqlx::query(
                    "UPDATE workers SET current_task_id = NULL
                     WHERE id = ?1 AND current_task_id = ?2",
                )
                .bind(worker_id)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
            }

            reaped.push(task_id);
        }

        tx.commit().await?;
        Ok(reaped)
    }

    /// Operator recovery: move a blocked task back to pending.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown key and
    /// [`StoreError::InvalidTransition`] when the task is not blocked.
    pub async fn retry_task(&self, task_key: &str, now: DateTime<Utc>) -> StoreResult<i64> {
        self.transition_by_key(
            task_key,
            &[TaskStatus::Blocked, TaskStatus::BlockedStaticReview],
            TaskStatus::Pending,
            now,
        )
        .await
    }

    /// Record external verification: move a passing task to complete.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown key and
    /// [`StoreError::InvalidTransition`] when the task is not passing.
    pub async fn mark_task_complete(&self, task_key: &str, now: DateTime<Utc>) -> StoreResult<i64> {
        self.transition_by_key(task_key, &[TaskStatus::Passing], TaskStatus::Complete, now)
            .await
    }

    /// Resume support: revert in-progress tasks whose worker has no live
    /// heartbeat since `heartbeat_cutoff`. Returns the reverted ids.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn reset_orphaned_tasks(
        &self,
        heartbeat_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<i64>> {
        let ts = fmt_ts(now);
        let cutoff = fmt_ts(heartbeat_cutoff);
        let mut tx = self.pool().begin().await?;

        let rows = sqlx::query(
            r"SELECT id FROM tasks AS t
              WHERE t.status = 'in_progress'
                AND (t.claim_by IS NULL OR NOT EXISTS (
                    SELECT 1 FROM workers AS w
                    WHERE w.id = t.claim_by
                      AND w.status != 'dead'
                      AND w.last_heartbeat >= ?1
                ))",
        )
        .bind(&cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut reverted = Vec::with_capacity(rows.len());
        for row in &rows {
            let task_id: i64 = row.try_get("id")?;
            sqlx::query(
                r"UPDATE tasks
                  SET status = 'pending', claim_by = NULL, claimed_at = NULL,
                      claim_expires_at = NULL, version = version + 1, updated_at = ?1
                  WHERE id = ?2 AND status = 'in_progress'",
            )
            .bind(&ts)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE task_claims SET outcome = 'timeout', released_at = ?1
                 WHERE task_id = ?2 AND outcome IS NULL",
            )
            .bind(&ts)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
            reverted.push(task_id);
        }

        tx.commit().await?;
        Ok(reverted)
    }

    /// Claim audit rows for one task, in claim order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn list_claim_audit(&self, task_id: i64) -> StoreResult<Vec<ClaimAuditRow>> {
        let rows = sqlx::query("SELECT * FROM task_claims WHERE task_id = ?1 ORDER BY id")
            .bind(task_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter()
            .map(|row| {
                let claimed_at: String = row.try_get("claimed_at")?;
                let released_at: Option<String> = row.try_get("released_at")?;
                let outcome: Option<String> = row.try_get("outcome")?;
                Ok(ClaimAuditRow {
                    task_id: row.try_get("task_id")?,
                    worker_id: row.try_get("worker_id")?,
                    claimed_at: parse_ts(&claimed_at).map_err(StoreError::corrupt)?,
                    released_at: released_at
                        .map(|s| parse_ts(&s))
                        .transpose()
                        .map_err(StoreError::corrupt)?,
                    outcome: outcome
                        .map(|s| parse_claim_outcome(&s))
                        .transpose()?,
                })
            })
            .collect()
    }

    /// Shared CAS transition by task key.
    async fn transition_by_key(
        &self,
        task_key: &str,
        from: &[TaskStatus],
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let task = self.get_task_by_key(task_key).await?;
        if !from.contains(&task.status) {
            return Err(StoreError::InvalidTransition {
                entity: "task",
                id: task_key.to_owned(),
                detail: format!("{} -> {to} not permitted", task.status),
            });
        }

        let updated = sqlx::query(
            "UPDATE tasks SET status = ?1, version = version + 1, updated_at = ?2
             WHERE id = ?3 AND version = ?4",
        )
        .bind(to.as_str())
        .bind(fmt_ts(now))
        .bind(task.id)
        .bind(task.version)
        .execute(self.pool())
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Contention {
                entity: "task",
                id: task_key.to_owned(),
            });
        }
        Ok(task.version.saturating_add(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::open_store;

    fn spec(key: &str, phase: i64, sequence: i64) -> TaskSpec {
        TaskSpec {
            task_key: key.to_owned(),
            title: format!("task {key}"),
            goal: String::new(),
            phase,
            sequence,
            complexity: Complexity::Medium,
            depends_on: Vec::new(),
            acceptance_criteria: Vec::new(),
            test_file: None,
            impl_file: None,
            verify_command: Vec::new(),
            module_exports: Vec::new(),
            hints: None,
        }
    }

    fn t0() -> DateTime<Utc> {
        crate::types::parse_ts("2026-01-01T00:00:00Z").expect("ts")
    }

    #[tokio::test]
    async fn test_claim_next_orders_by_phase_sequence_key() {
        let (store, _dir) = open_store().await;
        let now = t0();
        store.insert_task(&spec("B-2", 1, 0), now).await.expect("insert");
        store.insert_task(&spec("A-9", 0, 5), now).await.expect("insert");
        store.insert_task(&spec("A-1", 0, 5), now).await.expect("insert");

        let task = store
            .claim_next(1, now, Duration::seconds(300))
            .await
            .expect("claim")
            .expect("some");
        // Same (phase, sequence): task_key breaks the tie.
        assert_eq!(task.task_key, "A-1");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.version, 2);
        assert_eq!(task.claim_by, Some(1));
    }

    #[tokio::test]
    async fn test_claim_next_skips_unmet_dependencies() {
        let (store, _dir) = open_store().await;
        let now = t0();
        let mut dependent = spec("T2", 0, 1);
        dependent.depends_on = vec!["T1".to_owned()];
        store.insert_task(&dependent, now).await.expect("insert");
        store.insert_task(&spec("T1", 0, 0), now).await.expect("insert");

        let first = store
            .claim_next(1, now, Duration::seconds(300))
            .await
            .expect("claim")
            .expect("some");
        assert_eq!(first.task_key, "T1");

        // T2 is not runnable while T1 is in progress.
        let none = store
            .claim_next(2, now, Duration::seconds(300))
            .await
            .expect("claim");
        assert!(none.is_none());

        store
            .release(first.id, first.version, ReleaseDisposition::Passing, now)
            .await
            .expect("release");

        let second = store
            .claim_next(2, now, Duration::seconds(300))
            .await
            .expect("claim")
            .expect("some");
        assert_eq!(second.task_key, "T2");
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let (store, _dir) = open_store().await;
        let now = t0();
        store.insert_task(&spec("T1", 0, 0), now).await.expect("insert");

        let ttl = Duration::seconds(300);
        let (a, b) = tokio::join!(store.claim_next(1, now, ttl), store.claim_next(2, now, ttl));
        let a = a.expect("claim a");
        let b = b.expect("claim b");
        assert!(a.is_some() != b.is_some(), "exactly one claim must win");
    }

    #[tokio::test]
    async fn test_claim_release_round_trip_bumps_version_twice() {
        let (store, _dir) = open_store().await;
        let now = t0();
        store.insert_task(&spec("T1", 0, 0), now).await.expect("insert");

        let task = store
            .claim_next(1, now, Duration::seconds(300))
            .await
            .expect("claim")
            .expect("some");
        assert_eq!(task.version, 2);

        let new_version = store
            .release(task.id, task.version, ReleaseDisposition::Released, now)
            .await
            .expect("release");
        assert_eq!(new_version, 3);

        let task = store.get_task(task.id).await.expect("get");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.version, 3);
        assert!(task.claim_by.is_none());
    }

    #[tokio::test]
    async fn test_release_with_stale_version_is_contention() {
        let (store, _dir) = open_store().await;
        let now = t0();
        store.insert_task(&spec("T1", 0, 0), now).await.expect("insert");
        let task = store
            .claim_next(1, now, Duration::seconds(300))
            .await
            .expect("claim")
            .expect("some");

        let err = store
            .release(task.id, task.version.saturating_sub(1), ReleaseDisposition::Passing, now)
            .await
            .expect_err("stale version");
        assert!(matches!(err, StoreError::Contention { .. }));
    }

    #[tokio::test]
    async fn test_reap_reverts_expired_claims() {
        let (store, _dir) = open_store().await;
        let now = t0();
        store.insert_task(&spec("T1", 0, 0), now).await.expect("insert");
        let task = store
            .claim_next(1, now, Duration::seconds(300))
            .await
            .expect("claim")
            .expect("some");

        // One second before expiry: nothing to reap.
        let at_299 = now.checked_add_signed(Duration::seconds(299)).expect("ts");
        let reaped = store.reap_expired_claims(at_299).await.expect("reap");
        assert!(reaped.is_empty());

        let at_301 = now.checked_add_signed(Duration::seconds(301)).expect("ts");
        let reaped = store.reap_expired_claims(at_301).await.expect("reap");
        assert_eq!(reaped, vec![task.id]);

        let task = store.get_task(task.id).await.expect("get");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.version, 3);
        assert!(task.claim_by.is_none());

        // A different worker can now take it.
        let reclaimed = store
            .claim_next(2, at_301, Duration::seconds(300))
            .await
            .expect("claim")
            .expect("some");
        assert_eq!(reclaimed.id, task.id);
        assert_eq!(reclaimed.claim_by, Some(2));
    }

    #[tokio::test]
    async fn test_expired_claim_is_directly_reclaimable() {
        let (store, _dir) = open_store().await;
        let now = t0();
        store.insert_task(&spec("T1", 0, 0), now).await.expect("insert");
        store
            .claim_next(1, now, Duration::seconds(300))
            .await
            .expect("claim")
            .expect("some");

        // Without reaping, a claim_next past expiry takes the task over.
        let later = now.checked_add_signed(Duration::seconds(301)).expect("ts");
        let taken = store
            .claim_next(2, later, Duration::seconds(300))
            .await
            .expect("claim")
            .expect("some");
        assert_eq!(taken.claim_by, Some(2));
        assert_eq!(taken.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_duplicate_task_key_rejected() {
        let (store, _dir) = open_store().await;
        let now = t0();
        store.insert_task(&spec("T1", 0, 0), now).await.expect("insert");
        let err = store
            .insert_task(&spec("T1", 0, 1), now)
            .await
            .expect_err("duplicate");
        assert!(matches!(err, StoreError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn test_retry_task_requires_blocked() {
        let (store, _dir) = open_store().await;
        let now = t0();
        store.insert_task(&spec("T1", 0, 0), now).await.expect("insert");

        let err = store.retry_task("T1", now).await.expect_err("pending task");
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let task = store
            .claim_next(1, now, Duration::seconds(300))
            .await
            .expect("claim")
            .expect("some");
        store
            .release(task.id, task.version, ReleaseDisposition::Blocked, now)
            .await
            .expect("release");

        let version = store.retry_task("T1", now).await.expect("retry");
        assert_eq!(version, 4);
        let task = store.get_task(task.id).await.expect("get");
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_mark_complete_requires_passing() {
        let (store, _dir) = open_store().await;
        let now = t0();
        store.insert_task(&spec("T1", 0, 0), now).await.expect("insert");
        let task = store
            .claim_next(1, now, Duration::seconds(300))
            .await
            .expect("claim")
            .expect("some");
        store
            .release(task.id, task.version, ReleaseDisposition::Passing, now)
            .await
            .expect("release");

        store.mark_task_complete("T1", now).await.expect("complete");
        let task = store.get_task(task.id).await.expect("get");
        assert_eq!(task.status, TaskStatus::Complete);
    }
}
