//! Append-only attempt records, one per stage execution.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{Store, StoreError, StoreResult};
use crate::types::{fmt_ts, parse_ts, Stage};

/// Input for recording one stage execution.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    /// Task the stage ran against.
    pub task_id: i64,
    /// Which pipeline stage.
    pub stage: Stage,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub completed_at: DateTime<Utc>,
    /// Whether the stage succeeded.
    pub success: bool,
    /// Failure description, when unsuccessful.
    pub error: Option<String>,
    /// Files the stage created.
    pub files_created: Vec<String>,
    /// Files the stage modified.
    pub files_modified: Vec<String>,
    /// Tail of the verifier's stdout.
    pub stdout_tail: Option<String>,
    /// Tail of the verifier's stderr.
    pub stderr_tail: Option<String>,
    /// Fingerprint of the prompt sent to the LLM, when one was.
    pub prompt_fingerprint: Option<String>,
}

/// A stored attempt row.
#[derive(Debug, Clone)]
pub struct AttemptRow {
    /// Row id.
    pub id: i64,
    /// Task the stage ran against.
    pub task_id: i64,
    /// Which pipeline stage.
    pub stage: Stage,
    /// 1-based attempt ordinal per `(task, stage)`.
    pub attempt_number: i64,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: Option<i64>,
    /// Whether the stage succeeded.
    pub success: bool,
    /// Failure description, when unsuccessful.
    pub error: Option<String>,
}

impl AttemptRow {
    fn from_row(row: &SqliteRow) -> StoreResult<Self> {
        let stage_raw: String = row.try_get("stage")?;
        let started_at: String = row.try_get("started_at")?;
        let completed_at: Option<String> = row.try_get("completed_at")?;
        let success: i64 = row.try_get("success")?;
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            stage: stage_raw.parse().map_err(StoreError::corrupt)?,
            attempt_number: row.try_get("attempt_number")?,
            started_at: parse_ts(&started_at).map_err(StoreError::corrupt)?,
            completed_at: completed_at
                .map(|s| parse_ts(&s))
                .transpose()
                .map_err(StoreError::corrupt)?,
            duration_ms: row.try_get("duration_ms")?,
            success: success != 0,
            error: row.try_get("error")?,
        })
    }
}

impl Store {
    /// Append an attempt row, assigning the next attempt number for the
    /// `(task, stage)` pair. Returns the assigned number.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn record_attempt(&self, attempt: &NewAttempt) -> StoreResult<i64> {
        let files_created =
            serde_json::to_string(&attempt.files_created).map_err(StoreError::corrupt)?;
        let files_modified =
            serde_json::to_string(&attempt.files_modified).map_err(StoreError::corrupt)?;
        let duration_ms = attempt
            .completed_at
            .signed_duration_since(attempt.started_at)
            .num_milliseconds();

        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            "SELECT COALESCE(MAX(attempt_number), 0) + 1 AS next
             FROM attempts WHERE task_id = ?1 AND stage = ?2",
        )
        .bind(attempt.task_id)
        .bind(attempt.stage.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let attempt_number: i64 = row.try_get("next")?;

        sqlx::query(
            r"INSERT INTO attempts
                (task_id, stage, attempt_number, started_at, completed_at, duration_ms,
                 success, error, files_created, files_modified, stdout_tail, stderr_tail,
                 prompt_fingerprint)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(attempt.task_id)
        .bind(attempt.stage.as_str())
        .bind(attempt_number)
        .bind(fmt_ts(attempt.started_at))
        .bind(fmt_ts(attempt.completed_at))
        .bind(duration_ms)
        .bind(i64::from(attempt.success))
        .bind(&attempt.error)
        .bind(&files_created)
        .bind(&files_modified)
        .bind(&attempt.stdout_tail)
        .bind(&attempt.stderr_tail)
        .bind(&attempt.prompt_fingerprint)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(attempt_number)
    }

    /// Attempts for one task in execution order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn list_attempts(&self, task_id: i64) -> StoreResult<Vec<AttemptRow>> {
        let rows = sqlx::query("SELECT * FROM attempts WHERE task_id = ?1 ORDER BY id")
            .bind(task_id)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(AttemptRow::from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::open_store;
    use crate::types::TaskSpec;

    fn t0() -> DateTime<Utc> {
        crate::types::parse_ts("2026-01-01T00:00:00Z").expect("ts")
    }

    fn new_attempt(task_id: i64, stage: Stage, success: bool) -> NewAttempt {
        let started = t0();
        NewAttempt {
            task_id,
            stage,
            started_at: started,
            completed_at: started
                .checked_add_signed(chrono::Duration::seconds(2))
                .expect("ts"),
            success,
            error: if success { None } else { Some("boom".to_owned()) },
            files_created: Vec::new(),
            files_modified: Vec::new(),
            stdout_tail: None,
            stderr_tail: None,
            prompt_fingerprint: None,
        }
    }

    async fn insert_task(store: &Store, key: &str) -> i64 {
        let spec = TaskSpec {
            task_key: key.to_owned(),
            title: key.to_owned(),
            goal: String::new(),
            phase: 0,
            sequence: 0,
            complexity: crate::types::Complexity::Low,
            depends_on: Vec::new(),
            acceptance_criteria: Vec::new(),
            test_file: None,
            impl_file: None,
            verify_command: Vec::new(),
            module_exports: Vec::new(),
            hints: None,
        };
        store.insert_task(&spec, t0()).await.expect("insert task")
    }

    #[tokio::test]
    async fn test_attempt_numbers_increase_per_task_stage() {
        let (store, _dir) = open_store().await;
        let task_id = insert_task(&store, "T1").await;

        let n1 = store
            .record_attempt(&new_attempt(task_id, Stage::Green, false))
            .await
            .expect("record");
        let n2 = store
            .record_attempt(&new_attempt(task_id, Stage::Green, true))
            .await
            .expect("record");
        // A different stage starts its own numbering.
        let n3 = store
            .record_attempt(&new_attempt(task_id, Stage::Verify, true))
            .await
            .expect("record");

        assert_eq!(n1, 1);
        assert_eq!(n2, 2);
        assert_eq!(n3, 1);

        let attempts = store.list_attempts(task_id).await.expect("list");
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].duration_ms, Some(2000));
        assert!(!attempts[0].success);
        assert_eq!(attempts[0].error.as_deref(), Some("boom"));
    }
}
