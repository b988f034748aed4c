//! Claim engine: the lease contract workers consume.
//!
//! Thin composition over the store's primitives. A claim is a lease, not
//! ownership: it expires after `claim_ttl` and the reaper (or the next
//! `claim_next`) reclaims the task. The engine never kills a worker; it
//! only takes the *task* back.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::debug;

use crate::store::{ReleaseDisposition, Store, StoreError, StoreResult, TaskRow};

/// Bounded local retries when the claim CAS loses.
const CLAIM_ATTEMPTS: u32 = 3;

/// Hands out exclusive, leased claims on runnable tasks.
#[derive(Debug, Clone)]
pub struct ClaimEngine {
    store: Store,
    claim_ttl: Duration,
}

impl ClaimEngine {
    /// Build an engine with the given lease length.
    pub fn new(store: Store, claim_timeout_seconds: u64) -> Self {
        Self {
            store,
            claim_ttl: Duration::seconds(i64::try_from(claim_timeout_seconds).unwrap_or(i64::MAX)),
        }
    }

    /// Claim the next runnable task for `worker_id`, retrying a lost CAS
    /// up to three times with jitter. `None` means nothing is runnable.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Contention`] when every retry lost, which the
    /// caller should treat as "try again next poll".
    pub async fn claim_next(
        &self,
        worker_id: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TaskRow>> {
        let mut attempt: u32 = 0;
        loop {
            match self.store.claim_next(worker_id, now, self.claim_ttl).await {
                Ok(task) => {
                    if let Some(task) = &task {
                        debug!(worker_id, task_key = %task.task_key, "claimed task");
                    }
                    return Ok(task);
                }
                Err(StoreError::Contention { .. })
                    if attempt.saturating_add(1) < CLAIM_ATTEMPTS =>
                {
                    attempt = attempt.saturating_add(1);
                    let jitter_ms = rand::thread_rng().gen_range(5..=25);
                    tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Release a held claim per the disposition. Returns the new version.
    ///
    /// # Errors
    ///
    /// Propagates the store's contention / invalid-transition errors.
    pub async fn release(
        &self,
        task_id: i64,
        expected_version: i64,
        disposition: ReleaseDisposition,
        now: DateTime<Utc>,
    ) -> StoreResult<i64> {
        self.store
            .release(task_id, expected_version, disposition, now)
            .await
    }

    /// Revert every expired claim to pending. Returns the reaped task ids.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on I/O failure.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<i64>> {
        let reaped = self.store.reap_expired_claims(now).await?;
        if !reaped.is_empty() {
            debug!(count = reaped.len(), "reaped expired claims");
        }
        Ok(reaped)
    }
}
