//! Work queue repository
//!
//! Persistent, priority-ordered queue with lease-and-claim semantics for
//! multiple workers and no external broker. Claims are atomic conditional
//! updates checked by affected-row count (the SQLite equivalent of
//! `FOR UPDATE SKIP LOCKED`): a row another worker grabbed between the
//! candidate select and the claim update simply fails the condition and is
//! skipped.
//!
//! Container-creation items additionally honor a single-writer-per-user
//! guard: no container item is leased for a user while another container
//! item of theirs is already leased. This serializes Phase 1 of two-phase
//! sync without any process-level coordination.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use inkmirror_core::domain::newtypes::{ContentHash, UserId, WorkItemId};
use inkmirror_core::domain::{
    backoff, DestinationSelector, WorkItem, WorkKind, WorkStatus, MAX_ATTEMPTS,
};

use crate::time::{fmt_ts, parse_ts, parse_ts_opt};
use crate::StoreError;

/// Repository for the persistent work queue
pub struct WorkQueueRepository {
    pool: SqlitePool,
}

impl WorkQueueRepository {
    /// Creates a new repository instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Enqueues a work item, deduplicating against open items
    ///
    /// At most one non-terminal item exists per `(user, target_ref, kind)`;
    /// enqueueing while one is open is a silent no-op and returns `false`.
    pub async fn enqueue(&self, item: &WorkItem) -> Result<bool, StoreError> {
        let destinations = serde_json::to_string(&item.destinations)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        let result = sqlx::query(
            "INSERT INTO work_items \
             (id, user_id, kind, target_ref, content_hash_snapshot, destinations, priority, \
              status, attempts, available_at, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 'queued', 0, ?, ?) \
             ON CONFLICT (user_id, target_ref, kind) WHERE status IN ('queued', 'leased') \
             DO NOTHING",
        )
        .bind(item.id.to_string())
        .bind(item.user_id.to_string())
        .bind(item.kind.as_str())
        .bind(&item.target_ref)
        .bind(
            item.content_hash_snapshot
                .as_ref()
                .map(|h| h.as_str().to_string()),
        )
        .bind(destinations)
        .bind(item.priority)
        .bind(fmt_ts(item.available_at))
        .bind(fmt_ts(item.created_at))
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        if inserted {
            debug!(
                id = %item.id,
                kind = %item.kind,
                target = %item.target_ref,
                "Work item enqueued"
            );
        } else {
            debug!(
                kind = %item.kind,
                target = %item.target_ref,
                "Open work item already queued, skipping enqueue"
            );
        }
        Ok(inserted)
    }

    /// Claims up to `batch` items for `worker_id` under a lease
    ///
    /// Candidates are taken lowest priority value first, then oldest, and
    /// only when `available_at` has passed. Each candidate is claimed by a
    /// conditional update; rows lost to concurrent workers are skipped.
    pub async fn claim_batch(
        &self,
        worker_id: &str,
        batch: i64,
        lease: Duration,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let now = Utc::now();
        let rows = sqlx::query(
            "SELECT id FROM work_items w \
             WHERE status = 'queued' AND available_at <= ? \
             AND NOT (kind = 'container' AND EXISTS ( \
                 SELECT 1 FROM work_items w2 \
                 WHERE w2.user_id = w.user_id AND w2.kind = 'container' \
                 AND w2.status = 'leased')) \
             ORDER BY priority ASC, created_at ASC LIMIT ?",
        )
        .bind(fmt_ts(now))
        .bind(batch)
        .fetch_all(&self.pool)
        .await?;

        let lease_expires = now + lease;
        let mut claimed = Vec::new();

        for row in rows {
            let id: String = row.try_get("id")?;
            // The claim re-checks both the queued status and the container
            // guard atomically; losing either check skips the row.
            let result = sqlx::query(
                "UPDATE work_items SET status = 'leased', lease_owner = ?, lease_expires_at = ? \
                 WHERE id = ? AND status = 'queued' \
                 AND NOT (kind = 'container' AND EXISTS ( \
                     SELECT 1 FROM work_items w2 \
                     WHERE w2.user_id = work_items.user_id AND w2.kind = 'container' \
                     AND w2.status = 'leased' AND w2.id != work_items.id))",
            )
            .bind(worker_id)
            .bind(fmt_ts(lease_expires))
            .bind(&id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                if let Some(item) = self.get(&WorkItemId::from_str(&id)?).await? {
                    claimed.push(item);
                }
            }
        }

        if !claimed.is_empty() {
            debug!(worker = worker_id, count = claimed.len(), "Claimed work items");
        }
        Ok(claimed)
    }

    /// Marks a leased item done
    ///
    /// Conditional on the caller still holding the lease; a worker whose
    /// lease was swept away gets `Conflict` and must drop the item.
    pub async fn complete(&self, id: &WorkItemId, worker_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE work_items SET status = 'done', lease_owner = NULL, lease_expires_at = NULL \
             WHERE id = ? AND status = 'leased' AND lease_owner = ?",
        )
        .bind(id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "work item {id} is not leased by {worker_id}"
            )));
        }
        Ok(())
    }

    /// Records a failed attempt: requeues with backoff, or marks the item
    /// failed once attempts are exhausted
    pub async fn fail(
        &self,
        id: &WorkItemId,
        worker_id: &str,
        error: &str,
    ) -> Result<WorkStatus, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT attempts FROM work_items \
             WHERE id = ? AND status = 'leased' AND lease_owner = ?",
        )
        .bind(id.to_string())
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            StoreError::Conflict(format!("work item {id} is not leased by {worker_id}"))
        })?;

        let attempts: i32 = row.try_get("attempts")?;
        let next_attempts = attempts + 1;

        let final_status = if next_attempts < MAX_ATTEMPTS {
            let retry_at = Utc::now() + backoff(next_attempts);
            sqlx::query(
                "UPDATE work_items SET status = 'queued', lease_owner = NULL, \
                 lease_expires_at = NULL, attempts = ?, available_at = ?, last_error = ? \
                 WHERE id = ?",
            )
            .bind(next_attempts)
            .bind(fmt_ts(retry_at))
            .bind(error)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
            warn!(
                id = %id,
                attempts = next_attempts,
                retry_at = %retry_at,
                error,
                "Work item failed, requeued with backoff"
            );
            WorkStatus::Queued
        } else {
            sqlx::query(
                "UPDATE work_items SET status = 'failed', lease_owner = NULL, \
                 lease_expires_at = NULL, attempts = ?, last_error = ? WHERE id = ?",
            )
            .bind(next_attempts)
            .bind(error)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
            warn!(id = %id, attempts = next_attempts, error, "Work item failed permanently");
            WorkStatus::Failed
        };

        tx.commit().await?;
        Ok(final_status)
    }

    /// Marks a leased item failed immediately, skipping remaining retries
    ///
    /// Used for non-retryable failures (auth, validation, destination
    /// permanent errors) where backoff cannot help.
    pub async fn fail_permanent(
        &self,
        id: &WorkItemId,
        worker_id: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE work_items SET status = 'failed', lease_owner = NULL, \
             lease_expires_at = NULL, attempts = attempts + 1, last_error = ? \
             WHERE id = ? AND status = 'leased' AND lease_owner = ?",
        )
        .bind(error)
        .bind(id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "work item {id} is not leased by {worker_id}"
            )));
        }
        warn!(id = %id, error, "Work item failed permanently (non-retryable)");
        Ok(())
    }

    /// Re-queues any leased item whose lease has lapsed
    ///
    /// Run periodically so a crashed worker cannot hold work indefinitely.
    /// Returns the number of items reclaimed.
    pub async fn sweep_expired_leases(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE work_items SET status = 'queued', lease_owner = NULL, \
             lease_expires_at = NULL WHERE status = 'leased' AND lease_expires_at < ?",
        )
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;

        let swept = result.rows_affected();
        if swept > 0 {
            info!(count = swept, "Reclaimed expired work item leases");
        }
        Ok(swept)
    }

    /// Fetches one item by id
    pub async fn get(&self, id: &WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        let row = sqlx::query("SELECT * FROM work_items WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::map_item(&r)).transpose()
    }

    /// Number of items currently waiting to be claimed
    pub async fn queued_depth(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM work_items WHERE status = 'queued'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    fn map_item(row: &sqlx::sqlite::SqliteRow) -> Result<WorkItem, StoreError> {
        let id: String = row.try_get("id")?;
        let user_id: String = row.try_get("user_id")?;
        let kind: String = row.try_get("kind")?;
        let target_ref: String = row.try_get("target_ref")?;
        let content_hash_snapshot: Option<String> = row.try_get("content_hash_snapshot")?;
        let destinations: String = row.try_get("destinations")?;
        let priority: i32 = row.try_get("priority")?;
        let status: String = row.try_get("status")?;
        let lease_owner: Option<String> = row.try_get("lease_owner")?;
        let lease_expires_at: Option<String> = row.try_get("lease_expires_at")?;
        let attempts: i32 = row.try_get("attempts")?;
        let available_at: String = row.try_get("available_at")?;
        let created_at: String = row.try_get("created_at")?;
        let last_error: Option<String> = row.try_get("last_error")?;

        let destinations: DestinationSelector = serde_json::from_str(&destinations)
            .map_err(|e| StoreError::SerializationError(format!("Invalid destinations: {e}")))?;

        Ok(WorkItem {
            id: WorkItemId::from_str(&id)?,
            user_id: UserId::from_str(&user_id)?,
            kind: WorkKind::parse(&kind)?,
            target_ref,
            content_hash_snapshot: content_hash_snapshot.map(ContentHash::new).transpose()?,
            destinations,
            priority,
            status: WorkStatus::parse(&status)?,
            lease_owner,
            lease_expires_at: parse_ts_opt(lease_expires_at.as_deref())?,
            attempts,
            available_at: parse_ts(&available_at)?,
            created_at: parse_ts(&created_at)?,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserRepository;
    use crate::DatabasePool;

    async fn setup() -> (WorkQueueRepository, UserId) {
        let db = DatabasePool::in_memory().await.unwrap();
        let users = UserRepository::new(db.pool().clone());
        let user = users.find_or_create("oauth|queue").await.unwrap();
        (WorkQueueRepository::new(db.pool().clone()), user.id)
    }

    fn item(user: UserId, kind: WorkKind, target: &str) -> WorkItem {
        WorkItem::new(user, kind, target, DestinationSelector::All)
    }

    #[tokio::test]
    async fn test_enqueue_dedupes_open_items() {
        let (repo, user) = setup().await;
        assert!(repo.enqueue(&item(user, WorkKind::Full, "page-1")).await.unwrap());
        // Same (user, target, kind) while open: no-op
        assert!(!repo.enqueue(&item(user, WorkKind::Full, "page-1")).await.unwrap());
        // Different kind for the same target is a distinct open item
        assert!(repo
            .enqueue(&item(user, WorkKind::Metadata, "page-1"))
            .await
            .unwrap());
        assert_eq!(repo.queued_depth().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_age() {
        let (repo, user) = setup().await;
        repo.enqueue(&item(user, WorkKind::Metadata, "nb-1")).await.unwrap();
        repo.enqueue(&item(user, WorkKind::Full, "page-1")).await.unwrap();
        repo.enqueue(&item(user, WorkKind::Container, "nb-1")).await.unwrap();

        let claimed = repo
            .claim_batch("worker-a", 10, Duration::seconds(60))
            .await
            .unwrap();
        // Containers (priority 0) come before full (10) before metadata (20);
        // only one container per user leases at a time, but there is only one.
        let kinds: Vec<WorkKind> = claimed.iter().map(|i| i.kind).collect();
        assert_eq!(
            kinds,
            vec![WorkKind::Container, WorkKind::Full, WorkKind::Metadata]
        );
        for it in &claimed {
            assert_eq!(it.status, WorkStatus::Leased);
            assert_eq!(it.lease_owner.as_deref(), Some("worker-a"));
            assert!(it.lease_expires_at.is_some());
        }
    }

    #[tokio::test]
    async fn test_container_claims_serialize_per_user() {
        let (repo, user) = setup().await;
        repo.enqueue(&item(user, WorkKind::Container, "nb-1")).await.unwrap();
        repo.enqueue(&item(user, WorkKind::Container, "nb-2")).await.unwrap();

        let first = repo
            .claim_batch("worker-a", 10, Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(first.len(), 1, "only one container lease per user at a time");

        // A second worker gets nothing while the container lease is held
        let second = repo
            .claim_batch("worker-b", 10, Duration::seconds(60))
            .await
            .unwrap();
        assert!(second.is_empty());

        // Completing the first frees the next container item
        repo.complete(&first[0].id, "worker-a").await.unwrap();
        let third = repo
            .claim_batch("worker-b", 10, Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].target_ref, "nb-2");
    }

    #[tokio::test]
    async fn test_claimed_items_invisible_to_other_workers() {
        let (repo, user) = setup().await;
        repo.enqueue(&item(user, WorkKind::Full, "page-1")).await.unwrap();

        let a = repo
            .claim_batch("worker-a", 10, Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(a.len(), 1);
        let b = repo
            .claim_batch("worker-b", 10, Duration::seconds(60))
            .await
            .unwrap();
        assert!(b.is_empty());
    }

    #[tokio::test]
    async fn test_complete_requires_lease_ownership() {
        let (repo, user) = setup().await;
        repo.enqueue(&item(user, WorkKind::Full, "page-1")).await.unwrap();
        let claimed = repo
            .claim_batch("worker-a", 1, Duration::seconds(60))
            .await
            .unwrap();

        let err = repo.complete(&claimed[0].id, "worker-b").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        repo.complete(&claimed[0].id, "worker-a").await.unwrap();

        let done = repo.get(&claimed[0].id).await.unwrap().unwrap();
        assert_eq!(done.status, WorkStatus::Done);
        assert!(done.lease_owner.is_none());
    }

    #[tokio::test]
    async fn test_fail_requeues_with_backoff_then_fails_permanently() {
        let (repo, user) = setup().await;
        repo.enqueue(&item(user, WorkKind::Full, "page-1")).await.unwrap();

        for attempt in 1..MAX_ATTEMPTS {
            // The item is backed off into the future, so make it claimable
            sqlx::query("UPDATE work_items SET available_at = ? WHERE status = 'queued'")
                .bind(fmt_ts(Utc::now()))
                .execute(&repo.pool)
                .await
                .unwrap();
            let claimed = repo
                .claim_batch("worker-a", 1, Duration::seconds(60))
                .await
                .unwrap();
            assert_eq!(claimed.len(), 1, "claim for attempt {attempt}");
            let status = repo
                .fail(&claimed[0].id, "worker-a", "destination 503")
                .await
                .unwrap();
            assert_eq!(status, WorkStatus::Queued);
        }

        // Final attempt exhausts the budget
        sqlx::query("UPDATE work_items SET available_at = ? WHERE status = 'queued'")
            .bind(fmt_ts(Utc::now()))
            .execute(&repo.pool)
            .await
            .unwrap();
        let claimed = repo
            .claim_batch("worker-a", 1, Duration::seconds(60))
            .await
            .unwrap();
        let status = repo
            .fail(&claimed[0].id, "worker-a", "destination 503")
            .await
            .unwrap();
        assert_eq!(status, WorkStatus::Failed);

        let failed = repo.get(&claimed[0].id).await.unwrap().unwrap();
        assert_eq!(failed.attempts, MAX_ATTEMPTS);
        assert_eq!(failed.last_error.as_deref(), Some("destination 503"));
    }

    #[tokio::test]
    async fn test_backoff_delays_requeued_items() {
        let (repo, user) = setup().await;
        repo.enqueue(&item(user, WorkKind::Full, "page-1")).await.unwrap();
        let claimed = repo
            .claim_batch("worker-a", 1, Duration::seconds(60))
            .await
            .unwrap();
        repo.fail(&claimed[0].id, "worker-a", "timeout").await.unwrap();

        // Requeued but not yet available
        let reclaim = repo
            .claim_batch("worker-a", 1, Duration::seconds(60))
            .await
            .unwrap();
        assert!(reclaim.is_empty());

        let requeued = repo.get(&claimed[0].id).await.unwrap().unwrap();
        assert!(requeued.available_at > Utc::now());
    }

    #[tokio::test]
    async fn test_sweep_reclaims_expired_leases() {
        let (repo, user) = setup().await;
        repo.enqueue(&item(user, WorkKind::Full, "page-1")).await.unwrap();
        let claimed = repo
            .claim_batch("worker-dead", 1, Duration::seconds(-1))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let swept = repo.sweep_expired_leases().await.unwrap();
        assert_eq!(swept, 1);

        // Reclaimable by another worker; the dead worker cannot complete it
        let reclaimed = repo
            .claim_batch("worker-b", 1, Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        let err = repo.complete(&claimed[0].id, "worker-dead").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        repo.complete(&claimed[0].id, "worker-b").await.unwrap();
    }

    #[tokio::test]
    async fn test_done_item_allows_reenqueue() {
        let (repo, user) = setup().await;
        repo.enqueue(&item(user, WorkKind::Full, "page-1")).await.unwrap();
        let claimed = repo
            .claim_batch("worker-a", 1, Duration::seconds(60))
            .await
            .unwrap();
        repo.complete(&claimed[0].id, "worker-a").await.unwrap();

        // Terminal rows don't block a fresh open item for the same target
        assert!(repo.enqueue(&item(user, WorkKind::Full, "page-1")).await.unwrap());
    }
}
