//! Cross-repository transactional steps
//!
//! The ingestion commit rule: either the page reaches its final status and
//! its work items (if any) are queued, or neither happens. This module owns
//! the multi-table transactions that enforce it; single-table operations
//! stay in their repositories.

use sqlx::SqlitePool;
use tracing::debug;

use inkmirror_core::domain::newtypes::{PageUuid, UserId};
use inkmirror_core::domain::WorkItem;

use crate::time::fmt_ts;
use crate::StoreError;

/// Marks a page's OCR as completed and enqueues its sync work in one
/// transaction
///
/// The page update is conditional on `pending`; losing that race rolls the
/// whole transaction back, so no work item is ever queued for a page that
/// did not actually complete. Work items deduplicate against open items
/// exactly as [`WorkQueueRepository::enqueue`](crate::work_queue::WorkQueueRepository::enqueue)
/// does.
pub async fn complete_ocr_and_enqueue(
    pool: &SqlitePool,
    user_id: &UserId,
    page_uuid: &PageUuid,
    text: &str,
    confidence: f64,
    work: &[WorkItem],
) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        "UPDATE pages SET ocr_status = 'completed', ocr_text = ?, ocr_confidence = ?, \
         updated_at = ? WHERE user_id = ? AND page_uuid = ? AND ocr_status = 'pending'",
    )
    .bind(text)
    .bind(confidence)
    .bind(fmt_ts(chrono::Utc::now()))
    .bind(user_id.to_string())
    .bind(page_uuid.to_string())
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Conflict(format!(
            "page {page_uuid} was not pending"
        )));
    }

    for item in work {
        let destinations = serde_json::to_string(&item.destinations)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        sqlx::query(
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
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    debug!(page = %page_uuid, work_items = work.len(), "Completed OCR and enqueued sync work");
    Ok(())
}
