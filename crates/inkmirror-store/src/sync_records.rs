//! Sync record repository
//!
//! The deduplication source of truth for external objects. The primary key
//! `(user_id, page_uuid, destination)` arbitrates insert races between
//! concurrent workers: the loser of a race gets `InsertOutcome::Lost` with
//! the winning row and finishes as a no-op or an update.

use std::str::FromStr;

use sqlx::{Row, SqlitePool};
use tracing::debug;

use inkmirror_core::domain::newtypes::{
    ContentHash, DestinationName, ExternalId, NotebookUuid, PageUuid, UserId,
};
use inkmirror_core::domain::{SyncItemKind, SyncRecord, SyncRecordStatus};

use crate::time::{fmt_ts, parse_ts};
use crate::StoreError;

/// Scope key under which a notebook's container record is stored
///
/// Container records reuse the notebook UUID in the page position of the
/// unique key, so one table serves both kinds without colliding.
pub fn container_scope(notebook_uuid: &NotebookUuid) -> PageUuid {
    PageUuid::from_uuid(*notebook_uuid.as_uuid())
}

/// Result of attempting to insert a new sync record
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// This caller's row landed
    Inserted,
    /// A concurrent caller inserted first; here is the winning row
    Lost(SyncRecord),
}

/// Repository for sync records
pub struct SyncRecordRepository {
    pool: SqlitePool,
}

impl SyncRecordRepository {
    /// Creates a new repository instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Attempts to insert a new record, detecting concurrent-insert races
    ///
    /// Uses `ON CONFLICT DO NOTHING` on the `(user, page, destination)` key;
    /// when zero rows land, the winning row is fetched and returned so the
    /// caller can continue as an update/no-op.
    pub async fn try_insert(&self, record: &SyncRecord) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            "INSERT INTO sync_records \
             (user_id, page_uuid, destination, item_kind, external_id, content_hash, \
              status, error, retry_count, synced_at, metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (user_id, page_uuid, destination) DO NOTHING",
        )
        .bind(record.user_id.to_string())
        .bind(record.page_uuid.to_string())
        .bind(record.destination.as_str())
        .bind(record.item_kind.as_str())
        .bind(record.external_id.as_str())
        .bind(record.content_hash.as_ref().map(|h| h.as_str().to_string()))
        .bind(record.status.as_str())
        .bind(record.error.clone())
        .bind(record.retry_count)
        .bind(fmt_ts(record.synced_at))
        .bind(
            record
                .metadata
                .as_ref()
                .map(|m| m.to_string()),
        )
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            debug!(
                page = %record.page_uuid,
                destination = %record.destination,
                "Sync record inserted"
            );
            return Ok(InsertOutcome::Inserted);
        }

        let winner = self
            .get(&record.user_id, &record.page_uuid, &record.destination)
            .await?
            .ok_or_else(|| {
                StoreError::Conflict(format!(
                    "insert for page {} lost but no winning row found",
                    record.page_uuid
                ))
            })?;
        Ok(InsertOutcome::Lost(winner))
    }

    /// Fetches one record by its unique key
    pub async fn get(
        &self,
        user_id: &UserId,
        page_uuid: &PageUuid,
        destination: &DestinationName,
    ) -> Result<Option<SyncRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM sync_records \
             WHERE user_id = ? AND page_uuid = ? AND destination = ?",
        )
        .bind(user_id.to_string())
        .bind(page_uuid.to_string())
        .bind(destination.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::map_record(&r)).transpose()
    }

    /// Fetches a notebook's container record for a destination, if any
    pub async fn get_container(
        &self,
        user_id: &UserId,
        notebook_uuid: &NotebookUuid,
        destination: &DestinationName,
    ) -> Result<Option<SyncRecord>, StoreError> {
        self.get(user_id, &container_scope(notebook_uuid), destination)
            .await
    }

    /// Returns true if the notebook has ever been synced to any destination
    ///
    /// Metadata-only ingestion uses this to decide between enqueueing and
    /// returning `SKIPPED`.
    pub async fn notebook_has_container(
        &self,
        user_id: &UserId,
        notebook_uuid: &NotebookUuid,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM sync_records \
             WHERE user_id = ? AND page_uuid = ? AND item_kind = 'notebook_container'",
        )
        .bind(user_id.to_string())
        .bind(container_scope(notebook_uuid).to_string())
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n > 0)
    }

    /// Returns true if the user has any container record at all
    ///
    /// The initial-sync endpoint treats this as "already initialized".
    pub async fn user_has_any_container(&self, user_id: &UserId) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM sync_records \
             WHERE user_id = ? AND item_kind = 'notebook_container'",
        )
        .bind(user_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n > 0)
    }

    /// Records a successful (re-)sync: hash, timestamp, cleared error
    pub async fn mark_synced(
        &self,
        user_id: &UserId,
        page_uuid: &PageUuid,
        destination: &DestinationName,
        hash: &ContentHash,
        metadata: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sync_records SET content_hash = ?, status = 'success', error = NULL, \
             synced_at = ?, metadata = COALESCE(?, metadata) \
             WHERE user_id = ? AND page_uuid = ? AND destination = ?",
        )
        .bind(hash.as_str())
        .bind(fmt_ts(chrono::Utc::now()))
        .bind(metadata.map(|m| m.to_string()))
        .bind(user_id.to_string())
        .bind(page_uuid.to_string())
        .bind(destination.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "sync record for page {page_uuid} at {destination}"
            )));
        }
        Ok(())
    }

    /// Records a failed attempt
    pub async fn mark_failed(
        &self,
        user_id: &UserId,
        page_uuid: &PageUuid,
        destination: &DestinationName,
        error: &str,
        retryable: bool,
    ) -> Result<(), StoreError> {
        let status = if retryable {
            SyncRecordStatus::Retry
        } else {
            SyncRecordStatus::Failed
        };
        sqlx::query(
            "UPDATE sync_records SET status = ?, error = ?, retry_count = retry_count + 1 \
             WHERE user_id = ? AND page_uuid = ? AND destination = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(user_id.to_string())
        .bind(page_uuid.to_string())
        .bind(destination.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletes a record (the external object was archived or deleted)
    pub async fn delete(
        &self,
        user_id: &UserId,
        page_uuid: &PageUuid,
        destination: &DestinationName,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM sync_records WHERE user_id = ? AND page_uuid = ? AND destination = ?",
        )
        .bind(user_id.to_string())
        .bind(page_uuid.to_string())
        .bind(destination.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn map_record(row: &sqlx::sqlite::SqliteRow) -> Result<SyncRecord, StoreError> {
        let user_id: String = row.try_get("user_id")?;
        let page_uuid: String = row.try_get("page_uuid")?;
        let destination: String = row.try_get("destination")?;
        let item_kind: String = row.try_get("item_kind")?;
        let external_id: String = row.try_get("external_id")?;
        let content_hash: Option<String> = row.try_get("content_hash")?;
        let status: String = row.try_get("status")?;
        let error: Option<String> = row.try_get("error")?;
        let retry_count: i32 = row.try_get("retry_count")?;
        let synced_at: String = row.try_get("synced_at")?;
        let metadata: Option<String> = row.try_get("metadata")?;

        Ok(SyncRecord {
            user_id: UserId::from_str(&user_id)?,
            page_uuid: PageUuid::from_str(&page_uuid)?,
            destination: DestinationName::new(destination)?,
            item_kind: SyncItemKind::parse(&item_kind)?,
            external_id: ExternalId::new(external_id)?,
            content_hash: content_hash.map(ContentHash::new).transpose()?,
            status: SyncRecordStatus::parse(&status)?,
            error,
            retry_count,
            synced_at: parse_ts(&synced_at)?,
            metadata: metadata
                .map(|m| {
                    serde_json::from_str(&m).map_err(|e| {
                        StoreError::SerializationError(format!("Invalid metadata JSON: {e}"))
                    })
                })
                .transpose()?,
        })
    }
}
