//! Page repository
//!
//! Persistent per-page rows with the OCR status machine. Every status
//! change goes through a conditional UPDATE keyed on the current status and
//! checked by affected-row count, so the machine stays linearizable per page
//! even with the ingestion service, sync workers, and the retroactive
//! processor mutating concurrently.

use std::str::FromStr;

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use inkmirror_core::domain::newtypes::{ContentHash, NotebookUuid, ObjectKey, PageUuid, UserId};
use inkmirror_core::domain::{OcrStatus, Page};

use crate::time::{fmt_ts, parse_ts};
use crate::StoreError;

/// Repository for page rows
pub struct PageRepository {
    pool: SqlitePool,
}

impl PageRepository {
    /// Creates a new repository instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetches a page, or inserts a fresh `not_synced` row if none exists
    pub async fn find_or_create(
        &self,
        user_id: &UserId,
        notebook_uuid: &NotebookUuid,
        page_uuid: &PageUuid,
        page_number: i32,
    ) -> Result<Page, StoreError> {
        if let Some(page) = self.get(user_id, notebook_uuid, page_uuid).await? {
            return Ok(page);
        }

        let page = Page::new(*user_id, *notebook_uuid, *page_uuid, page_number);
        sqlx::query(
            "INSERT INTO pages \
             (user_id, notebook_uuid, page_uuid, page_number, ocr_status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (user_id, notebook_uuid, page_uuid) DO NOTHING",
        )
        .bind(user_id.to_string())
        .bind(notebook_uuid.to_string())
        .bind(page_uuid.to_string())
        .bind(page_number)
        .bind(page.ocr_status().as_str())
        .bind(fmt_ts(page.created_at()))
        .bind(fmt_ts(page.updated_at()))
        .execute(&self.pool)
        .await?;

        // A concurrent insert may have won; return whatever is in the table.
        self.get(user_id, notebook_uuid, page_uuid)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("page {page_uuid}")))
    }

    /// Fetches a page by its full key
    pub async fn get(
        &self,
        user_id: &UserId,
        notebook_uuid: &NotebookUuid,
        page_uuid: &PageUuid,
    ) -> Result<Option<Page>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM pages WHERE user_id = ? AND notebook_uuid = ? AND page_uuid = ?",
        )
        .bind(user_id.to_string())
        .bind(notebook_uuid.to_string())
        .bind(page_uuid.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::map_page(&r)).transpose()
    }

    /// Fetches a page by user and page UUID alone (work items carry only the
    /// page UUID as their target)
    pub async fn get_by_uuid(
        &self,
        user_id: &UserId,
        page_uuid: &PageUuid,
    ) -> Result<Option<Page>, StoreError> {
        let row = sqlx::query("SELECT * FROM pages WHERE user_id = ? AND page_uuid = ?")
            .bind(user_id.to_string())
            .bind(page_uuid.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::map_page(&r)).transpose()
    }

    /// Lists a notebook's pages in page order
    pub async fn list_for_notebook(
        &self,
        user_id: &UserId,
        notebook_uuid: &NotebookUuid,
    ) -> Result<Vec<Page>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM pages WHERE user_id = ? AND notebook_uuid = ? ORDER BY page_number",
        )
        .bind(user_id.to_string())
        .bind(notebook_uuid.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::map_page).collect()
    }

    /// Records the stored blob keys and the source-content hash
    pub async fn record_upload(
        &self,
        user_id: &UserId,
        page_uuid: &PageUuid,
        hash: &ContentHash,
        source_key: &ObjectKey,
        pdf_key: &ObjectKey,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE pages SET content_hash = ?, source_key = ?, pdf_key = ?, updated_at = ? \
             WHERE user_id = ? AND page_uuid = ?",
        )
        .bind(hash.as_str())
        .bind(source_key.as_str())
        .bind(pdf_key.as_str())
        .bind(fmt_ts(Utc::now()))
        .bind(user_id.to_string())
        .bind(page_uuid.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("page {page_uuid}")));
        }
        Ok(())
    }

    /// Conditionally transitions a page's OCR status
    ///
    /// Returns `Conflict` when the page was not in `from` at write time,
    /// which callers use to detect lost races.
    pub async fn transition(
        &self,
        user_id: &UserId,
        page_uuid: &PageUuid,
        from: OcrStatus,
        to: OcrStatus,
    ) -> Result<(), StoreError> {
        if !from.can_transition_to(to) {
            return Err(StoreError::Conflict(format!(
                "transition {from} -> {to} not permitted"
            )));
        }

        let result = sqlx::query(
            "UPDATE pages SET ocr_status = ?, updated_at = ? \
             WHERE user_id = ? AND page_uuid = ? AND ocr_status = ?",
        )
        .bind(to.as_str())
        .bind(fmt_ts(Utc::now()))
        .bind(user_id.to_string())
        .bind(page_uuid.to_string())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "page {page_uuid} was not in status {from}"
            )));
        }

        debug!(page = %page_uuid, %from, %to, "Page status transition");
        Ok(())
    }

    /// Marks OCR success: text, confidence, and `completed` in one update,
    /// conditional on the page still being `pending`
    pub async fn complete_ocr(
        &self,
        user_id: &UserId,
        page_uuid: &PageUuid,
        text: &str,
        confidence: f64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE pages SET ocr_status = 'completed', ocr_text = ?, ocr_confidence = ?, \
             updated_at = ? WHERE user_id = ? AND page_uuid = ? AND ocr_status = 'pending'",
        )
        .bind(text)
        .bind(confidence)
        .bind(fmt_ts(Utc::now()))
        .bind(user_id.to_string())
        .bind(page_uuid.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "page {page_uuid} was not pending"
            )));
        }
        Ok(())
    }

    /// Counts a user's deferred pages (the `pending_quota` anti-abuse cap)
    pub async fn count_pending_quota(&self, user_id: &UserId) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM pages WHERE user_id = ? AND ocr_status = 'pending_quota'",
        )
        .bind(user_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    /// Claims up to `limit` deferred pages, newest first, transitioning each
    /// `pending_quota -> pending`
    ///
    /// The per-row conditional update makes the claim race-free against
    /// concurrent uploads: a page that left `pending_quota` between the
    /// select and the update is skipped, and the next candidate is taken.
    pub async fn claim_deferred(
        &self,
        user_id: &UserId,
        limit: i64,
    ) -> Result<Vec<Page>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM pages WHERE user_id = ? AND ocr_status = 'pending_quota' \
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(user_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::new();
        for row in &rows {
            let page = Self::map_page(row)?;
            match self
                .transition(
                    user_id,
                    page.page_uuid(),
                    OcrStatus::PendingQuota,
                    OcrStatus::Pending,
                )
                .await
            {
                Ok(()) => claimed.push(page),
                Err(StoreError::Conflict(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(claimed)
    }

    fn map_page(row: &sqlx::sqlite::SqliteRow) -> Result<Page, StoreError> {
        let user_id: String = row.try_get("user_id")?;
        let notebook_uuid: String = row.try_get("notebook_uuid")?;
        let page_uuid: String = row.try_get("page_uuid")?;
        let page_number: i32 = row.try_get("page_number")?;
        let content_hash: Option<String> = row.try_get("content_hash")?;
        let ocr_status: String = row.try_get("ocr_status")?;
        let ocr_text: Option<String> = row.try_get("ocr_text")?;
        let ocr_confidence: Option<f64> = row.try_get("ocr_confidence")?;
        let pdf_key: Option<String> = row.try_get("pdf_key")?;
        let source_key: Option<String> = row.try_get("source_key")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Page::from_parts(
            UserId::from_str(&user_id)?,
            NotebookUuid::from_str(&notebook_uuid)?,
            PageUuid::from_str(&page_uuid)?,
            page_number,
            content_hash.map(ContentHash::new).transpose()?,
            OcrStatus::parse(&ocr_status)?,
            ocr_text,
            ocr_confidence,
            pdf_key.map(ObjectKey::new).transpose()?,
            source_key.map(ObjectKey::new).transpose()?,
            parse_ts(&created_at)?,
            parse_ts(&updated_at)?,
        )
        .map_err(StoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notebooks::NotebookRepository;
    use crate::users::UserRepository;
    use crate::DatabasePool;
    use inkmirror_core::domain::Notebook;

    async fn setup() -> (PageRepository, UserId, NotebookUuid) {
        let db = DatabasePool::in_memory().await.unwrap();
        let users = UserRepository::new(db.pool().clone());
        let user = users.find_or_create("oauth|pages").await.unwrap();
        let notebooks = NotebookRepository::new(db.pool().clone());
        let nb = Notebook::new(user.id, NotebookUuid::new(), "test");
        notebooks.upsert(&nb).await.unwrap();
        (
            PageRepository::new(db.pool().clone()),
            user.id,
            nb.notebook_uuid,
        )
    }

    fn hash(c: char) -> ContentHash {
        ContentHash::new(c.to_string().repeat(64)).unwrap()
    }

    #[tokio::test]
    async fn test_find_or_create_idempotent() {
        let (repo, user, nb) = setup().await;
        let page_uuid = PageUuid::new();
        let a = repo.find_or_create(&user, &nb, &page_uuid, 1).await.unwrap();
        let b = repo.find_or_create(&user, &nb, &page_uuid, 1).await.unwrap();
        assert_eq!(a.page_uuid(), b.page_uuid());
        assert_eq!(a.ocr_status(), OcrStatus::NotSynced);
    }

    #[tokio::test]
    async fn test_transition_conditional() {
        let (repo, user, nb) = setup().await;
        let page_uuid = PageUuid::new();
        repo.find_or_create(&user, &nb, &page_uuid, 1).await.unwrap();

        repo.transition(&user, &page_uuid, OcrStatus::NotSynced, OcrStatus::Pending)
            .await
            .unwrap();

        // A second identical transition loses the race
        let err = repo
            .transition(&user, &page_uuid, OcrStatus::NotSynced, OcrStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_transition_rejects_illegal_edge() {
        let (repo, user, nb) = setup().await;
        let page_uuid = PageUuid::new();
        repo.find_or_create(&user, &nb, &page_uuid, 1).await.unwrap();
        let err = repo
            .transition(&user, &page_uuid, OcrStatus::NotSynced, OcrStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_complete_ocr_requires_pending() {
        let (repo, user, nb) = setup().await;
        let page_uuid = PageUuid::new();
        repo.find_or_create(&user, &nb, &page_uuid, 1).await.unwrap();

        let err = repo
            .complete_ocr(&user, &page_uuid, "text", 0.9)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        repo.transition(&user, &page_uuid, OcrStatus::NotSynced, OcrStatus::Pending)
            .await
            .unwrap();
        repo.complete_ocr(&user, &page_uuid, "hello", 0.93).await.unwrap();

        let page = repo.get_by_uuid(&user, &page_uuid).await.unwrap().unwrap();
        assert_eq!(page.ocr_status(), OcrStatus::Completed);
        assert_eq!(page.ocr_text(), Some("hello"));
    }

    #[tokio::test]
    async fn test_record_upload_and_hash_lookup() {
        let (repo, user, nb) = setup().await;
        let page_uuid = PageUuid::new();
        repo.find_or_create(&user, &nb, &page_uuid, 1).await.unwrap();

        let src = ObjectKey::page_source(&user, &page_uuid);
        let pdf = ObjectKey::page_pdf(&user, &page_uuid);
        repo.record_upload(&user, &page_uuid, &hash('a'), &src, &pdf)
            .await
            .unwrap();

        let page = repo.get_by_uuid(&user, &page_uuid).await.unwrap().unwrap();
        assert!(page.matches_hash(&hash('a')));
        assert_eq!(page.pdf_key(), Some(&pdf));
    }

    #[tokio::test]
    async fn test_claim_deferred_newest_first_and_bounded() {
        let (repo, user, nb) = setup().await;

        // Five deferred pages with strictly increasing created_at
        let mut uuids = Vec::new();
        for i in 0..5 {
            let page_uuid = PageUuid::new();
            repo.find_or_create(&user, &nb, &page_uuid, i).await.unwrap();
            let src = ObjectKey::page_source(&user, &page_uuid);
            let pdf = ObjectKey::page_pdf(&user, &page_uuid);
            repo.record_upload(&user, &page_uuid, &hash('a'), &src, &pdf)
                .await
                .unwrap();
            repo.transition(&user, &page_uuid, OcrStatus::NotSynced, OcrStatus::PendingQuota)
                .await
                .unwrap();
            // Distinct created_at values for deterministic ordering
            sqlx::query("UPDATE pages SET created_at = ? WHERE page_uuid = ?")
                .bind(format!("2026-01-0{}T00:00:00.000000Z", i + 1))
                .bind(page_uuid.to_string())
                .execute(&repo.pool)
                .await
                .unwrap();
            uuids.push(page_uuid);
        }

        assert_eq!(repo.count_pending_quota(&user).await.unwrap(), 5);

        let claimed = repo.claim_deferred(&user, 3).await.unwrap();
        assert_eq!(claimed.len(), 3);
        // Newest first: pages 5, 4, 3
        assert_eq!(claimed[0].page_uuid(), &uuids[4]);
        assert_eq!(claimed[1].page_uuid(), &uuids[3]);
        assert_eq!(claimed[2].page_uuid(), &uuids[2]);

        // The two oldest stay deferred
        assert_eq!(repo.count_pending_quota(&user).await.unwrap(), 2);
        for page in &claimed {
            let reloaded = repo
                .get_by_uuid(&user, page.page_uuid())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(reloaded.ocr_status(), OcrStatus::Pending);
        }
    }
}
