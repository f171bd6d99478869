//! Ingestion service
//!
//! Accepts page uploads from the device agent, enforces quota policy,
//! invokes OCR, updates the page store, and enqueues sync work.
//!
//! ## Upload flow
//!
//! 1. Hash the source bytes; short-circuit on a hash hit for a completed
//!    page (no OCR, no quota, cached text returned)
//! 2. Store the source and rendered-PDF blobs
//! 3. With quota headroom: transition to `pending`, run OCR, debit the
//!    ledger for the reported page count (OCR first, then debit, so an
//!    aborted call never charges), complete the page and enqueue sync work
//!    in one transaction
//! 4. Without headroom: transition to `pending_quota` and return the
//!    accepted-but-deferred response; no OCR, no debit, no sync work
//!
//! No database transaction is ever held across the OCR call.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use inkmirror_core::domain::newtypes::{NotebookUuid, ObjectKey, PageUuid};
use inkmirror_core::domain::{
    DestinationSelector, Notebook, OcrStatus, QuotaCheck, QuotaKind, WorkItem, WorkKind,
};
use inkmirror_core::fingerprint::fingerprint_source_blob;
use inkmirror_core::ports::{ObjectStore as _, OcrEngine as _, OcrError};
use inkmirror_store::pipeline::complete_ocr_and_enqueue;
use inkmirror_store::users::UserRecord;
use inkmirror_store::StoreError;

use crate::state::AppState;

/// Transient-OCR retry attempts inside one upload request
const OCR_ATTEMPTS: u32 = 3;

/// One page upload from the device agent
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Notebook the page belongs to
    pub notebook_uuid: NotebookUuid,
    /// The page being uploaded
    pub page_uuid: PageUuid,
    /// Position within the notebook
    pub page_number: i32,
    /// Notebook display name, when the manifest was included
    pub visible_name: Option<String>,
    /// Raw device file bytes
    pub source: Vec<u8>,
    /// Rendered PDF, when the agent rendered one; source bytes are used
    /// for OCR otherwise
    pub pdf: Option<Vec<u8>>,
}

/// Result of an accepted upload
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    /// OCR ran (or had already run); transcription available
    Completed {
        /// Transcribed text
        text: String,
        /// OCR confidence
        confidence: f64,
        /// Pages billed
        page_count: i64,
        /// True when the stored transcription was returned without OCR
        cached: bool,
    },
    /// Accepted, blob stored, OCR deferred until the quota resets
    Deferred {
        /// The user's deferred-page count after this upload
        pending_quota_pages: i64,
    },
    /// OCR failed permanently; the page is marked `failed`
    OcrFailed {
        /// Provider error description
        error: String,
    },
}

/// Result of a metadata-only ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataOutcome {
    /// Notebook has never been synced anywhere; nothing to do
    Skipped,
    /// A metadata work item was enqueued
    Queued,
}

/// Ingestion failures that surface to the API layer
#[derive(Debug, Error)]
pub enum IngestError {
    /// The per-user deferred-page cap was hit
    #[error("Too many pages awaiting quota: {0} deferred")]
    TooManyPending(i64),
    /// The upload exceeds the configured size limit
    #[error("Upload of {0} bytes exceeds the limit")]
    UploadTooLarge(u64),
    /// The referenced notebook does not exist
    #[error("Unknown notebook: {0}")]
    UnknownNotebook(NotebookUuid),
    /// Initial sync was already performed
    #[error("Sync already initialized")]
    AlreadyInitialized,
    /// Storage failure
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Anything else
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// The ingestion service (C9)
pub struct IngestionService {
    state: AppState,
}

impl IngestionService {
    /// Creates the service over shared state
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Handles one page upload end to end
    #[tracing::instrument(skip(self, request), fields(user = %user.id, page = %request.page_uuid))]
    pub async fn handle_upload(
        &self,
        user: &UserRecord,
        request: UploadRequest,
    ) -> Result<UploadOutcome, IngestError> {
        let started = Instant::now();
        let source_len = request.source.len() as u64;
        if source_len > self.state.config.ingestion.max_upload_bytes {
            return Err(IngestError::UploadTooLarge(source_len));
        }

        let hash = fingerprint_source_blob(&request.source);

        // Make sure the notebook row exists before touching pages
        if self
            .state
            .notebooks
            .get(&user.id, &request.notebook_uuid)
            .await?
            .is_none()
        {
            let name = request
                .visible_name
                .clone()
                .unwrap_or_else(|| "Untitled".to_string());
            self.state
                .notebooks
                .upsert(&Notebook::new(user.id, request.notebook_uuid, name))
                .await?;
        }

        let page = self
            .state
            .pages
            .find_or_create(
                &user.id,
                &request.notebook_uuid,
                &request.page_uuid,
                request.page_number,
            )
            .await?;

        // Hash hit on a completed page: return the stored transcription,
        // consume nothing
        if page.matches_hash(&hash) && page.ocr_status() == OcrStatus::Completed {
            debug!("Upload is a hash hit on a completed page");
            self.state.metrics.record_upload("hash_hit", source_len);
            return Ok(UploadOutcome::Completed {
                text: page.ocr_text().unwrap_or_default().to_string(),
                confidence: page.ocr_confidence().unwrap_or(0.0),
                page_count: 0,
                cached: true,
            });
        }

        // Store blobs before any quota decision: pending_quota pages must
        // already have their content persisted
        let source_key = ObjectKey::page_source(&user.id, &request.page_uuid);
        let pdf_key = ObjectKey::page_pdf(&user.id, &request.page_uuid);
        let pdf_bytes = request.pdf.as_deref().unwrap_or(&request.source);
        self.state.object_store.put(&source_key, &request.source).await?;
        self.state.object_store.put(&pdf_key, pdf_bytes).await?;
        self.state
            .pages
            .record_upload(&user.id, &request.page_uuid, &hash, &source_key, &pdf_key)
            .await?;

        self.state
            .quota
            .ensure_ledger(&user.id, QuotaKind::OcrPages, user.tier.ocr_page_limit())
            .await?;

        match self
            .state
            .quota
            .check(&user.id, QuotaKind::OcrPages, 1)
            .await?
        {
            QuotaCheck::Ok | QuotaCheck::Partial(_) => {
                let outcome = self
                    .run_ocr_pipeline(user, &request, &hash, pdf_bytes.to_vec())
                    .await?;
                let duration_ms = started.elapsed().as_millis() as u64;
                info!(
                    duration_ms,
                    bytes = source_len,
                    outcome = ?std::mem::discriminant(&outcome),
                    "Upload processed"
                );
                Ok(outcome)
            }
            QuotaCheck::Exhausted => {
                let outcome = self.defer_upload(user, &request, source_len).await?;
                let duration_ms = started.elapsed().as_millis() as u64;
                info!(duration_ms, bytes = source_len, "Upload deferred (quota exhausted)");
                Ok(outcome)
            }
        }
    }

    /// OCR path: transition to pending, extract, debit, complete + enqueue
    async fn run_ocr_pipeline(
        &self,
        user: &UserRecord,
        request: &UploadRequest,
        hash: &inkmirror_core::domain::newtypes::ContentHash,
        pdf_bytes: Vec<u8>,
    ) -> Result<UploadOutcome, IngestError> {
        let page = self
            .state
            .pages
            .get_by_uuid(&user.id, &request.page_uuid)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("page {}", request.page_uuid)))?;

        match page.ocr_status() {
            OcrStatus::Pending => {
                // Another request already has OCR in flight for this page
            }
            status => {
                self.state
                    .pages
                    .transition(&user.id, &request.page_uuid, status, OcrStatus::Pending)
                    .await?;
            }
        }

        // OCR first, then debit: an aborted extraction never charges
        let ocr_started = Instant::now();
        let extraction = match self.extract_with_retry(&pdf_bytes).await {
            Ok(extraction) => {
                self.state
                    .metrics
                    .record_ocr("success", ocr_started.elapsed().as_secs_f64());
                extraction
            }
            Err(err) => {
                let outcome_label = if err.is_retryable() {
                    "transient_error"
                } else {
                    "permanent_error"
                };
                self.state
                    .metrics
                    .record_ocr(outcome_label, ocr_started.elapsed().as_secs_f64());
                warn!(error = %err, "OCR failed, marking page failed");
                self.state
                    .pages
                    .transition(
                        &user.id,
                        &request.page_uuid,
                        OcrStatus::Pending,
                        OcrStatus::Failed,
                    )
                    .await?;
                self.state.metrics.record_upload("ocr_failed", 0);
                return Ok(UploadOutcome::OcrFailed {
                    error: err.to_string(),
                });
            }
        };

        match self
            .state
            .quota
            .consume(&user.id, QuotaKind::OcrPages, extraction.page_count)
            .await
        {
            Ok(receipt) => {
                self.state
                    .metrics
                    .record_quota_consumed(receipt.consumed as u64);
            }
            Err(StoreError::Conflict(msg)) => {
                // The checked headroom raced away between check and debit.
                // The extraction already happened; keep the result and let
                // the ledger stay at its cap rather than discard paid work.
                warn!(%msg, "Quota consume lost a race after successful OCR");
            }
            Err(err) => return Err(err.into()),
        }

        let mut work = vec![WorkItem::new(
            user.id,
            WorkKind::Full,
            request.page_uuid.to_string(),
            DestinationSelector::All,
        )
        .with_hash_snapshot(hash.clone())];

        // Containers are created by dedicated priority-0 items so Phase 1
        // stays serialized per user
        if !self
            .state
            .sync_records
            .notebook_has_container(&user.id, &request.notebook_uuid)
            .await?
        {
            work.push(WorkItem::new(
                user.id,
                WorkKind::Container,
                request.notebook_uuid.to_string(),
                DestinationSelector::All,
            ));
        }

        complete_ocr_and_enqueue(
            self.state.db.pool(),
            &user.id,
            &request.page_uuid,
            &extraction.text,
            extraction.confidence,
            &work,
        )
        .await?;

        self.state
            .metrics
            .record_upload("completed", request.source.len() as u64);

        Ok(UploadOutcome::Completed {
            text: extraction.text,
            confidence: extraction.confidence,
            page_count: extraction.page_count,
            cached: false,
        })
    }

    /// Deferral path: park the page, enforcing the pending cap only when
    /// the page would actually enter the deferred set
    async fn defer_upload(
        &self,
        user: &UserRecord,
        request: &UploadRequest,
        source_len: u64,
    ) -> Result<UploadOutcome, IngestError> {
        let page = self
            .state
            .pages
            .get_by_uuid(&user.id, &request.page_uuid)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("page {}", request.page_uuid)))?;

        match page.ocr_status() {
            // Already parked, or OCR already in flight from a concurrent
            // upload; the deferred set does not grow, so the cap does not
            // apply and there is nothing further to do
            OcrStatus::PendingQuota | OcrStatus::Pending => {}
            status => {
                let pending = self.state.pages.count_pending_quota(&user.id).await?;
                if pending >= self.state.config.ingestion.max_pending_quota_pages {
                    self.state.metrics.record_upload("rejected", 0);
                    return Err(IngestError::TooManyPending(pending));
                }
                self.state
                    .pages
                    .transition(&user.id, &request.page_uuid, status, OcrStatus::PendingQuota)
                    .await?;
            }
        }

        self.state.metrics.record_upload("pending_quota", source_len);
        let pending_now = self.state.pages.count_pending_quota(&user.id).await?;
        Ok(UploadOutcome::Deferred {
            pending_quota_pages: pending_now,
        })
    }

    async fn extract_with_retry(
        &self,
        pdf_bytes: &[u8],
    ) -> Result<inkmirror_core::ports::OcrExtraction, OcrError> {
        let mut last_err = None;
        for attempt in 0..OCR_ATTEMPTS {
            match self.state.ocr.extract(pdf_bytes).await {
                Ok(extraction) => return Ok(extraction),
                Err(err) if err.is_retryable() && attempt + 1 < OCR_ATTEMPTS => {
                    let delay = Duration::from_secs(1 << attempt);
                    warn!(attempt, delay_secs = delay.as_secs(), error = %err, "Transient OCR error, retrying");
                    tokio::time::sleep(delay).await;
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| OcrError::Transient("retries exhausted".to_string())))
    }

    // ========================================================================
    // Metadata-only ingestion
    // ========================================================================

    /// Handles a notebook property change without content
    ///
    /// Never touches the quota. A notebook that has never been synced to any
    /// destination yields `Skipped` with no side effects.
    #[tracing::instrument(skip(self), fields(user = %user.id, notebook = %notebook_uuid))]
    pub async fn handle_metadata_update(
        &self,
        user: &UserRecord,
        notebook_uuid: NotebookUuid,
        visible_name: Option<String>,
        last_modified: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<MetadataOutcome, IngestError> {
        let Some(mut notebook) = self.state.notebooks.get(&user.id, &notebook_uuid).await? else {
            debug!("Metadata update for unknown notebook, skipping");
            return Ok(MetadataOutcome::Skipped);
        };

        if let Some(name) = visible_name {
            notebook.visible_name = name;
        }
        if let Some(modified) = last_modified {
            notebook.last_modified = modified;
        }
        self.state.notebooks.upsert(&notebook).await?;

        if !self
            .state
            .sync_records
            .notebook_has_container(&user.id, &notebook_uuid)
            .await?
        {
            debug!("Notebook never synced to a destination, skipping metadata sync");
            return Ok(MetadataOutcome::Skipped);
        }

        self.state
            .work_queue
            .enqueue(&WorkItem::new(
                user.id,
                WorkKind::Metadata,
                notebook_uuid.to_string(),
                DestinationSelector::All,
            ))
            .await?;

        Ok(MetadataOutcome::Queued)
    }

    // ========================================================================
    // Sync bootstrap
    // ========================================================================

    /// Queues the two-phase initial sync: container items for every
    /// notebook, full items for every completed page (up to `page_limit`)
    ///
    /// Returns `(notebooks_queued, pages_queued)`.
    pub async fn handle_initial_sync(
        &self,
        user: &UserRecord,
        page_limit: Option<i64>,
        force: bool,
    ) -> Result<(usize, usize), IngestError> {
        if !force
            && self
                .state
                .sync_records
                .user_has_any_container(&user.id)
                .await?
        {
            return Err(IngestError::AlreadyInitialized);
        }

        let notebooks = self.state.notebooks.list(&user.id).await?;
        let mut notebooks_queued = 0;
        let mut pages_queued = 0;
        let limit = page_limit.unwrap_or(i64::MAX);

        for notebook in &notebooks {
            let pages = self
                .state
                .pages
                .list_for_notebook(&user.id, &notebook.notebook_uuid)
                .await?;
            let completed: Vec<_> = pages
                .iter()
                .filter(|p| p.ocr_status() == OcrStatus::Completed)
                .collect();
            if completed.is_empty() {
                continue;
            }

            if self
                .state
                .work_queue
                .enqueue(&WorkItem::new(
                    user.id,
                    WorkKind::Container,
                    notebook.notebook_uuid.to_string(),
                    DestinationSelector::All,
                ))
                .await?
            {
                notebooks_queued += 1;
            }

            for page in completed {
                if pages_queued as i64 >= limit {
                    break;
                }
                let mut item = WorkItem::new(
                    user.id,
                    WorkKind::Full,
                    page.page_uuid().to_string(),
                    DestinationSelector::All,
                );
                if let Some(hash) = page.content_hash() {
                    item = item.with_hash_snapshot(hash.clone());
                }
                if self.state.work_queue.enqueue(&item).await? {
                    pages_queued += 1;
                }
            }
        }

        info!(notebooks_queued, pages_queued, "Initial sync queued");
        Ok((notebooks_queued, pages_queued))
    }

    /// Queues one notebook for a full sync
    pub async fn handle_notebook_sync(
        &self,
        user: &UserRecord,
        notebook_uuid: NotebookUuid,
    ) -> Result<usize, IngestError> {
        if self
            .state
            .notebooks
            .get(&user.id, &notebook_uuid)
            .await?
            .is_none()
        {
            return Err(IngestError::UnknownNotebook(notebook_uuid));
        }

        let mut queued = 0;
        if !self
            .state
            .sync_records
            .notebook_has_container(&user.id, &notebook_uuid)
            .await?
        {
            self.state
                .work_queue
                .enqueue(&WorkItem::new(
                    user.id,
                    WorkKind::Container,
                    notebook_uuid.to_string(),
                    DestinationSelector::All,
                ))
                .await?;
        }
        for page in self
            .state
            .pages
            .list_for_notebook(&user.id, &notebook_uuid)
            .await?
        {
            if page.ocr_status() != OcrStatus::Completed {
                continue;
            }
            let mut item = WorkItem::new(
                user.id,
                WorkKind::Full,
                page.page_uuid().to_string(),
                DestinationSelector::All,
            );
            if let Some(hash) = page.content_hash() {
                item = item.with_hash_snapshot(hash.clone());
            }
            if self.state.work_queue.enqueue(&item).await? {
                queued += 1;
            }
        }
        Ok(queued)
    }
}
