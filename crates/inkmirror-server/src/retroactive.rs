//! Retroactive processor
//!
//! Runs when a user's quota ledger resets (billing-period rollover or a
//! manual reset). Deferred pages are claimed newest-first up to the fresh
//! headroom, transitioned `pending_quota -> pending`, and queued for OCR
//! re-processing and sync. Pages beyond the headroom stay deferred until
//! the next reset.

use anyhow::Result;
use tracing::{info, instrument};

use inkmirror_core::domain::newtypes::UserId;
use inkmirror_core::domain::{DestinationSelector, QuotaKind, WorkItem, WorkKind};
use inkmirror_core::ports::{ObjectStore as _, OcrEngine as _};

use crate::state::AppState;

/// Summary of one retroactive run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetroactiveSummary {
    /// Pages claimed out of `pending_quota`
    pub claimed: usize,
    /// Pages that completed OCR in this run
    pub completed: usize,
    /// Pages whose OCR failed in this run
    pub failed: usize,
}

/// The retroactive processor (C11)
pub struct RetroactiveProcessor {
    state: AppState,
}

impl RetroactiveProcessor {
    /// Creates the processor over shared state
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Resets the user's ledger, then drains deferred pages into the fresh
    /// headroom
    #[instrument(skip(self))]
    pub async fn reset_and_process(&self, user_id: &UserId) -> Result<RetroactiveSummary> {
        self.state.quota.reset(user_id, QuotaKind::OcrPages).await?;
        self.process_deferred(user_id).await
    }

    /// Drains deferred pages into whatever headroom currently exists
    ///
    /// Selection is newest-first at claim time; each claim is a conditional
    /// update, so concurrent uploads cannot double-claim a page.
    pub async fn process_deferred(&self, user_id: &UserId) -> Result<RetroactiveSummary> {
        let snapshot = self.state.quota.observe(user_id, QuotaKind::OcrPages).await?;
        let headroom = snapshot.remaining();
        if headroom <= 0 {
            return Ok(RetroactiveSummary {
                claimed: 0,
                completed: 0,
                failed: 0,
            });
        }

        // i64::MAX headroom (unlimited) would overflow a LIMIT clause's
        // usefulness; cap a single run at a sane batch
        let claim_limit = headroom.min(10_000);
        let claimed_pages = self.state.pages.claim_deferred(user_id, claim_limit).await?;
        let claimed = claimed_pages.len();

        let mut completed = 0;
        let mut failed = 0;

        for page in claimed_pages {
            match self.process_one(user_id, &page).await {
                Ok(true) => completed += 1,
                Ok(false) => failed += 1,
                Err(err) => {
                    tracing::warn!(page = %page.page_uuid(), error = %err, "Retroactive processing error");
                    failed += 1;
                }
            }
        }

        info!(claimed, completed, failed, "Retroactive run finished");
        Ok(RetroactiveSummary {
            claimed,
            completed,
            failed,
        })
    }

    /// Runs OCR for one claimed page; returns true on completion
    async fn process_one(
        &self,
        user_id: &UserId,
        page: &inkmirror_core::domain::Page,
    ) -> Result<bool> {
        use inkmirror_core::domain::OcrStatus;
        use inkmirror_store::pipeline::complete_ocr_and_enqueue;

        let Some(pdf_key) = page.pdf_key() else {
            // Deferred pages always have a stored PDF; a missing key means
            // the row predates the invariant and cannot be processed
            self.state
                .pages
                .transition(user_id, page.page_uuid(), OcrStatus::Pending, OcrStatus::Failed)
                .await?;
            return Ok(false);
        };

        let pdf_bytes = self.state.object_store.get(pdf_key).await?;

        let extraction = match self.state.ocr.extract(&pdf_bytes).await {
            Ok(extraction) => extraction,
            Err(err) => {
                tracing::warn!(page = %page.page_uuid(), error = %err, "Retroactive OCR failed");
                self.state
                    .pages
                    .transition(user_id, page.page_uuid(), OcrStatus::Pending, OcrStatus::Failed)
                    .await?;
                return Ok(false);
            }
        };

        // OCR first, then debit
        match self
            .state
            .quota
            .consume(user_id, QuotaKind::OcrPages, extraction.page_count)
            .await
        {
            Ok(receipt) => self
                .state
                .metrics
                .record_quota_consumed(receipt.consumed as u64),
            Err(inkmirror_store::StoreError::Conflict(msg)) => {
                tracing::warn!(%msg, "Quota consume lost a race during retroactive run");
            }
            Err(err) => return Err(err.into()),
        }

        let mut work = vec![WorkItem::new(
            *user_id,
            WorkKind::Full,
            page.page_uuid().to_string(),
            DestinationSelector::All,
        )];
        if let Some(hash) = page.content_hash() {
            work[0] = work[0].clone().with_hash_snapshot(hash.clone());
        }
        if !self
            .state
            .sync_records
            .notebook_has_container(user_id, page.notebook_uuid())
            .await?
        {
            work.push(WorkItem::new(
                *user_id,
                WorkKind::Container,
                page.notebook_uuid().to_string(),
                DestinationSelector::All,
            ));
        }

        complete_ocr_and_enqueue(
            self.state.db.pool(),
            user_id,
            page.page_uuid(),
            &extraction.text,
            extraction.confidence,
            &work,
        )
        .await?;

        Ok(true)
    }
}
