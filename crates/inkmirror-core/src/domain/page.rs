//! Page domain entity
//!
//! This module defines the Page entity, the smallest transcribable unit of
//! notebook content, together with its OCR status machine.
//!
//! ## State Machine
//!
//! ```text
//!              upload accepted, quota ok
//!  not_synced ──────────────────────────► pending ──OCR ok──► completed
//!      │                                     │
//!      │ upload accepted, quota exhausted    │ OCR permanent-fail
//!      ▼                                     ▼
//!  pending_quota                          failed
//!      │                                     │
//!      │ quota reset + retroactive claim     │ manual / retroactive retry
//!      ▼                                     ▼
//!   pending ──► completed | failed        pending
//! ```
//!
//! Terminal states stay terminal until an explicit trigger (changed source
//! bytes on upload, or a manual retry).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::DomainError;
use super::newtypes::{ContentHash, NotebookUuid, ObjectKey, PageUuid, UserId};

// ============================================================================
// OcrStatus
// ============================================================================

/// Transcription status of a page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrStatus {
    /// Never uploaded or never processed
    #[default]
    NotSynced,
    /// Content stored, OCR queued or running
    Pending,
    /// OCR succeeded, transcription available
    Completed,
    /// OCR permanently failed or retries exhausted
    Failed,
    /// Upload accepted while the quota was exhausted; OCR deferred
    PendingQuota,
}

impl OcrStatus {
    /// Returns the set of statuses that are valid successors of `self`
    pub fn valid_transitions(&self) -> &'static [OcrStatus] {
        match self {
            Self::NotSynced => &[Self::Pending, Self::PendingQuota],
            Self::Pending => &[Self::Completed, Self::Failed],
            Self::PendingQuota => &[Self::Pending],
            // Terminal until an explicit trigger re-opens the page: a changed
            // upload or a manual retry, which may land under exhausted quota
            Self::Completed => &[Self::Pending, Self::PendingQuota],
            Self::Failed => &[Self::Pending, Self::PendingQuota],
        }
    }

    /// Returns `true` if transitioning from `self` to `next` is valid
    pub fn can_transition_to(&self, next: OcrStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Returns true if OCR work is still owed for this page
    pub fn is_awaiting_ocr(&self) -> bool {
        matches!(self, Self::Pending | Self::PendingQuota)
    }

    /// Returns true if this status is terminal absent an explicit trigger
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable string form used for persistence and logging
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotSynced => "not_synced",
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PendingQuota => "pending_quota",
        }
    }

    /// Parse the stable string form back into a status
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "not_synced" => Ok(Self::NotSynced),
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "pending_quota" => Ok(Self::PendingQuota),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown OCR status: {other}"
            ))),
        }
    }
}

impl fmt::Display for OcrStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Page entity
// ============================================================================

/// A single transcribable page within a notebook
///
/// Pages are identified by `(notebook_uuid, page_uuid)` per user. The
/// content hash tracks the raw source bytes; it changes only when the
/// device uploads different bytes for the same page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    user_id: UserId,
    notebook_uuid: NotebookUuid,
    page_uuid: PageUuid,
    page_number: i32,
    content_hash: Option<ContentHash>,
    ocr_status: OcrStatus,
    ocr_text: Option<String>,
    ocr_confidence: Option<f64>,
    pdf_key: Option<ObjectKey>,
    source_key: Option<ObjectKey>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Page {
    /// Creates a fresh page in `not_synced` status
    pub fn new(
        user_id: UserId,
        notebook_uuid: NotebookUuid,
        page_uuid: PageUuid,
        page_number: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            notebook_uuid,
            page_uuid,
            page_number,
            content_hash: None,
            ocr_status: OcrStatus::NotSynced,
            ocr_text: None,
            ocr_confidence: None,
            pdf_key: None,
            source_key: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reconstructs a page from persisted fields (repository use)
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        user_id: UserId,
        notebook_uuid: NotebookUuid,
        page_uuid: PageUuid,
        page_number: i32,
        content_hash: Option<ContentHash>,
        ocr_status: OcrStatus,
        ocr_text: Option<String>,
        ocr_confidence: Option<f64>,
        pdf_key: Option<ObjectKey>,
        source_key: Option<ObjectKey>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        if ocr_status == OcrStatus::Completed && ocr_text.is_none() {
            return Err(DomainError::ValidationFailed(
                "completed page without transcription text".to_string(),
            ));
        }
        if ocr_status == OcrStatus::PendingQuota && pdf_key.is_none() {
            return Err(DomainError::ValidationFailed(
                "deferred page without stored pdf".to_string(),
            ));
        }
        Ok(Self {
            user_id,
            notebook_uuid,
            page_uuid,
            page_number,
            content_hash,
            ocr_status,
            ocr_text,
            ocr_confidence,
            pdf_key,
            source_key,
            created_at,
            updated_at,
        })
    }

    // --- accessors ---

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn notebook_uuid(&self) -> &NotebookUuid {
        &self.notebook_uuid
    }

    pub fn page_uuid(&self) -> &PageUuid {
        &self.page_uuid
    }

    pub fn page_number(&self) -> i32 {
        self.page_number
    }

    pub fn content_hash(&self) -> Option<&ContentHash> {
        self.content_hash.as_ref()
    }

    pub fn ocr_status(&self) -> OcrStatus {
        self.ocr_status
    }

    pub fn ocr_text(&self) -> Option<&str> {
        self.ocr_text.as_deref()
    }

    pub fn ocr_confidence(&self) -> Option<f64> {
        self.ocr_confidence
    }

    pub fn pdf_key(&self) -> Option<&ObjectKey> {
        self.pdf_key.as_ref()
    }

    pub fn source_key(&self) -> Option<&ObjectKey> {
        self.source_key.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    // --- mutations ---

    /// Records where the raw source and rendered PDF were stored
    pub fn set_blob_keys(&mut self, source_key: ObjectKey, pdf_key: ObjectKey) {
        self.source_key = Some(source_key);
        self.pdf_key = Some(pdf_key);
        self.touch();
    }

    /// Records the hash of the most recently uploaded source bytes
    pub fn set_content_hash(&mut self, hash: ContentHash) {
        self.content_hash = Some(hash);
        self.touch();
    }

    /// Returns true if `hash` matches the stored content hash
    pub fn matches_hash(&self, hash: &ContentHash) -> bool {
        self.content_hash.as_ref() == Some(hash)
    }

    /// Guarded transition of the OCR status
    ///
    /// # Errors
    /// Returns [`DomainError::InvalidTransition`] when the machine does not
    /// permit moving from the current status to `next`.
    pub fn transition(&mut self, next: OcrStatus) -> Result<(), DomainError> {
        if !self.ocr_status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: self.ocr_status.to_string(),
                to: next.to_string(),
            });
        }
        self.ocr_status = next;
        self.touch();
        Ok(())
    }

    /// Marks OCR as succeeded, storing the transcription
    pub fn complete_ocr(&mut self, text: String, confidence: f64) -> Result<(), DomainError> {
        self.transition(OcrStatus::Completed)?;
        self.ocr_text = Some(text);
        self.ocr_confidence = Some(confidence);
        Ok(())
    }

    /// Marks OCR as permanently failed
    pub fn fail_ocr(&mut self) -> Result<(), DomainError> {
        self.transition(OcrStatus::Failed)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
