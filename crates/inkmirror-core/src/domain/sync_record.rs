//! SyncRecord domain entity
//!
//! One SyncRecord exists per `(user, page_uuid, destination)`; it is the
//! deduplication source of truth for external objects. The unique key
//! arbitrates insert races between concurrent workers, and the stored
//! external id lets later syncs update in place instead of recreating.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::DomainError;
use super::newtypes::{ContentHash, DestinationName, ExternalId, PageUuid, UserId};

/// What kind of destination object a record tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncItemKind {
    /// A page-level object (transcription block, sub-page, etc.)
    Page,
    /// The destination-side container for a notebook
    NotebookContainer,
}

impl SyncItemKind {
    /// Stable string form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::NotebookContainer => "notebook_container",
        }
    }

    /// Parse the stable string form
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "page" => Ok(Self::Page),
            "notebook_container" => Ok(Self::NotebookContainer),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown sync item kind: {other}"
            ))),
        }
    }
}

/// Outcome of the most recent sync attempt for this record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRecordStatus {
    /// Last sync succeeded
    Success,
    /// Last sync failed permanently
    Failed,
    /// Last sync failed transiently; will be retried
    Retry,
}

impl SyncRecordStatus {
    /// Stable string form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Retry => "retry",
        }
    }

    /// Parse the stable string form
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "retry" => Ok(Self::Retry),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown sync record status: {other}"
            ))),
        }
    }
}

impl fmt::Display for SyncRecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-replica deduplication entry mapping a page to its external object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Owning user
    pub user_id: UserId,
    /// The page (or, for containers, the notebook's UUID reused as page scope)
    pub page_uuid: PageUuid,
    /// Destination this record belongs to
    pub destination: DestinationName,
    /// Page object or notebook container
    pub item_kind: SyncItemKind,
    /// Identifier assigned by the destination
    pub external_id: ExternalId,
    /// Content hash at last successful sync
    pub content_hash: Option<ContentHash>,
    /// Outcome of the last attempt
    pub status: SyncRecordStatus,
    /// Error message from the last failed attempt
    pub error: Option<String>,
    /// Number of retries performed
    pub retry_count: i32,
    /// When the last successful sync completed
    pub synced_at: DateTime<Utc>,
    /// Destination-specific handles (block ids, revision tokens, ...)
    pub metadata: Option<serde_json::Value>,
}

impl SyncRecord {
    /// Creates a successful page-level record
    pub fn page_success(
        user_id: UserId,
        page_uuid: PageUuid,
        destination: DestinationName,
        external_id: ExternalId,
        content_hash: ContentHash,
    ) -> Self {
        Self {
            user_id,
            page_uuid,
            destination,
            item_kind: SyncItemKind::Page,
            external_id,
            content_hash: Some(content_hash),
            status: SyncRecordStatus::Success,
            error: None,
            retry_count: 0,
            synced_at: Utc::now(),
            metadata: None,
        }
    }

    /// Creates a successful container record for a notebook
    ///
    /// Container records reuse the notebook UUID in the page scope so the
    /// `(user, page_uuid, destination)` key stays unique across both kinds.
    pub fn container_success(
        user_id: UserId,
        notebook_scope: PageUuid,
        destination: DestinationName,
        external_id: ExternalId,
    ) -> Self {
        Self {
            user_id,
            page_uuid: notebook_scope,
            destination,
            item_kind: SyncItemKind::NotebookContainer,
            external_id,
            content_hash: None,
            status: SyncRecordStatus::Success,
            error: None,
            retry_count: 0,
            synced_at: Utc::now(),
            metadata: None,
        }
    }

    /// Returns true if the stored hash matches `hash` (an up-to-date replica)
    pub fn is_current(&self, hash: &ContentHash) -> bool {
        self.status == SyncRecordStatus::Success && self.content_hash.as_ref() == Some(hash)
    }

    /// Records a successful re-sync with a new content hash
    pub fn mark_synced(&mut self, hash: ContentHash) {
        self.content_hash = Some(hash);
        self.status = SyncRecordStatus::Success;
        self.error = None;
        self.synced_at = Utc::now();
    }

    /// Records a failed attempt
    pub fn mark_failed(&mut self, error: impl Into<String>, retryable: bool) {
        self.status = if retryable {
            SyncRecordStatus::Retry
        } else {
            SyncRecordStatus::Failed
        };
        self.error = Some(error.into());
        self.retry_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(c: char) -> ContentHash {
        ContentHash::new(c.to_string().repeat(64)).unwrap()
    }

    fn record() -> SyncRecord {
        SyncRecord::page_success(
            UserId::new(),
            PageUuid::new(),
            DestinationName::new("notion").unwrap(),
            ExternalId::new("blk_123").unwrap(),
            hash('a'),
        )
    }

    #[test]
    fn test_is_current_matches_hash() {
        let rec = record();
        assert!(rec.is_current(&hash('a')));
        assert!(!rec.is_current(&hash('b')));
    }

    #[test]
    fn test_failed_record_is_never_current() {
        let mut rec = record();
        rec.mark_failed("boom", true);
        assert!(!rec.is_current(&hash('a')));
        assert_eq!(rec.status, SyncRecordStatus::Retry);
        assert_eq!(rec.retry_count, 1);
    }

    #[test]
    fn test_mark_synced_clears_error() {
        let mut rec = record();
        rec.mark_failed("transient", true);
        rec.mark_synced(hash('b'));
        assert!(rec.error.is_none());
        assert!(rec.is_current(&hash('b')));
    }

    #[test]
    fn test_container_record_kind() {
        let rec = SyncRecord::container_success(
            UserId::new(),
            PageUuid::new(),
            DestinationName::new("notion").unwrap(),
            ExternalId::new("page_abc").unwrap(),
        );
        assert_eq!(rec.item_kind, SyncItemKind::NotebookContainer);
        assert!(rec.content_hash.is_none());
    }

    #[test]
    fn test_permanent_failure_status() {
        let mut rec = record();
        rec.mark_failed("schema rejected", false);
        assert_eq!(rec.status, SyncRecordStatus::Failed);
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in [SyncItemKind::Page, SyncItemKind::NotebookContainer] {
            assert_eq!(SyncItemKind::parse(kind.as_str()).unwrap(), kind);
        }
    }
}
