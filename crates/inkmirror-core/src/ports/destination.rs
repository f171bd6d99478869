//! Destination port (driven/secondary port)
//!
//! Polymorphic contract implemented per third-party target. The sync worker
//! drives this interface during two-phase sync: container creation first
//! (serialized per user), then page upserts (parallel). Implementations
//! report capabilities so the worker can skip unsupported operations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::newtypes::{ContentHash, ExternalId, NotebookUuid, PageUuid};

/// Operations a destination supports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationCapabilities {
    /// Can create new external objects
    pub create: bool,
    /// Can update existing external objects in place
    pub update: bool,
    /// Can delete external objects
    pub delete: bool,
    /// Can look up an external object by content hash
    pub dedupe_check: bool,
    /// Can verify credentials without side effects
    pub validate: bool,
}

/// The payload handed to a destination for one page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItemPayload {
    /// The page being propagated
    pub page_uuid: PageUuid,
    /// The notebook the page belongs to
    pub notebook_uuid: NotebookUuid,
    /// Notebook display name (container title)
    pub notebook_title: String,
    /// Position within the notebook
    pub page_number: i32,
    /// Transcribed text
    pub text: String,
    /// OCR confidence
    pub confidence: f64,
    /// Fingerprint of the content being propagated
    pub content_hash: ContentHash,
    /// External id of the notebook's container at this destination, if known
    pub container_id: Option<ExternalId>,
    /// Destination-specific extras carried through from the SyncRecord
    pub metadata: Option<serde_json::Value>,
}

/// Notebook-level properties for metadata-only syncs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataPayload {
    /// The notebook whose properties changed
    pub notebook_uuid: NotebookUuid,
    /// Current display name
    pub title: String,
    /// Device-reported last modification time (RFC 3339)
    pub last_modified: String,
    /// Number of pages currently known
    pub page_count: i64,
    /// Folder path on the device, `/`-separated
    pub folder_path: Option<String>,
}

/// Outcome of a destination call
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    /// Identifier the destination assigned (or confirmed) for the object
    pub external_id: ExternalId,
    /// Destination-specific handles to persist on the SyncRecord
    pub metadata: Option<serde_json::Value>,
}

/// Failure modes of destination calls
#[derive(Debug, Error)]
pub enum DestinationError {
    /// Network faults, 5xx, timeouts; retry with backoff
    #[error("Transient destination failure: {0}")]
    Transient(String),
    /// Destination asked us to slow down; retry after the hinted delay
    #[error("Destination rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds the destination asked us to wait
        retry_after_secs: u64,
    },
    /// Credentials rejected; surface to the user, do not retry
    #[error("Destination authentication failed: {0}")]
    Auth(String),
    /// The external object was archived or deleted on the destination side
    #[error("External object gone: {0}")]
    ObjectGone(String),
    /// The destination rejected the content shape; do not retry
    #[error("Permanent destination failure: {0}")]
    Permanent(String),
}

impl DestinationError {
    /// Returns true when the caller should retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }
}

/// Port trait for third-party sync targets
#[async_trait::async_trait]
pub trait Destination: Send + Sync {
    /// Stable name identifying this destination in records and configs
    fn name(&self) -> &str;

    /// Which operations this destination supports
    fn capabilities(&self) -> DestinationCapabilities;

    /// Creates the container object for a notebook (e.g. a database page).
    /// Called serially per user during Phase 1.
    async fn create_container(
        &self,
        notebook_uuid: &NotebookUuid,
        title: &str,
    ) -> Result<SyncOutcome, DestinationError>;

    /// Creates a new external object for a page
    async fn sync_item(&self, item: &SyncItemPayload) -> Result<SyncOutcome, DestinationError>;

    /// Updates an existing external object in place
    async fn update_item(
        &self,
        external_id: &ExternalId,
        item: &SyncItemPayload,
    ) -> Result<SyncOutcome, DestinationError>;

    /// Deletes an external object
    async fn delete_item(&self, external_id: &ExternalId) -> Result<(), DestinationError>;

    /// Updates notebook-level properties only (metadata sync)
    async fn update_metadata(
        &self,
        container_id: &ExternalId,
        metadata: &MetadataPayload,
    ) -> Result<SyncOutcome, DestinationError>;

    /// Looks up an external object by content hash; used to recover the
    /// external id when the local SyncRecord was lost mid-insert
    async fn check_duplicate(
        &self,
        content_hash: &ContentHash,
    ) -> Result<Option<ExternalId>, DestinationError>;

    /// Verifies the stored credentials still work
    async fn validate_connection(&self) -> Result<bool, DestinationError>;
}
