//! WorkItem domain entity
//!
//! One WorkItem row exists per scheduled sync action. The queue is drained
//! by sync workers using lease-and-claim semantics; queue state is transient
//! and safe to rebuild, so nothing in the domain references work items back.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::DomainError;
use super::newtypes::{ContentHash, DestinationName, UserId, WorkItemId};

// ============================================================================
// Kind / status / destination selection
// ============================================================================

/// What a work item asks a sync worker to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    /// Propagate page content (create or update external objects)
    Full,
    /// Propagate notebook-level properties only; no content traversal
    Metadata,
    /// Create the destination-side container for a notebook.
    /// Container items run at priority 0 and one-at-a-time per user.
    Container,
}

impl WorkKind {
    /// Stable string form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Metadata => "metadata",
            Self::Container => "container",
        }
    }

    /// Parse the stable string form
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "full" => Ok(Self::Full),
            "metadata" => Ok(Self::Metadata),
            "container" => Ok(Self::Container),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown work kind: {other}"
            ))),
        }
    }
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue status of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Waiting to be claimed
    Queued,
    /// Claimed by a worker under a time-bounded lease
    Leased,
    /// Finished successfully
    Done,
    /// Retries exhausted or permanent failure
    Failed,
}

impl WorkStatus {
    /// Returns `true` for terminal states
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Stable string form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Leased => "leased",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Parse the stable string form
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "queued" => Ok(Self::Queued),
            "leased" => Ok(Self::Leased),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::ValidationFailed(format!(
                "Unknown work status: {other}"
            ))),
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which destinations a work item targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "names")]
pub enum DestinationSelector {
    /// Every destination the user has enabled at claim time
    All,
    /// An explicit set of destination names
    Named(Vec<DestinationName>),
}

impl DestinationSelector {
    /// Returns true if `name` is selected
    pub fn includes(&self, name: &DestinationName) -> bool {
        match self {
            Self::All => true,
            Self::Named(names) => names.contains(name),
        }
    }
}

// ============================================================================
// Priorities and backoff
// ============================================================================

/// Priority for container-creation items (lowest value = soonest)
pub const PRIORITY_CONTAINER: i32 = 0;
/// Priority for full page syncs
pub const PRIORITY_FULL: i32 = 10;
/// Priority for metadata-only syncs
pub const PRIORITY_METADATA: i32 = 20;

/// Maximum delivery attempts before a work item is marked failed
pub const MAX_ATTEMPTS: i32 = 5;

/// Retry backoff: `min(30 * 2^attempt, 3600)` seconds
pub fn backoff(attempt: i32) -> Duration {
    let attempt = attempt.clamp(0, 30) as u32;
    let secs = 30u64.saturating_mul(1u64 << attempt).min(3600);
    Duration::seconds(secs as i64)
}

// ============================================================================
// WorkItem entity
// ============================================================================

/// A scheduled sync action in the persistent work queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Queue row identifier
    pub id: WorkItemId,
    /// Owning user
    pub user_id: UserId,
    /// What to do
    pub kind: WorkKind,
    /// Notebook or page UUID this item targets
    pub target_ref: String,
    /// Content hash at enqueue time, when known
    pub content_hash_snapshot: Option<ContentHash>,
    /// Destinations to sync to
    pub destinations: DestinationSelector,
    /// Lower runs sooner
    pub priority: i32,
    /// Queue status
    pub status: WorkStatus,
    /// Worker currently holding the lease
    pub lease_owner: Option<String>,
    /// When the current lease expires
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Delivery attempts so far
    pub attempts: i32,
    /// Earliest time this item may be claimed (backoff rescheduling)
    pub available_at: DateTime<Utc>,
    /// Enqueue time
    pub created_at: DateTime<Utc>,
    /// Last recorded error, if any
    pub last_error: Option<String>,
}

impl WorkItem {
    /// Creates a queued work item with the default priority for its kind
    pub fn new(
        user_id: UserId,
        kind: WorkKind,
        target_ref: impl Into<String>,
        destinations: DestinationSelector,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: WorkItemId::new(),
            user_id,
            kind,
            target_ref: target_ref.into(),
            content_hash_snapshot: None,
            destinations,
            priority: match kind {
                WorkKind::Container => PRIORITY_CONTAINER,
                WorkKind::Full => PRIORITY_FULL,
                WorkKind::Metadata => PRIORITY_METADATA,
            },
            status: WorkStatus::Queued,
            lease_owner: None,
            lease_expires_at: None,
            attempts: 0,
            available_at: now,
            created_at: now,
            last_error: None,
        }
    }

    /// Attaches the content hash observed at enqueue time
    pub fn with_hash_snapshot(mut self, hash: ContentHash) -> Self {
        self.content_hash_snapshot = Some(hash);
        self
    }

    /// Returns true if this item's lease has lapsed at `now`
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == WorkStatus::Leased
            && self.lease_expires_at.map(|t| t < now).unwrap_or(true)
    }

    /// Returns true if another delivery attempt is allowed
    pub fn can_retry(&self) -> bool {
        self.attempts < MAX_ATTEMPTS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff(0).num_seconds(), 30);
        assert_eq!(backoff(1).num_seconds(), 60);
        assert_eq!(backoff(2).num_seconds(), 120);
        assert_eq!(backoff(5).num_seconds(), 960);
        // Capped at one hour
        assert_eq!(backoff(10).num_seconds(), 3600);
        assert_eq!(backoff(30).num_seconds(), 3600);
    }

    #[test]
    fn test_priorities_order_containers_first() {
        assert!(PRIORITY_CONTAINER < PRIORITY_FULL);
        assert!(PRIORITY_FULL < PRIORITY_METADATA);
    }

    #[test]
    fn test_new_item_defaults() {
        let item = WorkItem::new(
            UserId::new(),
            WorkKind::Full,
            "page-uuid",
            DestinationSelector::All,
        );
        assert_eq!(item.status, WorkStatus::Queued);
        assert_eq!(item.priority, PRIORITY_FULL);
        assert_eq!(item.attempts, 0);
        assert!(item.lease_owner.is_none());
    }

    #[test]
    fn test_container_item_priority_zero() {
        let item = WorkItem::new(
            UserId::new(),
            WorkKind::Container,
            "notebook-uuid",
            DestinationSelector::All,
        );
        assert_eq!(item.priority, PRIORITY_CONTAINER);
    }

    #[test]
    fn test_lease_expired() {
        let mut item = WorkItem::new(
            UserId::new(),
            WorkKind::Full,
            "p",
            DestinationSelector::All,
        );
        let now = Utc::now();
        assert!(!item.lease_expired(now));

        item.status = WorkStatus::Leased;
        item.lease_expires_at = Some(now - Duration::seconds(1));
        assert!(item.lease_expired(now));

        item.lease_expires_at = Some(now + Duration::seconds(60));
        assert!(!item.lease_expired(now));
    }

    #[test]
    fn test_destination_selector_includes() {
        let notion = DestinationName::new("notion").unwrap();
        let other = DestinationName::new("obsidian").unwrap();
        assert!(DestinationSelector::All.includes(&notion));
        let named = DestinationSelector::Named(vec![notion.clone()]);
        assert!(named.includes(&notion));
        assert!(!named.includes(&other));
    }

    #[test]
    fn test_can_retry_bounds() {
        let mut item = WorkItem::new(
            UserId::new(),
            WorkKind::Metadata,
            "n",
            DestinationSelector::All,
        );
        assert!(item.can_retry());
        item.attempts = MAX_ATTEMPTS;
        assert!(!item.can_retry());
    }

    #[test]
    fn test_kind_status_string_roundtrip() {
        for kind in [WorkKind::Full, WorkKind::Metadata, WorkKind::Container] {
            assert_eq!(WorkKind::parse(kind.as_str()).unwrap(), kind);
        }
        for status in [
            WorkStatus::Queued,
            WorkStatus::Leased,
            WorkStatus::Done,
            WorkStatus::Failed,
        ] {
            assert_eq!(WorkStatus::parse(status.as_str()).unwrap(), status);
        }
    }
}
