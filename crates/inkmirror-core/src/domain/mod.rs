//! Domain entities and business rules
//!
//! Pure domain logic with no I/O. Entities enforce their own invariants;
//! adapters translate them to and from storage and wire formats.

pub mod errors;
pub mod integration;
pub mod newtypes;
pub mod notebook;
pub mod page;
pub mod quota;
pub mod sync_record;
pub mod work_item;

pub use errors::DomainError;
pub use integration::IntegrationConfig;
pub use notebook::{DocumentType, Notebook};
pub use page::{OcrStatus, Page};
pub use quota::{
    threshold_crossing, NotifiedThreshold, QuotaCheck, QuotaKind, QuotaSnapshot,
    QuotaThresholdCrossed, Tier, UNLIMITED,
};
pub use sync_record::{SyncItemKind, SyncRecord, SyncRecordStatus};
pub use work_item::{
    backoff, DestinationSelector, WorkItem, WorkKind, WorkStatus, MAX_ATTEMPTS,
    PRIORITY_CONTAINER, PRIORITY_FULL, PRIORITY_METADATA,
};
