//! Inkmirror Agent - device-side sync core
//!
//! Runs on the machine that holds the notebook files:
//! - **Watcher** - filesystem events filtered to notebook file types,
//!   coalesced through a debounce window
//! - **Dedup cache** - persistent path → (mtime, size, sha256) map so
//!   unchanged files never leave the device
//! - **Uploader** - bounded queue drained by a worker pool with bounded
//!   retries; quota-deferred uploads are marked locally and not retried
//! - **Token store** - the 30-day agent token, held in the OS keystore
//! - **Status** - local read-only endpoint for the UI
//!
//! The agent is single-host, single-user; concurrency is cooperative
//! within one process.

pub mod dedup;
pub mod status;
pub mod token;
pub mod uploader;
pub mod watcher;

pub use dedup::{DedupCache, DedupDecision};
pub use status::{AgentStatus, StatusServer};
pub use token::TokenStore;
pub use uploader::{ApiClient, UploadQueue, UploadTask};
pub use watcher::{DebounceBuffer, NotebookWatcher, WatchEvent};
