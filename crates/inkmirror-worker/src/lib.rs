//! Inkmirror Worker - background destination sync
//!
//! Drains the persistent work queue with database-level coordination:
//! multiple workers claim batches under time-bounded leases, a periodic
//! sweep reclaims leases from crashed workers, and two-phase sync keeps
//! destination-side objects exactly-once:
//!
//! - **Phase 1** - container creation, serialized per user via priority-0
//!   container items and the queue's single-container-lease guard
//! - **Phase 2** - page upserts, parallel across workers, deduplicated by
//!   the SyncRecord unique key and the `check_duplicate` recovery path

pub mod engine;
pub mod runner;

pub use engine::{AdapterSource, RegistryAdapterSource, SyncEngine};
pub use runner::{SyncWorker, WorkerSettings};
