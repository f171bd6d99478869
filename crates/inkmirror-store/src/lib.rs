//! Inkmirror Store - SQLite persistence
//!
//! Concrete repositories for the server-side state domains:
//! - **Users & subscriptions** - account rows, tiers, agent tokens
//! - **Quota ledger** - atomic per-user counters with durable threshold events
//! - **Page store** - per-page rows with the OCR status machine
//! - **Sync records** - per-(page, destination) external-id dedup entries
//! - **Work queue** - priority-ordered lease-and-claim queue
//! - **Integration configs** - encrypted destination credentials
//!
//! All mutation of shared rows goes through atomic conditional updates keyed
//! on the current state, checked by affected-row count. Queue claims and
//! page-status transitions never read-then-write across a network call.

pub mod integrations;
pub mod notebooks;
pub mod pages;
pub mod pipeline;
pub mod pool;
pub mod quota;
pub mod sync_records;
pub mod time;
pub mod users;
pub mod work_queue;

pub use pool::DatabasePool;

use thiserror::Error;

/// Errors that can occur in store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Could not open or create the database
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    /// Schema migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Stored data could not be mapped back to a domain value
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A conditional update found the row in an unexpected state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The requested row does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<inkmirror_core::domain::DomainError> for StoreError {
    fn from(err: inkmirror_core::domain::DomainError) -> Self {
        StoreError::SerializationError(err.to_string())
    }
}
