//! Object store port (driven/secondary port)
//!
//! Opaque put/get/delete of binary blobs keyed by application-chosen paths.
//! `put` is idempotent by key. Implementations may be filesystem-backed or
//! S3-compatible; callers assume only read-after-write consistency for new
//! keys.

use crate::domain::newtypes::ObjectKey;

/// Port trait for opaque blob storage
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` under `key`, replacing any existing blob
    async fn put(&self, key: &ObjectKey, bytes: &[u8]) -> anyhow::Result<()>;

    /// Retrieves the blob stored under `key`
    async fn get(&self, key: &ObjectKey) -> anyhow::Result<Vec<u8>>;

    /// Deletes the blob under `key`; deleting a missing key is not an error
    async fn delete(&self, key: &ObjectKey) -> anyhow::Result<()>;
}
