//! Inkmirror Blob - filesystem object store
//!
//! Implements the [`ObjectStore`] port against a local directory tree. Keys
//! map directly to relative paths under the configured root; `put` writes to
//! a temporary sibling and renames into place, which makes it atomic on the
//! same filesystem and idempotent by key.
//!
//! The port leaves room for S3-compatible implementations; nothing here
//! assumes more than read-after-write consistency for new keys.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use inkmirror_core::domain::newtypes::ObjectKey;
use inkmirror_core::ports::ObjectStore;

/// Filesystem-backed object store
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Creates a store rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create object store root: {}", root.display()))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &ObjectKey) -> PathBuf {
        // ObjectKey construction already rejects absolute paths and `..`
        self.root.join(key.as_str())
    }

    /// The store's root directory
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait::async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &ObjectKey, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create blob directory for {key}"))?;
        }

        // Write-then-rename so readers never observe a partial blob
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write blob {key}"))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to finalize blob {key}"))?;

        debug!(key = %key, bytes = bytes.len(), "Blob stored");
        Ok(())
    }

    async fn get(&self, key: &ObjectKey) -> Result<Vec<u8>> {
        let path = self.path_for(key);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read blob {key}"))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key = %key, "Blob deleted");
                Ok(())
            }
            // Deleting a missing key is not an error (idempotent cleanup)
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete blob {key}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkmirror_core::domain::newtypes::{PageUuid, UserId};

    fn store() -> (tempfile::TempDir, FsObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_dir, store) = store();
        let key = ObjectKey::page_source(&UserId::new(), &PageUuid::new());
        store.put(&key, b"stroke data").await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), b"stroke data");
    }

    #[tokio::test]
    async fn test_put_is_idempotent_by_key() {
        let (_dir, store) = store();
        let key = ObjectKey::page_pdf(&UserId::new(), &PageUuid::new());
        store.put(&key, b"v1").await.unwrap();
        store.put(&key, b"v2").await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_get_missing_key_errors() {
        let (_dir, store) = store();
        let key = ObjectKey::page_pdf(&UserId::new(), &PageUuid::new());
        assert!(store.get(&key).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let (_dir, store) = store();
        let key = ObjectKey::page_source(&UserId::new(), &PageUuid::new());
        store.put(&key, b"bytes").await.unwrap();
        store.delete(&key).await.unwrap();
        // Second delete of a missing key succeeds
        store.delete(&key).await.unwrap();
        assert!(store.get(&key).await.is_err());
    }
}
