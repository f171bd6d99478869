//! Local deduplication cache
//!
//! Maps absolute paths to `(mtime, size, sha256)` so unchanged files never
//! leave the device. The cheap check runs first: if mtime and size both
//! match, the file is skipped without hashing. Only when they differ is
//! the file read and hashed, and only a hash change triggers an upload.
//!
//! The cache persists as JSON next to the agent's data files, rewritten
//! atomically (write to a sibling, then rename) so a crash never leaves a
//! torn file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// One cached file observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Modification time in whole seconds since the epoch
    pub mtime_unix: i64,
    /// File size in bytes
    pub size: u64,
    /// SHA-256 of the file contents, lowercase hex
    pub sha256: String,
}

/// What to do with a changed path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
    /// Nothing changed; drop the event
    Skip,
    /// Content changed; upload with this hash
    Upload(String),
}

/// Persistent path → content-identity map
pub struct DedupCache {
    path: PathBuf,
    entries: HashMap<PathBuf, CacheEntry>,
}

fn hash_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(64);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{b:02x}");
    }
    hex
}

impl DedupCache {
    /// Loads the cache from `path`, starting empty if the file is missing
    /// or unreadable
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self { path, entries }
    }

    /// Persists the cache atomically
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string(&self.entries)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    /// Decides whether `path` needs uploading, updating the cache
    ///
    /// Reads the file only when the cheap mtime+size check fails.
    pub fn check(&mut self, path: &Path) -> Result<DedupDecision> {
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        let mtime_unix = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let size = metadata.len();

        if let Some(entry) = self.entries.get(path) {
            if entry.mtime_unix == mtime_unix && entry.size == size {
                debug!(path = %path.display(), "Unchanged by mtime+size, skipping");
                return Ok(DedupDecision::Skip);
            }
        }

        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let sha256 = hash_bytes(&bytes);

        if let Some(entry) = self.entries.get(path) {
            if entry.sha256 == sha256 {
                // Touched but not changed (e.g. a re-save of identical
                // content); refresh the stat fields and drop the event
                debug!(path = %path.display(), "Unchanged by hash, skipping");
                self.entries.insert(
                    path.to_path_buf(),
                    CacheEntry {
                        mtime_unix,
                        size,
                        sha256,
                    },
                );
                return Ok(DedupDecision::Skip);
            }
        }

        self.entries.insert(
            path.to_path_buf(),
            CacheEntry {
                mtime_unix,
                size,
                sha256: sha256.clone(),
            },
        );
        Ok(DedupDecision::Upload(sha256))
    }

    /// Removes a deleted path from the cache
    pub fn forget(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    /// Number of tracked paths
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no paths are tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
