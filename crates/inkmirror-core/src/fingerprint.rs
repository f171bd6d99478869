//! Content fingerprinting
//!
//! Deterministic SHA-256 fingerprints over a canonical serialization of an
//! item's semantic content. Two implementations of these functions, in any
//! language, must produce identical 64-hex digests for identical inputs.
//!
//! Canonicalization rules:
//! - JSON with keys in sorted order (serde_json's default map is a BTreeMap,
//!   which serializes keys sorted; the `preserve_order` feature must stay off)
//! - string fields trimmed of surrounding whitespace
//! - UTF-8 bytes of the compact JSON encoding are hashed
//! - timestamps and mutable IDs are excluded
//! - completion flags on todos are excluded so toggles don't perturb the hash

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::domain::newtypes::{ContentHash, NotebookUuid};

/// One page's transcription as it enters the notebook aggregate hash
#[derive(Debug, Clone)]
pub struct PageDigestInput<'a> {
    /// Position within the notebook
    pub page_number: i32,
    /// Transcribed text (trimmed before hashing)
    pub text: &'a str,
    /// OCR confidence for this page
    pub confidence: f64,
}

fn hex_digest(bytes: &[u8]) -> ContentHash {
    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(64);
    for b in digest {
        use std::fmt::Write;
        // Writing to a String cannot fail
        let _ = write!(hex, "{b:02x}");
    }
    ContentHash::new(hex).unwrap_or_else(|_| unreachable!("sha256 digest is always 64 hex chars"))
}

fn hash_json(value: &serde_json::Value) -> ContentHash {
    let encoded = serde_json::to_vec(value).unwrap_or_else(|_| unreachable!("json values encode"));
    hex_digest(&encoded)
}

/// Fingerprint of a raw page source blob (the device file's bytes)
pub fn fingerprint_source_blob(bytes: &[u8]) -> ContentHash {
    hex_digest(bytes)
}

/// Fingerprint of one page's transcribed text
pub fn fingerprint_page_text(
    notebook_uuid: &NotebookUuid,
    page_number: i32,
    text: &str,
) -> ContentHash {
    hash_json(&json!({
        "notebook_uuid": notebook_uuid.to_string(),
        "page_number": page_number,
        "text": text.trim(),
    }))
}

/// Fingerprint of a notebook aggregate: title, type, and ordered page texts
pub fn fingerprint_notebook(
    title: &str,
    document_type: &str,
    pages: &[PageDigestInput<'_>],
) -> ContentHash {
    let page_values: Vec<serde_json::Value> = pages
        .iter()
        .map(|p| {
            json!({
                "confidence": p.confidence,
                "page_number": p.page_number,
                "text": p.text.trim(),
            })
        })
        .collect();
    hash_json(&json!({
        "document_type": document_type.trim(),
        "page_count": pages.len(),
        "pages": page_values,
        "title": title.trim(),
    }))
}

/// Fingerprint of a todo or highlight extracted from a page
///
/// Completion status is deliberately excluded: checking a box off must not
/// change the item's identity.
pub fn fingerprint_annotation(
    notebook_uuid: &NotebookUuid,
    page_number: i32,
    text: &str,
) -> ContentHash {
    hash_json(&json!({
        "notebook_uuid": notebook_uuid.to_string(),
        "page_number": page_number,
        "text": text.trim(),
    }))
}
