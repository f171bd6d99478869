//! OCR engine port (driven/secondary port)
//!
//! Submits a rendered PDF and receives transcribed text plus confidence.
//! The error taxonomy matters here: transient failures are retried by the
//! caller, permanent ones transition the page to `failed`. The reported
//! page count drives the quota debit, and the debit happens only after a
//! successful extraction.

use thiserror::Error;

/// Result of a successful OCR extraction
#[derive(Debug, Clone, PartialEq)]
pub struct OcrExtraction {
    /// Transcribed text for the whole document
    pub text: String,
    /// Mean confidence across pages, 0.0..=1.0
    pub confidence: f64,
    /// Number of pages the provider billed for
    pub page_count: i64,
}

/// Failure modes of an OCR extraction
#[derive(Debug, Error)]
pub enum OcrError {
    /// Worth retrying: network faults, 5xx, rate limiting, timeouts
    #[error("Transient OCR failure: {0}")]
    Transient(String),
    /// Not worth retrying: rejected input, auth failures, provider 4xx
    #[error("Permanent OCR failure: {0}")]
    Permanent(String),
}

impl OcrError {
    /// Returns true when the caller should retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Port trait for vision OCR providers
#[async_trait::async_trait]
pub trait OcrEngine: Send + Sync {
    /// Transcribes a rendered PDF
    async fn extract(&self, pdf_bytes: &[u8]) -> Result<OcrExtraction, OcrError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(OcrError::Transient("timeout".into()).is_retryable());
        assert!(!OcrError::Permanent("bad pdf".into()).is_retryable());
    }
}
