//! HTTP client for the vision OCR provider
//!
//! Wraps `reqwest::Client` with API-key auth, base URL construction, and
//! response mapping into the [`OcrEngine`] port types.

use std::time::Duration;

use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use inkmirror_core::ports::{OcrEngine, OcrError, OcrExtraction};

/// Default request timeout for OCR extraction
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

// ============================================================================
// Wire types
// ============================================================================

/// Request body for the extraction endpoint
#[derive(Debug, Serialize)]
struct ExtractRequest<'a> {
    /// Base64-encoded document bytes
    document: String,
    /// MIME type of the document
    mime_type: &'a str,
}

/// Per-page result in the provider response
#[derive(Debug, Deserialize)]
struct PageResult {
    /// Transcribed text for this page
    text: String,
    /// Provider confidence for this page, 0.0..=1.0
    confidence: f64,
}

/// Response body from the extraction endpoint
#[derive(Debug, Deserialize)]
struct ExtractResponse {
    /// Per-page results in page order
    pages: Vec<PageResult>,
}

// ============================================================================
// OcrClient
// ============================================================================

/// HTTP client for vision OCR extraction
pub struct OcrClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OcrClient {
    /// Creates a client with the given base URL, API key, and timeout
    ///
    /// # Errors
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }

    /// Creates a client with the default 60-second timeout
    pub fn with_default_timeout(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> anyhow::Result<Self> {
        Self::new(base_url, api_key, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    fn classify_status(status: StatusCode, body: &str) -> OcrError {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            OcrError::Transient(format!("OCR provider returned {status}: {body}"))
        } else {
            OcrError::Permanent(format!("OCR provider returned {status}: {body}"))
        }
    }
}

#[async_trait::async_trait]
impl OcrEngine for OcrClient {
    async fn extract(&self, pdf_bytes: &[u8]) -> Result<OcrExtraction, OcrError> {
        let url = format!("{}/v1/documents:extract", self.base_url);
        let request = ExtractRequest {
            document: base64::engine::general_purpose::STANDARD.encode(pdf_bytes),
            mime_type: "application/pdf",
        };

        debug!(bytes = pdf_bytes.len(), "Submitting document for OCR");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                // reqwest timeouts and connection failures are all transient
                warn!(error = %e, "OCR request failed in transport");
                OcrError::Transient(format!("OCR transport error: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }

        let parsed: ExtractResponse = response.json().await.map_err(|e| {
            // A 200 with an unparseable body will not get better on retry
            OcrError::Permanent(format!("Invalid OCR response body: {e}"))
        })?;

        if parsed.pages.is_empty() {
            return Err(OcrError::Permanent(
                "OCR provider returned no pages".to_string(),
            ));
        }

        let page_count = parsed.pages.len() as i64;
        let confidence =
            parsed.pages.iter().map(|p| p.confidence).sum::<f64>() / page_count as f64;
        let text = parsed
            .pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        debug!(page_count, confidence, "OCR extraction complete");

        Ok(OcrExtraction {
            text,
            confidence,
            page_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> OcrClient {
        OcrClient::new(server.uri(), "test-key", Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_extract_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/documents:extract"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "pages": [
                    {"text": "First page", "confidence": 0.9},
                    {"text": "Second page", "confidence": 0.8}
                ]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let extraction = client.extract(b"%PDF-1.4 fake").await.unwrap();

        assert_eq!(extraction.page_count, 2);
        assert!((extraction.confidence - 0.85).abs() < 1e-9);
        assert_eq!(extraction.text, "First page\n\nSecond page");
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/documents:extract"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.extract(b"pdf").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/documents:extract"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.extract(b"pdf").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_bad_request_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/documents:extract"))
            .respond_with(ResponseTemplate::new(400).set_body_string("unsupported document"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.extract(b"not a pdf").await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_empty_pages_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/documents:extract"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"pages": []})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.extract(b"pdf").await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/documents:extract"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"pages": []}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let client = OcrClient::new(server.uri(), "k", Duration::from_millis(100)).unwrap();
        let err = client.extract(b"pdf").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
