//! HTTP API surface
//!
//! All endpoints are versioned under `/v1` and authenticated with a Bearer
//! token (a long-lived agent token, except the token exchange itself).
//! Errors use the envelope `{"detail": ...}`; rate-limited routes carry
//! `X-RateLimit-*` headers.

pub mod auth;
pub mod rate_limit;
pub mod routes;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::ingest::IngestError;

/// API error carrying the HTTP status and the `detail` payload
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status to return
    pub status: StatusCode,
    /// Human-readable detail string
    pub detail: String,
    /// Optional Retry-After hint in seconds
    pub retry_after: Option<u64>,
}

impl ApiError {
    /// Creates an error with the given status and detail
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
            retry_after: None,
        }
    }

    /// 401 with a fixed detail
    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Invalid or expired token")
    }

    /// 429 with a Retry-After hint
    pub fn rate_limited(retry_after: u64) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            detail: "Rate limit exceeded".to_string(),
            retry_after: Some(retry_after),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "detail": self.detail }));
        let mut response = (self.status, body).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match &err {
            IngestError::TooManyPending(_) => {
                Self::new(StatusCode::TOO_MANY_REQUESTS, err.to_string())
            }
            IngestError::UploadTooLarge(_) => {
                Self::new(StatusCode::PAYLOAD_TOO_LARGE, err.to_string())
            }
            IngestError::UnknownNotebook(_) => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            IngestError::AlreadyInitialized => Self::new(StatusCode::CONFLICT, err.to_string()),
            IngestError::Store(_) | IngestError::Internal(_) => {
                tracing::error!(error = %err, "Ingestion failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
            }
        }
    }
}

impl From<inkmirror_store::StoreError> for ApiError {
    fn from(err: inkmirror_store::StoreError) -> Self {
        tracing::error!(error = %err, "Store operation failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_error_mapping() {
        assert_eq!(
            ApiError::from(IngestError::TooManyPending(100)).status,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::from(IngestError::UploadTooLarge(1 << 30)).status,
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::from(IngestError::AlreadyInitialized).status,
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_rate_limited_carries_hint() {
        let err = ApiError::rate_limited(42);
        assert_eq!(err.retry_after, Some(42));
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
    }
}
