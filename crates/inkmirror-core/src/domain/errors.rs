//! Domain error types
//!
//! This module defines error types specific to domain operations,
//! including validation failures and invalid state transitions.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid UUID or other identifier format
    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    /// Invalid content hash (expected 64 lowercase hex characters)
    #[error("Invalid content hash: {0}")]
    InvalidHash(String),

    /// Invalid object store key
    #[error("Invalid object key: {0}")]
    InvalidObjectKey(String),

    /// Invalid destination name
    #[error("Invalid destination name: {0}")]
    InvalidDestination(String),

    /// Invalid OCR status transition attempt
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        /// The current status
        from: String,
        /// The attempted target status
        to: String,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// A quota operation would exceed the configured limit
    #[error("Quota exceeded: {used} of {limit} used, {requested} requested")]
    QuotaExceeded {
        /// Pages already consumed this period
        used: i64,
        /// Period limit
        limit: i64,
        /// Pages the caller asked for
        requested: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::InvalidHash("zzz".to_string());
        assert_eq!(err.to_string(), "Invalid content hash: zzz");

        let err = DomainError::InvalidTransition {
            from: "completed".to_string(),
            to: "pending_quota".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid status transition from completed to pending_quota"
        );
    }

    #[test]
    fn test_quota_exceeded_display() {
        let err = DomainError::QuotaExceeded {
            used: 30,
            limit: 30,
            requested: 1,
        };
        assert_eq!(err.to_string(), "Quota exceeded: 30 of 30 used, 1 requested");
    }

    #[test]
    fn test_error_equality() {
        let err1 = DomainError::InvalidId("x".to_string());
        let err2 = DomainError::InvalidId("x".to_string());
        assert_eq!(err1, err2);
    }
}
