//! Inkmirror OCR - vision OCR HTTP client
//!
//! Implements the [`OcrEngine`] port against a vision OCR HTTP API. The
//! client submits a rendered PDF and receives transcribed text, a mean
//! confidence, and the billed page count.
//!
//! Failures are split along the retry boundary the pipeline cares about:
//! network faults, timeouts, 429, and 5xx responses are `Transient`;
//! everything the provider rejects outright (4xx) is `Permanent`. The
//! ledger is only debited after a successful extraction, so an aborted
//! call never charges the user.

pub mod client;

pub use client::{OcrClient, DEFAULT_TIMEOUT_SECS};
