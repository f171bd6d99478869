//! Inkmirror Core - Domain logic and business rules
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `Page`, `Notebook`, `WorkItem`, `SyncRecord`, `QuotaLedger`
//! - **Content fingerprinting** - deterministic SHA-256 over canonical serializations
//! - **Port definitions** - Traits for adapters: `ObjectStore`, `OcrEngine`, `Destination`
//! - **State machine** - OCR transcription status transitions
//!
//! # Architecture
//!
//! This crate follows the hexagonal (ports & adapters) architecture pattern.
//! The domain module contains pure business logic with no external dependencies.
//! Ports define trait interfaces that adapter crates implement. The ingestion
//! service, sync worker, and device agent orchestrate domain entities through
//! port interfaces.

pub mod config;
pub mod domain;
pub mod fingerprint;
pub mod ports;
