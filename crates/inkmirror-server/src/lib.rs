//! Inkmirror Server - ingestion and processing services
//!
//! The server side of the pipeline:
//! - **Ingestion** (`ingest`) - accepts uploads, enforces quota policy,
//!   invokes OCR, updates the page store, enqueues sync work
//! - **Retroactive processor** (`retroactive`) - drains deferred pages
//!   newest-first after a quota reset
//! - **HTTP API** (`api`) - the `/v1` surface the device agent and dashboard
//!   talk to
//!
//! Process-wide state is limited to the database pool, the object store
//! client, the OCR client, and the destination registry; everything is
//! constructed explicitly in [`state::AppState`] and shut down via a
//! cancellation token.

pub mod api;
pub mod ingest;
pub mod retroactive;
pub mod state;
