//! Port definitions (trait interfaces for adapters)
//!
//! Ports use `anyhow::Result` where failures are adapter-specific and need
//! no domain-level classification, and typed errors where the caller's
//! behavior depends on the failure kind (OCR and destination calls).

pub mod destination;
pub mod object_store;
pub mod ocr;

pub use destination::{
    Destination, DestinationCapabilities, DestinationError, MetadataPayload, SyncItemPayload,
    SyncOutcome,
};
pub use object_store::ObjectStore;
pub use ocr::{OcrEngine, OcrError, OcrExtraction};
