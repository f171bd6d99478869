//! Inkmirror Telemetry - Prometheus metrics
//!
//! Typed, labeled counters, gauges, and histograms for the ingestion
//! pipeline, OCR calls, the work queue, and destination syncs, plus a small
//! hyper server that exposes them in text exposition format.

pub mod metrics;
pub mod server;

pub use metrics::PipelineMetrics;
pub use server::MetricsServer;
