//! Prometheus metrics registry for the sync pipeline
//!
//! Covers the observable operations of the ingestion service, OCR adapter,
//! work queue, and sync workers.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Central metrics registry holding all Prometheus metrics.
pub struct PipelineMetrics {
    registry: Registry,
    /// Counter: uploads by outcome (completed, pending_quota, hash_hit, rejected)
    pub uploads_total: IntCounterVec,
    /// Counter: upload payload bytes accepted
    pub upload_bytes_total: IntCounterVec,
    /// Counter: OCR calls by outcome (success, transient_error, permanent_error)
    pub ocr_calls_total: IntCounterVec,
    /// Histogram: OCR call duration in seconds
    pub ocr_duration_seconds: HistogramVec,
    /// Counter: quota pages consumed
    pub quota_pages_consumed_total: IntCounterVec,
    /// Gauge: work items currently queued
    pub work_queue_depth: IntGaugeVec,
    /// Counter: destination sync operations by (destination, operation, status)
    pub destination_syncs_total: IntCounterVec,
    /// Counter: leases reclaimed by the expiry sweep
    pub lease_sweeps_total: IntCounterVec,
}

impl PipelineMetrics {
    /// Creates a new `PipelineMetrics` with all metrics registered.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new_custom(Some("inkmirror".to_string()), None)?;

        let uploads_total = IntCounterVec::new(
            Opts::new("uploads_total", "Ingested uploads by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(uploads_total.clone()))?;

        let upload_bytes_total = IntCounterVec::new(
            Opts::new("upload_bytes_total", "Upload payload bytes accepted"),
            &["kind"],
        )?;
        registry.register(Box::new(upload_bytes_total.clone()))?;

        let ocr_calls_total = IntCounterVec::new(
            Opts::new("ocr_calls_total", "OCR extraction calls by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(ocr_calls_total.clone()))?;

        let ocr_duration_seconds = HistogramVec::new(
            HistogramOpts::new("ocr_duration_seconds", "OCR call duration in seconds")
                .buckets(vec![0.5, 2.0, 10.0, 30.0, 60.0, f64::INFINITY]),
            &["outcome"],
        )?;
        registry.register(Box::new(ocr_duration_seconds.clone()))?;

        let quota_pages_consumed_total = IntCounterVec::new(
            Opts::new("quota_pages_consumed_total", "OCR quota pages debited"),
            &["kind"],
        )?;
        registry.register(Box::new(quota_pages_consumed_total.clone()))?;

        let work_queue_depth = IntGaugeVec::new(
            Opts::new("work_queue_depth", "Work items awaiting claim"),
            &["status"],
        )?;
        registry.register(Box::new(work_queue_depth.clone()))?;

        let destination_syncs_total = IntCounterVec::new(
            Opts::new("destination_syncs_total", "Destination sync operations"),
            &["destination", "operation", "status"],
        )?;
        registry.register(Box::new(destination_syncs_total.clone()))?;

        let lease_sweeps_total = IntCounterVec::new(
            Opts::new("lease_sweeps_total", "Work item leases reclaimed"),
            &["reason"],
        )?;
        registry.register(Box::new(lease_sweeps_total.clone()))?;

        Ok(Self {
            registry,
            uploads_total,
            upload_bytes_total,
            ocr_calls_total,
            ocr_duration_seconds,
            quota_pages_consumed_total,
            work_queue_depth,
            destination_syncs_total,
            lease_sweeps_total,
        })
    }

    // ========================================================================
    // Recording helpers
    // ========================================================================

    /// Record an upload outcome.
    pub fn record_upload(&self, outcome: &str, bytes: u64) {
        self.uploads_total.with_label_values(&[outcome]).inc();
        self.upload_bytes_total
            .with_label_values(&["source"])
            .inc_by(bytes);
    }

    /// Record an OCR call with its duration.
    pub fn record_ocr(&self, outcome: &str, duration_secs: f64) {
        self.ocr_calls_total.with_label_values(&[outcome]).inc();
        self.ocr_duration_seconds
            .with_label_values(&[outcome])
            .observe(duration_secs);
    }

    /// Record quota pages debited.
    pub fn record_quota_consumed(&self, pages: u64) {
        self.quota_pages_consumed_total
            .with_label_values(&["ocr_pages"])
            .inc_by(pages);
    }

    /// Set the queued-work gauge.
    pub fn set_queue_depth(&self, depth: i64) {
        self.work_queue_depth
            .with_label_values(&["queued"])
            .set(depth);
    }

    /// Record a destination sync operation.
    pub fn record_destination_sync(&self, destination: &str, operation: &str, status: &str) {
        self.destination_syncs_total
            .with_label_values(&[destination, operation, status])
            .inc();
    }

    /// Record leases reclaimed by the sweep.
    pub fn record_lease_sweep(&self, count: u64) {
        self.lease_sweeps_total
            .with_label_values(&["expired"])
            .inc_by(count);
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    /// Encode all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
