//! Shared application state
//!
//! One `AppState` is built at startup and cloned (cheaply, via `Arc`s) into
//! every handler and background task. Nothing else is process-global.

use std::sync::Arc;

use inkmirror_core::config::ServerConfig;
use inkmirror_core::ports::{ObjectStore, OcrEngine};
use inkmirror_destinations::DestinationRegistry;
use inkmirror_store::integrations::IntegrationRepository;
use inkmirror_store::notebooks::NotebookRepository;
use inkmirror_store::pages::PageRepository;
use inkmirror_store::quota::QuotaRepository;
use inkmirror_store::sync_records::SyncRecordRepository;
use inkmirror_store::users::UserRepository;
use inkmirror_store::work_queue::WorkQueueRepository;
use inkmirror_store::DatabasePool;
use inkmirror_telemetry::PipelineMetrics;

/// Everything a request handler or background service needs
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<ServerConfig>,
    /// Database pool shared by all repositories
    pub db: Arc<DatabasePool>,
    /// User and subscription rows
    pub users: Arc<UserRepository>,
    /// Notebook rows
    pub notebooks: Arc<NotebookRepository>,
    /// Page rows and the OCR status machine
    pub pages: Arc<PageRepository>,
    /// Quota ledgers and threshold events
    pub quota: Arc<QuotaRepository>,
    /// External-id dedup records
    pub sync_records: Arc<SyncRecordRepository>,
    /// Persistent work queue
    pub work_queue: Arc<WorkQueueRepository>,
    /// Destination credentials
    pub integrations: Arc<IntegrationRepository>,
    /// Blob storage
    pub object_store: Arc<dyn ObjectStore>,
    /// Vision OCR provider
    pub ocr: Arc<dyn OcrEngine>,
    /// Destination adapter factory
    pub destinations: Arc<DestinationRegistry>,
    /// Pipeline metrics
    pub metrics: Arc<PipelineMetrics>,
}

impl AppState {
    /// Assembles state from an initialized pool and adapters
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ServerConfig,
        db: DatabasePool,
        object_store: Arc<dyn ObjectStore>,
        ocr: Arc<dyn OcrEngine>,
        destinations: DestinationRegistry,
        metrics: PipelineMetrics,
    ) -> Self {
        let pool = db.pool().clone();
        Self {
            config: Arc::new(config),
            users: Arc::new(UserRepository::new(pool.clone())),
            notebooks: Arc::new(NotebookRepository::new(pool.clone())),
            pages: Arc::new(PageRepository::new(pool.clone())),
            quota: Arc::new(QuotaRepository::new(pool.clone())),
            sync_records: Arc::new(SyncRecordRepository::new(pool.clone())),
            work_queue: Arc::new(WorkQueueRepository::new(pool.clone())),
            integrations: Arc::new(IntegrationRepository::new(pool)),
            db: Arc::new(db),
            object_store,
            ocr,
            destinations: Arc::new(destinations),
            metrics: Arc::new(metrics),
        }
    }
}
