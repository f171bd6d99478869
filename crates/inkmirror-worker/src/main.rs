//! Inkmirror sync worker binary
//!
//! Runs one worker process against the shared database. Scale out by
//! running more processes; lease-and-claim keeps them coordinated.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use inkmirror_core::config::ServerConfig;
use inkmirror_destinations::DestinationRegistry;
use inkmirror_store::integrations::IntegrationRepository;
use inkmirror_store::notebooks::NotebookRepository;
use inkmirror_store::pages::PageRepository;
use inkmirror_store::sync_records::SyncRecordRepository;
use inkmirror_store::work_queue::WorkQueueRepository;
use inkmirror_store::DatabasePool;
use inkmirror_telemetry::PipelineMetrics;
use inkmirror_worker::{RegistryAdapterSource, SyncEngine, SyncWorker, WorkerSettings};

#[derive(Debug, Parser)]
#[command(name = "inkmirror-worker", about = "Inkmirror background sync worker")]
struct Args {
    /// Path to the server configuration file
    #[arg(long, default_value = "/etc/inkmirror/server.yaml")]
    config: PathBuf,

    /// Worker identity; defaults to a random id
    #[arg(long)]
    worker_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ServerConfig::load_or_default(&args.config);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    let db = DatabasePool::new(&config.database.path)
        .await
        .context("Failed to open database")?;
    let pool = db.pool().clone();

    let integrations = Arc::new(IntegrationRepository::new(pool.clone()));
    let registry = Arc::new(DestinationRegistry::new(
        config.secrets.integration_master_key.as_bytes().to_vec(),
        Duration::from_secs(config.worker.destination_timeout_seconds),
    ));
    let metrics = Arc::new(PipelineMetrics::new()?);

    let engine = Arc::new(SyncEngine::new(
        Arc::new(PageRepository::new(pool.clone())),
        Arc::new(NotebookRepository::new(pool.clone())),
        Arc::new(SyncRecordRepository::new(pool.clone())),
        Arc::new(WorkQueueRepository::new(pool.clone())),
        Arc::clone(&integrations),
        Arc::new(RegistryAdapterSource::new(integrations, registry)),
        Arc::clone(&metrics),
    ));

    let mut settings = WorkerSettings {
        poll_interval: Duration::from_secs(config.worker.poll_interval_seconds),
        idle_backoff_max: Duration::from_secs(config.worker.idle_backoff_max_seconds),
        lease: Duration::from_secs(config.worker.lease_seconds),
        batch_size: config.worker.claim_batch_size,
        ..WorkerSettings::default()
    };
    if let Some(worker_id) = args.worker_id {
        settings.worker_id = worker_id;
    }

    let worker = SyncWorker::new(
        Arc::new(WorkQueueRepository::new(pool)),
        engine,
        metrics,
        settings,
    );

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_shutdown.cancel();
        }
    });

    worker.run(shutdown).await
}
