//! Inkmirror server binary
//!
//! Hosts the `/v1` ingestion API, the Prometheus metrics endpoint, and the
//! periodic quota-reset loop that feeds the retroactive processor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use inkmirror_blob::FsObjectStore;
use inkmirror_core::config::ServerConfig;
use inkmirror_destinations::DestinationRegistry;
use inkmirror_ocr::OcrClient;
use inkmirror_server::api::routes::router;
use inkmirror_server::retroactive::RetroactiveProcessor;
use inkmirror_server::state::AppState;
use inkmirror_store::DatabasePool;
use inkmirror_telemetry::{MetricsServer, PipelineMetrics};

/// How often the reset loop scans for rolled-over billing periods
const RESET_SCAN_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Parser)]
#[command(name = "inkmirror-server", about = "Inkmirror ingestion and sync API")]
struct Args {
    /// Path to the server configuration file
    #[arg(long, default_value = "/etc/inkmirror/server.yaml")]
    config: PathBuf,

    /// Address for the public API
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// Address for the Prometheus metrics endpoint
    #[arg(long, default_value = "127.0.0.1:9187")]
    metrics_bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ServerConfig::load_or_default(&args.config);

    init_tracing(&config);

    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            error!(%err, "Invalid configuration");
        }
        anyhow::bail!("Configuration invalid ({} errors)", validation_errors.len());
    }

    let db = DatabasePool::new(&config.database.path)
        .await
        .context("Failed to open database")?;
    let object_store =
        Arc::new(FsObjectStore::new(&config.object_store.root).context("Failed to open blob store")?);
    let ocr = Arc::new(
        OcrClient::new(
            &config.ocr.api_url,
            &config.ocr.api_key,
            Duration::from_secs(config.ocr.timeout_seconds),
        )
        .context("Failed to build OCR client")?,
    );
    let destinations = DestinationRegistry::new(
        config.secrets.integration_master_key.as_bytes().to_vec(),
        Duration::from_secs(config.worker.destination_timeout_seconds),
    );
    let metrics = PipelineMetrics::new().context("Failed to build metrics registry")?;

    let state = AppState::new(config, db, object_store, ocr, destinations, metrics);
    let shutdown = CancellationToken::new();

    // Metrics endpoint
    let metrics_server = MetricsServer::new(Arc::clone(&state.metrics), &args.metrics_bind)?;
    let metrics_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics_server.run(metrics_shutdown).await {
            error!(error = %e, "Metrics server exited");
        }
    });

    // Periodic quota reset + retroactive processing
    let reset_state = state.clone();
    let reset_shutdown = shutdown.clone();
    tokio::spawn(async move {
        run_reset_loop(reset_state, reset_shutdown).await;
    });

    // Public API
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;
    info!(addr = %args.bind, "Inkmirror server listening");

    let serve_shutdown = shutdown.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        serve_shutdown.cancelled().await;
    });

    tokio::select! {
        result = async { server.await } => {
            result.context("API server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    }

    Ok(())
}

fn init_tracing(config: &ServerConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Scans for rolled-over billing periods and drains deferred pages
async fn run_reset_loop(state: AppState, shutdown: CancellationToken) {
    let processor = RetroactiveProcessor::new(state.clone());
    let mut interval = tokio::time::interval(RESET_SCAN_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => {
                info!("Reset loop shutting down");
                return;
            }
        }

        let due = match state.quota.ledgers_due_for_reset(100).await {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "Failed to scan for due ledgers");
                continue;
            }
        };

        for (user_id, _kind) in due {
            match processor.reset_and_process(&user_id).await {
                Ok(summary) => info!(
                    user = %user_id,
                    claimed = summary.claimed,
                    completed = summary.completed,
                    failed = summary.failed,
                    "Quota reset processed"
                ),
                Err(e) => warn!(user = %user_id, error = %e, "Quota reset failed"),
            }
        }
    }
}
