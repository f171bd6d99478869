//! Inkmirror agent binary
//!
//! Watches the notebook directory, deduplicates changes, and uploads them
//! to the Inkmirror API. Also serves the local status endpoint for the UI.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use inkmirror_agent::uploader::task_for_path;
use inkmirror_agent::{
    AgentStatus, ApiClient, DebounceBuffer, DedupCache, DedupDecision, NotebookWatcher,
    StatusServer, TokenStore, UploadQueue, WatchEvent,
};
use inkmirror_core::config::AgentConfig;

/// Debounce window for filesystem bursts
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// How often the debounce buffer is polled
const DRAIN_INTERVAL: Duration = Duration::from_millis(250);

/// How often the quota snapshot is refreshed
const QUOTA_REFRESH: Duration = Duration::from_secs(300);

#[derive(Debug, Parser)]
#[command(name = "inkmirror-agent", about = "Inkmirror device agent")]
struct Args {
    /// Path to the agent configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Exchange a session identity for a long-lived agent token
    Login {
        /// Verified session subject from the web login
        #[arg(long)]
        session_subject: String,
    },
    /// Remove the stored agent token
    Logout,
    /// Run the watcher and uploader (default)
    Run {
        /// Address for the local status endpoint
        #[arg(long, default_value = "127.0.0.1:9286")]
        status_bind: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(AgentConfig::default_path);
    let config = AgentConfig::load_or_default(&config_path);

    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            warn!(%err, "Invalid agent configuration");
        }
        bail!("Agent configuration invalid ({} errors)", validation_errors.len());
    }

    let tokens = TokenStore::new(&config.api_url)?;

    match args.command.unwrap_or(Command::Run {
        status_bind: "127.0.0.1:9286".to_string(),
    }) {
        Command::Login { session_subject } => login(&config, &tokens, &session_subject).await,
        Command::Logout => {
            tokens.clear()?;
            info!("Agent token removed");
            Ok(())
        }
        Command::Run { status_bind } => run(config, tokens, &status_bind).await,
    }
}

/// Exchanges the session identity for an agent token and stores it
async fn login(config: &AgentConfig, tokens: &TokenStore, session_subject: &str) -> Result<()> {
    #[derive(serde::Deserialize)]
    struct TokenResponse {
        token: String,
        expires_at: String,
    }

    let client = reqwest::Client::new();
    let response: TokenResponse = client
        .post(format!("{}/v1/auth/agent-token", config.api_url))
        .json(&serde_json::json!({ "session_subject": session_subject }))
        .send()
        .await
        .context("Token exchange request failed")?
        .error_for_status()
        .context("Token exchange rejected")?
        .json()
        .await
        .context("Bad token exchange response")?;

    tokens.store(&response.token)?;
    info!(expires_at = %response.expires_at, "Logged in; agent token stored");
    Ok(())
}

/// The main watch-dedup-upload loop
async fn run(config: AgentConfig, tokens: TokenStore, status_bind: &str) -> Result<()> {
    let Some(token) = tokens.load()? else {
        bail!("No agent token found. Run `inkmirror-agent login` first.");
    };

    let status = Arc::new(AgentStatus::new());
    status.set_authenticated(true);

    let client = Arc::new(ApiClient::new(&config.api_url, token)?);
    let shutdown = CancellationToken::new();

    // Status endpoint for the UI
    let status_server = StatusServer::new(Arc::clone(&status), status_bind)?;
    let status_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = status_server.run(status_shutdown).await {
            warn!(error = %e, "Status server exited");
        }
    });

    // Quota refresh loop
    {
        let client = Arc::clone(&client);
        let status = Arc::clone(&status);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(QUOTA_REFRESH);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.cancelled() => return,
                }
                match client.quota_status().await {
                    Ok(snapshot) => {
                        status.set_connected(true);
                        status.set_quota(snapshot);
                    }
                    Err(e) => {
                        debug!(error = %e, "Quota refresh failed");
                        status.set_connected(false);
                    }
                }
            }
        });
    }

    let queue = UploadQueue::start(
        Arc::clone(&client),
        Arc::clone(&status),
        config.batch_size.min(8),
        config.retry_attempts.max(1),
        shutdown.clone(),
    );

    let cache_path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("inkmirror")
        .join("dedup.json");
    let mut dedup = DedupCache::load(&cache_path);

    // Filesystem watcher feeding the debounce buffer; the watcher handle
    // must stay alive for events to keep flowing
    let mut _watcher = None;
    let mut watcher_rx = if config.watch_enabled {
        let (mut watcher, rx) = NotebookWatcher::new()?;
        watcher.watch(&config.source_directory)?;
        _watcher = Some(watcher);
        Some(rx)
    } else {
        None
    };

    let mut debounce = DebounceBuffer::new(DEBOUNCE_WINDOW);
    let mut drain_tick = tokio::time::interval(DRAIN_INTERVAL);
    let mut scan_tick = tokio::time::interval(Duration::from_secs(config.sync_interval_seconds));

    info!(
        source = %config.source_directory.display(),
        watch = config.watch_enabled,
        "Agent running"
    );

    loop {
        tokio::select! {
            Some(event) = recv_watch_event(&mut watcher_rx) => {
                debounce.push(event);
            }
            _ = drain_tick.tick() => {
                for event in debounce.drain_settled() {
                    handle_event(&config, &mut dedup, &queue, &status, event).await;
                }
            }
            _ = scan_tick.tick() => {
                if config.auto_sync {
                    let paths = scan_pages(&config.source_directory);
                    debug!(count = paths.len(), "Periodic scan");
                    for path in paths {
                        handle_event(&config, &mut dedup, &queue, &status,
                            WatchEvent::Upserted(path)).await;
                    }
                }
                if let Err(e) = dedup.save() {
                    warn!(error = %e, "Failed to persist dedup cache");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                shutdown.cancel();
                dedup.save().ok();
                return Ok(());
            }
        }
    }
}

async fn recv_watch_event(
    rx: &mut Option<tokio::sync::mpsc::Receiver<WatchEvent>>,
) -> Option<WatchEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Routes one settled event through dedup into the upload queue
async fn handle_event(
    config: &AgentConfig,
    dedup: &mut DedupCache,
    queue: &UploadQueue,
    status: &Arc<AgentStatus>,
    event: WatchEvent,
) {
    match event {
        WatchEvent::Upserted(path) => {
            match dedup.check(&path) {
                Ok(DedupDecision::Skip) => {}
                Ok(DedupDecision::Upload(_)) => {
                    let Some(task) = task_for_path(&config.source_directory, &path) else {
                        return;
                    };
                    if !config.sync_all_notebooks
                        && !config.selected_notebooks.contains(&task.notebook_uuid)
                    {
                        debug!(notebook = %task.notebook_uuid, "Notebook not selected, skipping");
                        return;
                    }
                    queue.push(status, task).await;
                }
                Err(e) => debug!(path = %path.display(), error = %e, "Dedup check failed"),
            }
        }
        WatchEvent::Removed(path) => {
            // The source is authoritative and sync is additive; just stop
            // tracking the path locally
            dedup.forget(&path);
        }
    }
}

/// Collects all page files under the source directory
fn scan_pages(root: &Path) -> Vec<PathBuf> {
    let mut pages = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("rm") {
                pages.push(path);
            }
        }
    }
    pages
}
