//! Local status surface
//!
//! Tracks the agent's observable state and serves it read-only on a
//! loopback port for the UI:
//! `{connected, authenticated, queue_depth, last_sync_at, quota_snapshot}`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

use inkmirror_core::domain::QuotaSnapshot;

/// Shared, cheaply updatable agent state
pub struct AgentStatus {
    connected: AtomicBool,
    authenticated: AtomicBool,
    queue_depth: AtomicUsize,
    deferred_count: AtomicUsize,
    last_sync_unix: AtomicI64,
    quota: Mutex<Option<QuotaSnapshot>>,
}

/// JSON shape served by the status endpoint
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    connected: bool,
    authenticated: bool,
    queue_depth: usize,
    deferred_count: usize,
    last_sync_at: Option<DateTime<Utc>>,
    quota_snapshot: Option<QuotaSnapshot>,
}

impl AgentStatus {
    /// Creates a fresh status (disconnected, unauthenticated)
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            queue_depth: AtomicUsize::new(0),
            deferred_count: AtomicUsize::new(0),
            last_sync_unix: AtomicI64::new(0),
            quota: Mutex::new(None),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::Relaxed);
    }

    pub fn inc_queue_depth(&self) {
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_queue_depth(&self) {
        let _ = self
            .queue_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                d.checked_sub(1)
            });
    }

    /// Records a successful upload round-trip
    pub fn record_sync(&self) {
        self.connected.store(true, Ordering::Relaxed);
        self.last_sync_unix
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Records a quota-deferred upload
    pub fn record_deferred(&self) {
        self.connected.store(true, Ordering::Relaxed);
        self.deferred_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Stores the latest quota snapshot from the server
    pub fn set_quota(&self, snapshot: QuotaSnapshot) {
        *self.quota.lock().unwrap() = Some(snapshot);
    }

    /// Builds the serializable snapshot
    pub fn snapshot(&self) -> StatusSnapshot {
        let last_sync_unix = self.last_sync_unix.load(Ordering::Relaxed);
        StatusSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            authenticated: self.authenticated.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            deferred_count: self.deferred_count.load(Ordering::Relaxed),
            last_sync_at: (last_sync_unix > 0)
                .then(|| DateTime::from_timestamp(last_sync_unix, 0))
                .flatten(),
            quota_snapshot: self.quota.lock().unwrap().clone(),
        }
    }
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Status server
// ============================================================================

/// Read-only HTTP endpoint serving the status snapshot
pub struct StatusServer {
    status: Arc<AgentStatus>,
    addr: SocketAddr,
}

impl StatusServer {
    /// Creates a server bound to `endpoint` (loopback recommended)
    pub fn new(status: Arc<AgentStatus>, endpoint: &str) -> anyhow::Result<Self> {
        let addr: SocketAddr = endpoint.parse()?;
        Ok(Self { status, addr })
    }

    /// Serves until the cancellation token fires
    pub async fn run(&self, shutdown: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Status server listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result?;
                    let io = TokioIo::new(stream);
                    let status = Arc::clone(&self.status);

                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let status = Arc::clone(&status);
                            async move { handle_request(req, &status) }
                        });
                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            error!(error = %e, "Status HTTP connection error");
                        }
                    });
                }
                _ = shutdown.cancelled() => {
                    info!("Status server shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

fn handle_request(
    req: Request<hyper::body::Incoming>,
    status: &AgentStatus,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    if req.uri().path() == "/status" {
        let body = serde_json::to_string(&status.snapshot()).unwrap_or_else(|_| "{}".to_string());
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap())
    } else {
        Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .unwrap())
    }
}
