//! HTTP metrics server for Prometheus scraping
//!
//! Exposes a `/metrics` endpoint on a loopback port that returns the
//! Prometheus text exposition format.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::metrics::PipelineMetrics;

/// HTTP server that serves Prometheus metrics on a configurable endpoint.
pub struct MetricsServer {
    metrics: Arc<PipelineMetrics>,
    addr: SocketAddr,
}

impl MetricsServer {
    /// Creates a new `MetricsServer`.
    ///
    /// # Arguments
    /// * `metrics` - The shared metrics registry
    /// * `endpoint` - Address to bind, e.g. `"127.0.0.1:9187"`
    pub fn new(metrics: Arc<PipelineMetrics>, endpoint: &str) -> anyhow::Result<Self> {
        let addr: SocketAddr = endpoint.parse()?;
        Ok(Self { metrics, addr })
    }

    /// Starts the HTTP server. This future runs until the provided
    /// cancellation token is triggered.
    ///
    /// Should be spawned as a background task.
    pub async fn run(&self, shutdown: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Metrics server listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, _) = result?;
                    let io = TokioIo::new(stream);
                    let metrics = Arc::clone(&self.metrics);

                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let metrics = Arc::clone(&metrics);
                            async move { handle_request(req, &metrics) }
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            error!(error = %e, "Metrics HTTP connection error");
                        }
                    });
                }
                _ = shutdown.cancelled() => {
                    info!("Metrics server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Handle a single HTTP request.
fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: &PipelineMetrics,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    if req.uri().path() == "/metrics" {
        match metrics.encode() {
            Ok(body) => Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .unwrap()),
            Err(e) => {
                let body = format!("Failed to encode metrics: {e}");
                Ok(Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::from(body)))
                    .unwrap())
            }
        }
    } else {
        Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .unwrap())
    }
}
