//! Upload queue and API client
//!
//! A single logical producer (the watcher loop) feeds a bounded queue that
//! a small worker pool drains. Transport failures retry with exponential
//! backoff `min(2^n, 60)` seconds up to the configured attempts. A
//! quota-deferred response is terminal at this layer: the server has
//! accepted the blob, so the item is marked deferred locally and never
//! re-enqueued.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{multipart, Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use inkmirror_core::domain::QuotaSnapshot;

use crate::status::AgentStatus;

/// Timeout for upload requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Backoff ceiling between retries
const BACKOFF_CAP_SECS: u64 = 60;

// ============================================================================
// Upload tasks
// ============================================================================

/// One file queued for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    /// Absolute path on disk
    pub path: PathBuf,
    /// Notebook the file belongs to
    pub notebook_uuid: String,
    /// Page identity (equals the notebook uuid for manifest files)
    pub page_uuid: String,
    /// Position within the notebook, when known
    pub page_number: i32,
    /// Notebook display name, when known
    pub visible_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentManifest {
    #[serde(default)]
    pages: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MetadataFile {
    #[serde(rename = "visibleName")]
    visible_name: Option<String>,
}

/// Builds an [`UploadTask`] from a watched path, following the device
/// layout `{root}/{notebook_uuid}/{page_uuid}.rm` with
/// `{notebook_uuid}.content` and `{notebook_uuid}.metadata` siblings
///
/// Returns `None` for paths that don't parse as page files.
pub fn task_for_path(root: &Path, path: &Path) -> Option<UploadTask> {
    let extension = path.extension()?.to_str()?;
    if extension != "rm" {
        return None;
    }

    let page_uuid = path.file_stem()?.to_str()?.to_string();
    let notebook_dir = path.parent()?;
    let notebook_uuid = notebook_dir.file_name()?.to_str()?.to_string();

    // Page order comes from the content manifest, when present
    let manifest_path = root.join(format!("{notebook_uuid}.content"));
    let page_number = std::fs::read_to_string(&manifest_path)
        .ok()
        .and_then(|content| serde_json::from_str::<ContentManifest>(&content).ok())
        .and_then(|manifest| manifest.pages.iter().position(|p| *p == page_uuid))
        .map(|idx| idx as i32)
        .unwrap_or(0);

    let metadata_path = root.join(format!("{notebook_uuid}.metadata"));
    let visible_name = std::fs::read_to_string(&metadata_path)
        .ok()
        .and_then(|content| serde_json::from_str::<MetadataFile>(&content).ok())
        .and_then(|m| m.visible_name);

    Some(UploadTask {
        path: path.to_path_buf(),
        notebook_uuid,
        page_uuid,
        page_number,
        visible_name,
    })
}

// ============================================================================
// API client
// ============================================================================

/// Outcome of one upload call
#[derive(Debug, Clone, PartialEq)]
pub enum UploadReply {
    /// Server transcribed the page (or served a cached transcription)
    Completed,
    /// Server accepted the blob but deferred OCR; do not retry
    Deferred,
    /// Server could not transcribe the page; nothing to retry
    OcrFailed(String),
}

/// Upload failures, classified along the agent's retry boundary
#[derive(Debug, Error)]
pub enum UploadError {
    /// Network faults, 5xx, rate limiting; retry with backoff
    #[error("Transient upload failure: {0}")]
    Transient(String),
    /// Token rejected; the user must re-authenticate
    #[error("Authentication failed")]
    Auth,
    /// The server rejected this upload; do not retry
    #[error("Upload rejected: {0}")]
    Permanent(String),
}

#[derive(Debug, Deserialize)]
struct UploadResponseBody {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for the Inkmirror `/v1` API
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    /// Creates a client for `base_url` authenticated with `token`
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    /// Uploads one page file
    pub async fn upload_page(&self, task: &UploadTask) -> Result<UploadReply, UploadError> {
        let bytes = tokio::fs::read(&task.path)
            .await
            .map_err(|e| UploadError::Permanent(format!("cannot read file: {e}")))?;

        let mut form = multipart::Form::new()
            .text("notebook_uuid", task.notebook_uuid.clone())
            .text("page_uuid", task.page_uuid.clone())
            .text("page_number", task.page_number.to_string())
            .part(
                "file",
                multipart::Part::bytes(bytes).file_name(
                    task.path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "page.rm".to_string()),
                ),
            );
        if let Some(ref name) = task.visible_name {
            form = form.text("visible_name", name.clone());
        }

        let response = self
            .client
            .post(format!("{}/v1/processing/rm-file", self.base_url))
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| UploadError::Transient(format!("transport: {e}")))?;

        match response.status() {
            StatusCode::OK => {
                let body: UploadResponseBody = response
                    .json()
                    .await
                    .map_err(|e| UploadError::Permanent(format!("bad response body: {e}")))?;
                match body.status.as_str() {
                    "completed" => Ok(UploadReply::Completed),
                    "pending_quota" => Ok(UploadReply::Deferred),
                    "ocr_failed" => Ok(UploadReply::OcrFailed(
                        body.error.unwrap_or_else(|| "unknown".to_string()),
                    )),
                    other => Err(UploadError::Permanent(format!("unknown status: {other}"))),
                }
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(UploadError::Auth),
            StatusCode::TOO_MANY_REQUESTS => {
                Err(UploadError::Transient("rate limited".to_string()))
            }
            s if s.is_server_error() => {
                Err(UploadError::Transient(format!("server returned {s}")))
            }
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(UploadError::Permanent(format!("server returned {s}: {body}")))
            }
        }
    }

    /// Fetches the caller's quota snapshot
    pub async fn quota_status(&self) -> Result<QuotaSnapshot> {
        let response = self
            .client
            .get(format!("{}/v1/quota/status", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("Failed to fetch quota status")?
            .error_for_status()
            .context("Quota status returned error")?;
        response.json().await.context("Bad quota status body")
    }

    /// Pushes a notebook property change
    pub async fn update_metadata(
        &self,
        notebook_uuid: &str,
        visible_name: Option<&str>,
    ) -> Result<(), UploadError> {
        let response = self
            .client
            .post(format!("{}/v1/processing/metadata/update", self.base_url))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "notebook_uuid": notebook_uuid,
                "visible_name": visible_name,
            }))
            .send()
            .await
            .map_err(|e| UploadError::Transient(format!("transport: {e}")))?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(UploadError::Auth),
            s if s.is_server_error() => {
                Err(UploadError::Transient(format!("server returned {s}")))
            }
            s => Err(UploadError::Permanent(format!("server returned {s}"))),
        }
    }
}

// ============================================================================
// Upload queue and worker pool
// ============================================================================

/// Bounded upload queue drained by a worker pool
pub struct UploadQueue {
    tx: mpsc::Sender<UploadTask>,
}

impl UploadQueue {
    /// Creates the queue and spawns `workers` drain tasks
    pub fn start(
        client: Arc<ApiClient>,
        status: Arc<AgentStatus>,
        workers: usize,
        retry_attempts: u32,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<UploadTask>(256);
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..workers.max(1) {
            let client = Arc::clone(&client);
            let status = Arc::clone(&status);
            let rx = Arc::clone(&rx);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let task = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            task = rx.recv() => task,
                            _ = shutdown.cancelled() => None,
                        }
                    };
                    let Some(task) = task else {
                        debug!(worker, "Upload worker stopping");
                        return;
                    };
                    status.dec_queue_depth();
                    process_task(&client, &status, &task, retry_attempts).await;
                }
            });
        }

        Self { tx }
    }

    /// Enqueues a task, waiting if the queue is full
    pub async fn push(&self, status: &AgentStatus, task: UploadTask) {
        status.inc_queue_depth();
        if self.tx.send(task).await.is_err() {
            status.dec_queue_depth();
            warn!("Upload queue closed, dropping task");
        }
    }
}

/// Runs one task through upload-with-retry
async fn process_task(
    client: &ApiClient,
    status: &AgentStatus,
    task: &UploadTask,
    retry_attempts: u32,
) {
    for attempt in 0..retry_attempts.max(1) {
        match client.upload_page(task).await {
            Ok(UploadReply::Completed) => {
                info!(path = %task.path.display(), "Uploaded and transcribed");
                status.record_sync();
                return;
            }
            Ok(UploadReply::Deferred) => {
                // Server holds the blob; nothing more for the agent to do
                info!(path = %task.path.display(), "Upload deferred by quota");
                status.record_deferred();
                return;
            }
            Ok(UploadReply::OcrFailed(error)) => {
                warn!(path = %task.path.display(), error, "Server could not transcribe");
                status.record_sync();
                return;
            }
            Err(UploadError::Transient(msg)) => {
                let delay = Duration::from_secs((1u64 << attempt.min(6)).min(BACKOFF_CAP_SECS));
                warn!(
                    path = %task.path.display(),
                    attempt,
                    delay_secs = delay.as_secs(),
                    msg,
                    "Transient upload failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(UploadError::Auth) => {
                warn!("Agent token rejected; re-authentication required");
                status.set_authenticated(false);
                return;
            }
            Err(UploadError::Permanent(msg)) => {
                warn!(path = %task.path.display(), msg, "Upload rejected");
                return;
            }
        }
    }
    warn!(path = %task.path.display(), "Upload abandoned after retries");
    status.set_connected(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn task_in(dir: &tempfile::TempDir) -> UploadTask {
        let file = dir.path().join("page.rm");
        std::fs::write(&file, b"strokes").unwrap();
        UploadTask {
            path: file,
            notebook_uuid: uuid::Uuid::new_v4().to_string(),
            page_uuid: uuid::Uuid::new_v4().to_string(),
            page_number: 0,
            visible_name: Some("Journal".to_string()),
        }
    }

    #[tokio::test]
    async fn test_upload_completed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/processing/rm-file"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "completed", "text": "hello", "confidence": 0.9,
                "page_count": 1, "cached": false
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = ApiClient::new(server.uri(), "tok").unwrap();
        let reply = client.upload_page(&task_in(&dir)).await.unwrap();
        assert_eq!(reply, UploadReply::Completed);
    }

    #[tokio::test]
    async fn test_upload_deferred_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/processing/rm-file"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "pending_quota", "pending_quota_pages": 4,
                "detail": "deferred"
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = ApiClient::new(server.uri(), "tok").unwrap();
        let reply = client.upload_page(&task_in(&dir)).await.unwrap();
        assert_eq!(reply, UploadReply::Deferred);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/processing/rm-file"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = ApiClient::new(server.uri(), "tok").unwrap();
        let err = client.upload_page(&task_in(&dir)).await.unwrap_err();
        assert!(matches!(err, UploadError::Transient(_)));
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/processing/rm-file"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = ApiClient::new(server.uri(), "tok").unwrap();
        let err = client.upload_page(&task_in(&dir)).await.unwrap_err();
        assert!(matches!(err, UploadError::Auth));
    }

    #[test]
    fn test_task_for_path_parses_device_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let notebook = uuid::Uuid::new_v4().to_string();
        let page_a = uuid::Uuid::new_v4().to_string();
        let page_b = uuid::Uuid::new_v4().to_string();

        std::fs::create_dir(root.join(&notebook)).unwrap();
        let page_path = root.join(&notebook).join(format!("{page_b}.rm"));
        std::fs::write(&page_path, b"strokes").unwrap();
        std::fs::write(
            root.join(format!("{notebook}.content")),
            serde_json::json!({ "pages": [page_a, page_b] }).to_string(),
        )
        .unwrap();
        std::fs::write(
            root.join(format!("{notebook}.metadata")),
            serde_json::json!({ "visibleName": "Lab notes" }).to_string(),
        )
        .unwrap();

        let task = task_for_path(root, &page_path).unwrap();
        assert_eq!(task.notebook_uuid, notebook);
        assert_eq!(task.page_uuid, page_b);
        assert_eq!(task.page_number, 1);
        assert_eq!(task.visible_name.as_deref(), Some("Lab notes"));
    }

    #[test]
    fn test_task_for_path_ignores_non_page_files() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("book.content");
        std::fs::write(&manifest, b"{}").unwrap();
        assert!(task_for_path(dir.path(), &manifest).is_none());
    }

    #[test]
    fn test_task_for_path_without_manifest_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let notebook = uuid::Uuid::new_v4().to_string();
        std::fs::create_dir(dir.path().join(&notebook)).unwrap();
        let page_path = dir.path().join(&notebook).join("deadbeef.rm");
        std::fs::write(&page_path, b"strokes").unwrap();

        let task = task_for_path(dir.path(), &page_path).unwrap();
        assert_eq!(task.page_number, 0);
        assert!(task.visible_name.is_none());
    }
}
