//! Structured-notes destination
//!
//! Syncs transcribed pages into a structured-notes service: one container
//! object per notebook, one item per page under its container. This is the
//! reference implementation of the [`Destination`] port; other targets
//! follow the same shape.
//!
//! ## Error mapping
//!
//! | Response | Mapped to |
//! |---|---|
//! | 401 / 403 | `Auth` |
//! | 404 / 410 on an existing object | `ObjectGone` |
//! | 429 | `RateLimited` (Retry-After honored) |
//! | 5xx / transport | `Transient` |
//! | other 4xx | `Permanent` |

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use inkmirror_core::domain::newtypes::{ContentHash, ExternalId, NotebookUuid};
use inkmirror_core::ports::{
    Destination, DestinationCapabilities, DestinationError, MetadataPayload, SyncItemPayload,
    SyncOutcome,
};

use crate::rate_limit::{DestinationRateLimiter, OpClass};

/// Registry name of this destination
pub const NOTES_DESTINATION: &str = "notes";

/// Default timeout for destination API calls
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Credentials and wire types
// ============================================================================

/// Decrypted credentials for the notes service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotesCredentials {
    /// Bearer token for the notes API
    pub api_token: String,
    /// Workspace to create objects in
    pub workspace_id: String,
}

#[derive(Debug, Serialize)]
struct CreateContainerRequest<'a> {
    workspace_id: &'a str,
    title: &'a str,
    source_ref: String,
}

#[derive(Debug, Serialize)]
struct ItemRequest<'a> {
    title: String,
    body: &'a str,
    position: i32,
    source_ref: String,
    content_hash: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdateContainerRequest<'a> {
    title: &'a str,
    last_modified: &'a str,
    item_count: i64,
    folder_path: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ObjectResponse {
    id: String,
    #[serde(default)]
    revision: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    items: Vec<ObjectResponse>,
}

// ============================================================================
// NotesDestination
// ============================================================================

/// Client for the structured-notes service
pub struct NotesDestination {
    client: Client,
    base_url: String,
    credentials: NotesCredentials,
    limiter: Arc<DestinationRateLimiter>,
}

impl NotesDestination {
    /// Creates a destination client
    pub fn new(
        base_url: impl Into<String>,
        credentials: NotesCredentials,
        limiter: Arc<DestinationRateLimiter>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            credentials,
            limiter,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Maps a non-success response to the port error taxonomy.
    ///
    /// `object_scoped` marks calls addressed at a specific external object,
    /// where 404/410 means the object is gone rather than a bad request.
    async fn map_error(
        &self,
        op: OpClass,
        response: Response,
        object_scoped: bool,
    ) -> DestinationError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                DestinationError::Auth(format!("notes API returned {status}"))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                self.limiter.on_throttle(op);
                DestinationError::RateLimited {
                    retry_after_secs: retry_after.unwrap_or(30),
                }
            }
            StatusCode::NOT_FOUND | StatusCode::GONE if object_scoped => {
                DestinationError::ObjectGone(format!("notes API returned {status}: {body}"))
            }
            s if s.is_server_error() => {
                DestinationError::Transient(format!("notes API returned {status}: {body}"))
            }
            _ => DestinationError::Permanent(format!("notes API returned {status}: {body}")),
        }
    }

    async fn send_json<T: Serialize>(
        &self,
        op: OpClass,
        method: reqwest::Method,
        path: &str,
        body: Option<&T>,
        object_scoped: bool,
    ) -> Result<Response, DestinationError> {
        self.limiter.acquire(op).await;

        let mut request = self
            .client
            .request(method, self.url(path))
            .bearer_auth(&self.credentials.api_token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DestinationError::Transient(format!("notes transport error: {e}")))?;

        if response.status().is_success() {
            self.limiter.on_success(op);
            Ok(response)
        } else {
            Err(self.map_error(op, response, object_scoped).await)
        }
    }

    fn outcome(obj: ObjectResponse) -> Result<SyncOutcome, DestinationError> {
        let external_id = ExternalId::new(obj.id)
            .map_err(|e| DestinationError::Permanent(format!("notes returned bad id: {e}")))?;
        Ok(SyncOutcome {
            external_id,
            metadata: obj
                .revision
                .map(|r| serde_json::json!({ "revision": r })),
        })
    }
}

#[async_trait::async_trait]
impl Destination for NotesDestination {
    fn name(&self) -> &str {
        NOTES_DESTINATION
    }

    fn capabilities(&self) -> DestinationCapabilities {
        DestinationCapabilities {
            create: true,
            update: true,
            delete: true,
            dedupe_check: true,
            validate: true,
        }
    }

    async fn create_container(
        &self,
        notebook_uuid: &NotebookUuid,
        title: &str,
    ) -> Result<SyncOutcome, DestinationError> {
        debug!(notebook = %notebook_uuid, title, "Creating notes container");
        let body = CreateContainerRequest {
            workspace_id: &self.credentials.workspace_id,
            title,
            source_ref: notebook_uuid.to_string(),
        };
        let response = self
            .send_json(
                OpClass::ContentWrite,
                reqwest::Method::POST,
                "/v1/containers",
                Some(&body),
                false,
            )
            .await?;
        let obj: ObjectResponse = response
            .json()
            .await
            .map_err(|e| DestinationError::Permanent(format!("bad container response: {e}")))?;
        Self::outcome(obj)
    }

    async fn sync_item(&self, item: &SyncItemPayload) -> Result<SyncOutcome, DestinationError> {
        let container = item.container_id.as_ref().ok_or_else(|| {
            DestinationError::Permanent(format!(
                "page {} has no container at this destination yet",
                item.page_uuid
            ))
        })?;

        debug!(page = %item.page_uuid, container = %container, "Creating notes item");
        let body = ItemRequest {
            title: format!("{} - p.{}", item.notebook_title, item.page_number),
            body: &item.text,
            position: item.page_number,
            source_ref: item.page_uuid.to_string(),
            content_hash: item.content_hash.as_str(),
        };
        let path = format!("/v1/containers/{}/items", container.as_str());
        let response = self
            .send_json(
                OpClass::ContentWrite,
                reqwest::Method::POST,
                &path,
                Some(&body),
                false,
            )
            .await?;
        let obj: ObjectResponse = response
            .json()
            .await
            .map_err(|e| DestinationError::Permanent(format!("bad item response: {e}")))?;
        Self::outcome(obj)
    }

    async fn update_item(
        &self,
        external_id: &ExternalId,
        item: &SyncItemPayload,
    ) -> Result<SyncOutcome, DestinationError> {
        debug!(page = %item.page_uuid, external = %external_id, "Updating notes item");
        let body = ItemRequest {
            title: format!("{} - p.{}", item.notebook_title, item.page_number),
            body: &item.text,
            position: item.page_number,
            source_ref: item.page_uuid.to_string(),
            content_hash: item.content_hash.as_str(),
        };
        let path = format!("/v1/items/{}", external_id.as_str());
        let response = self
            .send_json(
                OpClass::ContentWrite,
                reqwest::Method::PATCH,
                &path,
                Some(&body),
                true,
            )
            .await?;
        let obj: ObjectResponse = response
            .json()
            .await
            .map_err(|e| DestinationError::Permanent(format!("bad item response: {e}")))?;
        Self::outcome(obj)
    }

    async fn delete_item(&self, external_id: &ExternalId) -> Result<(), DestinationError> {
        let path = format!("/v1/items/{}", external_id.as_str());
        self.send_json::<()>(OpClass::ContentWrite, reqwest::Method::DELETE, &path, None, true)
            .await?;
        Ok(())
    }

    async fn update_metadata(
        &self,
        container_id: &ExternalId,
        metadata: &MetadataPayload,
    ) -> Result<SyncOutcome, DestinationError> {
        debug!(container = %container_id, "Updating notes container metadata");
        let body = UpdateContainerRequest {
            title: &metadata.title,
            last_modified: &metadata.last_modified,
            item_count: metadata.page_count,
            folder_path: metadata.folder_path.as_deref(),
        };
        let path = format!("/v1/containers/{}", container_id.as_str());
        let response = self
            .send_json(
                OpClass::MetadataWrite,
                reqwest::Method::PATCH,
                &path,
                Some(&body),
                true,
            )
            .await?;
        let obj: ObjectResponse = response
            .json()
            .await
            .map_err(|e| DestinationError::Permanent(format!("bad container response: {e}")))?;
        Self::outcome(obj)
    }

    async fn check_duplicate(
        &self,
        content_hash: &ContentHash,
    ) -> Result<Option<ExternalId>, DestinationError> {
        let path = format!("/v1/items?content_hash={}", content_hash.as_str());
        let response = self
            .send_json::<()>(OpClass::Read, reqwest::Method::GET, &path, None, false)
            .await?;
        let found: SearchResponse = response
            .json()
            .await
            .map_err(|e| DestinationError::Permanent(format!("bad search response: {e}")))?;

        found
            .items
            .into_iter()
            .next()
            .map(|obj| {
                ExternalId::new(obj.id).map_err(|e| {
                    DestinationError::Permanent(format!("notes returned bad id: {e}"))
                })
            })
            .transpose()
    }

    async fn validate_connection(&self) -> Result<bool, DestinationError> {
        match self
            .send_json::<()>(OpClass::Read, reqwest::Method::GET, "/v1/me", None, false)
            .await
        {
            Ok(_) => Ok(true),
            Err(DestinationError::Auth(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkmirror_core::domain::newtypes::PageUuid;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> NotesCredentials {
        NotesCredentials {
            api_token: "tok_test".to_string(),
            workspace_id: "ws_1".to_string(),
        }
    }

    fn destination(server: &MockServer) -> NotesDestination {
        NotesDestination::new(
            server.uri(),
            credentials(),
            Arc::new(DestinationRateLimiter::new(Default::default())),
            Duration::from_secs(2),
        )
        .unwrap()
    }

    fn payload(container: Option<&str>) -> SyncItemPayload {
        SyncItemPayload {
            page_uuid: PageUuid::new(),
            notebook_uuid: NotebookUuid::new(),
            notebook_title: "Journal".to_string(),
            page_number: 3,
            text: "transcribed text".to_string(),
            confidence: 0.92,
            content_hash: ContentHash::new("c".repeat(64)).unwrap(),
            container_id: container.map(|c| ExternalId::new(c).unwrap()),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_create_container() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/containers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "cont_42", "revision": "r1"
            })))
            .mount(&server)
            .await;

        let dest = destination(&server);
        let outcome = dest
            .create_container(&NotebookUuid::new(), "Journal")
            .await
            .unwrap();
        assert_eq!(outcome.external_id.as_str(), "cont_42");
        assert_eq!(
            outcome.metadata,
            Some(serde_json::json!({"revision": "r1"}))
        );
    }

    #[tokio::test]
    async fn test_sync_item_requires_container() {
        let server = MockServer::start().await;
        let dest = destination(&server);
        let err = dest.sync_item(&payload(None)).await.unwrap_err();
        assert!(matches!(err, DestinationError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_sync_item_creates_under_container() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/containers/cont_42/items"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"id": "item_7"})),
            )
            .mount(&server)
            .await;

        let dest = destination(&server);
        let outcome = dest.sync_item(&payload(Some("cont_42"))).await.unwrap();
        assert_eq!(outcome.external_id.as_str(), "item_7");
    }

    #[tokio::test]
    async fn test_update_gone_object_maps_to_object_gone() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path_regex(r"^/v1/items/.*$"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dest = destination(&server);
        let err = dest
            .update_item(&ExternalId::new("item_gone").unwrap(), &payload(Some("c")))
            .await
            .unwrap_err();
        assert!(matches!(err, DestinationError::ObjectGone(_)));
    }

    #[tokio::test]
    async fn test_rate_limit_maps_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/containers"))
            .respond_with(
                ResponseTemplate::new(429).insert_header("Retry-After", "17"),
            )
            .mount(&server)
            .await;

        let dest = destination(&server);
        let err = dest
            .create_container(&NotebookUuid::new(), "nb")
            .await
            .unwrap_err();
        match err {
            DestinationError::RateLimited { retry_after_secs } => {
                assert_eq!(retry_after_secs, 17)
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_auth_failure_maps_to_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/me"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let dest = destination(&server);
        assert!(!dest.validate_connection().await.unwrap());
    }

    #[tokio::test]
    async fn test_check_duplicate_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"id": "item_dup"}]
            })))
            .mount(&server)
            .await;

        let dest = destination(&server);
        let found = dest
            .check_duplicate(&ContentHash::new("a".repeat(64)).unwrap())
            .await
            .unwrap();
        assert_eq!(found.map(|id| id.as_str().to_string()), Some("item_dup".to_string()));
    }

    #[tokio::test]
    async fn test_check_duplicate_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/items"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"items": []})),
            )
            .mount(&server)
            .await;

        let dest = destination(&server);
        let found = dest
            .check_duplicate(&ContentHash::new("a".repeat(64)).unwrap())
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"^/v1/items/.*$"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let dest = destination(&server);
        let err = dest
            .delete_item(&ExternalId::new("item_1").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
