//! Route handlers and router assembly

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, FromRef, Multipart, Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use inkmirror_core::domain::newtypes::{NotebookUuid, PageUuid};
use inkmirror_core::domain::QuotaKind;

use super::auth::{exchange_agent_token, AuthedUser};
use super::rate_limit::{RateHeaders, UploadRateLimiter};
use super::ApiError;
use crate::ingest::{IngestionService, MetadataOutcome, UploadOutcome, UploadRequest};
use crate::state::AppState;

/// Axum state for the `/v1` router
#[derive(Clone)]
pub struct ApiContext {
    /// Shared application state
    pub state: AppState,
    /// The ingestion service
    pub ingestion: Arc<IngestionService>,
    /// Per-user upload limiter
    pub upload_limiter: Arc<UploadRateLimiter>,
}

impl FromRef<ApiContext> for AppState {
    fn from_ref(ctx: &ApiContext) -> AppState {
        ctx.state.clone()
    }
}

/// Builds the `/v1` router
pub fn router(state: AppState) -> Router {
    let upload_limiter = Arc::new(UploadRateLimiter::new(
        state.config.ingestion.uploads_per_minute,
    ));
    // Multipart uploads can exceed axum's default body cap; allow the
    // configured maximum plus form-field overhead
    let body_limit = state.config.ingestion.max_upload_bytes as usize + 64 * 1024;
    let ctx = ApiContext {
        ingestion: Arc::new(IngestionService::new(state.clone())),
        upload_limiter,
        state,
    };

    Router::new()
        .route("/v1/auth/agent-token", post(exchange_agent_token))
        .route("/v1/quota/status", get(quota_status))
        .route("/v1/processing/rm-file", post(upload_file))
        .route("/v1/processing/metadata/update", post(metadata_update))
        .route("/v1/notebooks/", get(list_notebooks))
        .route("/v1/notebooks/:id/pages", get(list_pages))
        .route("/v1/sync/initial", post(initial_sync))
        .route("/v1/sync/notebook/:id", post(sync_notebook))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(ctx)
}

fn attach_rate_headers(mut response: Response, headers: RateHeaders) -> Response {
    let h = response.headers_mut();
    h.insert(
        "X-RateLimit-Limit",
        HeaderValue::from_str(&headers.limit.to_string()).unwrap_or(HeaderValue::from_static("0")),
    );
    h.insert(
        "X-RateLimit-Remaining",
        HeaderValue::from_str(&headers.remaining.to_string())
            .unwrap_or(HeaderValue::from_static("0")),
    );
    h.insert(
        "X-RateLimit-Reset",
        HeaderValue::from_str(&headers.reset_secs.to_string())
            .unwrap_or(HeaderValue::from_static("60")),
    );
    response
}

// ============================================================================
// Quota
// ============================================================================

async fn quota_status(
    State(ctx): State<ApiContext>,
    AuthedUser(user): AuthedUser,
) -> Result<Response, ApiError> {
    ctx.state
        .quota
        .ensure_ledger(&user.id, QuotaKind::OcrPages, user.tier.ocr_page_limit())
        .await?;
    let snapshot = ctx.state.quota.observe(&user.id, QuotaKind::OcrPages).await?;
    Ok(Json(snapshot).into_response())
}

// ============================================================================
// Ingestion
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum UploadResponse {
    Completed {
        text: String,
        confidence: f64,
        page_count: i64,
        cached: bool,
    },
    PendingQuota {
        pending_quota_pages: i64,
        detail: String,
    },
    OcrFailed {
        error: String,
    },
}

async fn upload_file(
    State(ctx): State<ApiContext>,
    AuthedUser(user): AuthedUser,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let rate = match ctx.upload_limiter.check(&user.id) {
        Ok(headers) => headers,
        Err(retry_after) => return Err(ApiError::rate_limited(retry_after)),
    };

    let mut notebook_uuid = None;
    let mut page_uuid = None;
    let mut page_number = 0;
    let mut visible_name = None;
    let mut source = None;
    let mut pdf = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError::new(StatusCode::BAD_REQUEST, format!("Malformed multipart: {e}"))
    })? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "notebook_uuid" => {
                let text = field.text().await.map_err(bad_field)?;
                notebook_uuid = Some(
                    NotebookUuid::from_str(&text)
                        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?,
                );
            }
            "page_uuid" => {
                let text = field.text().await.map_err(bad_field)?;
                page_uuid = Some(
                    PageUuid::from_str(&text)
                        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?,
                );
            }
            "page_number" => {
                let text = field.text().await.map_err(bad_field)?;
                page_number = text.parse().unwrap_or(0);
            }
            "visible_name" => {
                visible_name = Some(field.text().await.map_err(bad_field)?);
            }
            "file" => {
                source = Some(field.bytes().await.map_err(bad_field)?.to_vec());
            }
            "pdf" => {
                pdf = Some(field.bytes().await.map_err(bad_field)?.to_vec());
            }
            other => {
                tracing::debug!(field = %other, "Ignoring unknown multipart field");
            }
        }
    }

    let request = UploadRequest {
        notebook_uuid: notebook_uuid
            .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "Missing notebook_uuid"))?,
        page_uuid: page_uuid
            .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "Missing page_uuid"))?,
        page_number,
        visible_name,
        source: source
            .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "Missing file field"))?,
        pdf,
    };

    let outcome = ctx.ingestion.handle_upload(&user, request).await?;
    let body = match outcome {
        UploadOutcome::Completed {
            text,
            confidence,
            page_count,
            cached,
        } => UploadResponse::Completed {
            text,
            confidence,
            page_count,
            cached,
        },
        // Quota-exhausted uploads are a success at this endpoint: the blob
        // is stored and transcription will happen after the next reset
        UploadOutcome::Deferred {
            pending_quota_pages,
        } => UploadResponse::PendingQuota {
            pending_quota_pages,
            detail: "Upload accepted; OCR deferred until quota reset".to_string(),
        },
        UploadOutcome::OcrFailed { error } => UploadResponse::OcrFailed { error },
    };

    Ok(attach_rate_headers(Json(body).into_response(), rate))
}

fn bad_field(e: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, format!("Malformed field: {e}"))
}

#[derive(Debug, Deserialize)]
struct MetadataUpdateRequest {
    notebook_uuid: NotebookUuid,
    visible_name: Option<String>,
    last_modified: Option<chrono::DateTime<chrono::Utc>>,
}

async fn metadata_update(
    State(ctx): State<ApiContext>,
    AuthedUser(user): AuthedUser,
    Json(request): Json<MetadataUpdateRequest>,
) -> Result<Response, ApiError> {
    let outcome = ctx
        .ingestion
        .handle_metadata_update(
            &user,
            request.notebook_uuid,
            request.visible_name,
            request.last_modified,
        )
        .await?;

    let sync_type = match outcome {
        MetadataOutcome::Skipped => "SKIPPED",
        MetadataOutcome::Queued => "QUEUED",
    };
    Ok(Json(serde_json::json!({ "sync_type": sync_type })).into_response())
}

// ============================================================================
// Notebooks and pages
// ============================================================================

async fn list_notebooks(
    State(ctx): State<ApiContext>,
    AuthedUser(user): AuthedUser,
) -> Result<Response, ApiError> {
    let notebooks = ctx.state.notebooks.list(&user.id).await?;
    Ok(Json(notebooks).into_response())
}

#[derive(Debug, Serialize)]
struct PageSummary {
    page_uuid: PageUuid,
    page_number: i32,
    ocr_status: String,
    content_hash: Option<String>,
    ocr_confidence: Option<f64>,
}

async fn list_pages(
    State(ctx): State<ApiContext>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let notebook_uuid = NotebookUuid::from_str(&id)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    let pages = ctx
        .state
        .pages
        .list_for_notebook(&user.id, &notebook_uuid)
        .await?;
    let summaries: Vec<PageSummary> = pages
        .iter()
        .map(|p| PageSummary {
            page_uuid: *p.page_uuid(),
            page_number: p.page_number(),
            ocr_status: p.ocr_status().to_string(),
            content_hash: p.content_hash().map(|h| h.as_str().to_string()),
            ocr_confidence: p.ocr_confidence(),
        })
        .collect();
    Ok(Json(summaries).into_response())
}

// ============================================================================
// Sync bootstrap
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct InitialSyncRequest {
    #[serde(default)]
    page_limit: Option<i64>,
    #[serde(default)]
    force: bool,
}

async fn initial_sync(
    State(ctx): State<ApiContext>,
    AuthedUser(user): AuthedUser,
    body: Option<Json<InitialSyncRequest>>,
) -> Result<Response, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let (notebooks_queued, pages_queued) = ctx
        .ingestion
        .handle_initial_sync(&user, request.page_limit, request.force)
        .await?;
    Ok(Json(serde_json::json!({
        "notebooks_queued": notebooks_queued,
        "pages_queued": pages_queued,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct SyncNotebookQuery {
    #[serde(default)]
    #[allow(dead_code)]
    destination: Option<String>,
}

async fn sync_notebook(
    State(ctx): State<ApiContext>,
    AuthedUser(user): AuthedUser,
    Path(id): Path<String>,
    Query(_query): Query<SyncNotebookQuery>,
) -> Result<Response, ApiError> {
    let notebook_uuid = NotebookUuid::from_str(&id)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    let queued = ctx
        .ingestion
        .handle_notebook_sync(&user, notebook_uuid)
        .await?;
    Ok(Json(serde_json::json!({ "pages_queued": queued })).into_response())
}
