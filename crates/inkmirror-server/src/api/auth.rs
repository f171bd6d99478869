//! Bearer-token authentication
//!
//! The device agent authenticates with a long-lived agent token obtained
//! from the token-exchange endpoint. Tokens are random UUIDs stored only
//! as SHA-256 hashes; possession of the raw token is the credential.
//!
//! OAuth session issuance is outside this service. The exchange endpoint
//! accepts the caller's session identity (as verified by the fronting auth
//! layer) and mints the agent token for it.

use axum::extract::{FromRef, FromRequestParts, State};
use axum::http::request::Parts;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use inkmirror_store::users::UserRecord;

use super::ApiError;
use crate::state::AppState;

/// Extractor that resolves the Bearer token to a user
pub struct AuthedUser(pub UserRecord);

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthedUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);
        let token = bearer_token(parts).ok_or_else(ApiError::unauthorized)?;
        let user_id = state
            .users
            .resolve_agent_token(token)
            .await?
            .ok_or_else(ApiError::unauthorized)?;
        let user = state
            .users
            .get(&user_id)
            .await?
            .ok_or_else(ApiError::unauthorized)?;
        Ok(AuthedUser(user))
    }
}

// ============================================================================
// Token exchange
// ============================================================================

/// Request body for `POST /v1/auth/agent-token`
#[derive(Debug, Deserialize)]
pub struct AgentTokenRequest {
    /// The caller's verified session identity from the auth layer
    pub session_subject: String,
}

/// Response body for `POST /v1/auth/agent-token`
#[derive(Debug, Serialize)]
pub struct AgentTokenResponse {
    /// The newly minted long-lived token
    pub token: String,
    /// When the token expires (RFC 3339)
    pub expires_at: String,
}

/// Exchanges a verified session identity for a 30-day agent token
pub async fn exchange_agent_token(
    State(state): State<AppState>,
    Json(request): Json<AgentTokenRequest>,
) -> Result<Json<AgentTokenResponse>, ApiError> {
    if request.session_subject.trim().is_empty() {
        return Err(ApiError::unauthorized());
    }

    let user = state.users.find_or_create(&request.session_subject).await?;
    let token = format!("inkm_{}", Uuid::new_v4().simple());
    let expires_at = state.users.store_agent_token(&user.id, &token).await?;

    tracing::info!(user_id = %user.id, "Issued agent token");

    Ok(Json(AgentTokenResponse {
        token,
        expires_at: expires_at.to_rfc3339(),
    }))
}
