//! Agent registration endpoints: one-shot tokens, claim, install script,
//! and credential lifecycle.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hlh_domain::server::AgentMode;
use hlh_domain::{Error, Result as DomainResult};
use hlh_store::credentials;

use crate::api::error::ApiResult;
use crate::install;
use crate::state::AppState;
use crate::tokens;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
pub struct CreateTokenRequest {
    #[serde(default = "default_mode")]
    pub mode: AgentMode,
    pub display_name: Option<String>,
    pub monitored_services: Option<Vec<String>>,
    pub expiry_minutes: Option<i64>,
}

fn default_mode() -> AgentMode {
    AgentMode::Readonly
}

#[derive(Serialize)]
pub struct CreateTokenResponse {
    /// Plaintext, shown exactly once.
    pub token: String,
    pub token_prefix: String,
    pub expires_at: DateTime<Utc>,
    pub install_command: String,
}

#[derive(Serialize)]
pub struct TokenInfo {
    pub id: i64,
    pub token_prefix: String,
    pub mode: AgentMode,
    pub display_name: Option<String>,
    pub monitored_services: Option<Vec<String>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct ClaimRequest {
    pub token: String,
    pub server_id: String,
    pub hostname: String,
}

#[derive(Serialize)]
pub struct ClaimResponse {
    pub success: bool,
    pub server_id: String,
    pub server_guid: String,
    pub api_token: String,
    pub config_yaml: String,
}

#[derive(Serialize)]
pub struct CredentialInfo {
    pub server_guid: String,
    pub api_token_prefix: String,
    pub is_legacy: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_revoked: bool,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registration tokens (admin)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn create_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateTokenRequest>,
) -> ApiResult<(StatusCode, Json<CreateTokenResponse>)> {
    let mut tx = state.store.begin().await?;
    let (token, plaintext) = tokens::create_registration_token(
        &mut *tx,
        body.mode,
        body.display_name,
        body.monitored_services,
        body.expiry_minutes,
    )
    .await?;
    tx.commit().await.map_err(Error::from)?;

    let hub_url = state.hub_url(&headers);
    Ok((
        StatusCode::CREATED,
        Json(CreateTokenResponse {
            install_command: install::install_command(&hub_url, &plaintext),
            token: plaintext,
            token_prefix: token.token_prefix,
            expires_at: token.expires_at,
        }),
    ))
}

pub async fn list_tokens(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let mut conn = state.store.acquire().await?;
    let tokens = credentials::list_pending_registration_tokens(&mut conn).await?;
    let items: Vec<TokenInfo> = tokens
        .into_iter()
        .map(|t| TokenInfo {
            id: t.id,
            token_prefix: t.token_prefix,
            mode: t.mode,
            display_name: t.display_name,
            monitored_services: t.monitored_services.map(|j| j.0),
            expires_at: t.expires_at,
            created_at: t.created_at,
        })
        .collect();
    Ok(Json(serde_json::json!({
        "total": items.len(),
        "tokens": items,
    })))
}

pub async fn cancel_token(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Response {
    match cancel_token_inner(&state, id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => crate::api::error::bad_request_with_code(
            "ALREADY_CLAIMED",
            "Token has already been claimed",
        ),
        Err(e) => crate::api::error::ApiError(e).into_response(),
    }
}

async fn cancel_token_inner(state: &AppState, id: i64) -> DomainResult<bool> {
    let mut tx = state.store.begin().await?;
    let token = credentials::require_registration_token(&mut *tx, id).await?;
    if token.is_claimed() {
        return Ok(false);
    }
    credentials::delete_registration_token(&mut *tx, id).await?;
    tx.commit().await?;
    tracing::info!(token_id = id, "registration token cancelled");
    Ok(true)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Claim + install script (no admin auth — the token is the auth)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn claim_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ClaimRequest>,
) -> Response {
    let hub_url = state.hub_url(&headers);
    match claim_inner(&state, &body, &hub_url).await {
        Ok(outcome) => Json(ClaimResponse {
            success: true,
            server_id: outcome.server_id,
            server_guid: outcome.server_guid,
            api_token: outcome.api_token,
            config_yaml: outcome.config_yaml,
        })
        .into_response(),
        // The installer greps for `"success":false`; claim failures are 400
        // with the reason inline rather than the generic error shape.
        Err(Error::Validation(message)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "success": false, "error": message })),
        )
            .into_response(),
        Err(other) => crate::api::error::ApiError(other).into_response(),
    }
}

async fn claim_inner(
    state: &AppState,
    body: &ClaimRequest,
    hub_url: &str,
) -> DomainResult<tokens::ClaimOutcome> {
    let mut tx = state.store.begin().await?;
    let outcome = tokens::claim_registration_token(
        &mut *tx,
        &body.token,
        &body.server_id,
        &body.hostname,
        hub_url,
    )
    .await?;
    tx.commit().await?;
    Ok(outcome)
}

pub async fn install_script(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let script = install::render_install_script(&state.hub_url(&headers));
    (
        [(header::CONTENT_TYPE, "text/x-shellscript")],
        script,
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent credentials (admin)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn credential_info(
    State(state): State<AppState>,
    Path(guid): Path<String>,
) -> ApiResult<Json<CredentialInfo>> {
    let mut conn = state.store.acquire().await?;
    let credential = credentials::active_credential_for_guid(&mut conn, &guid)
        .await?
        .ok_or_else(|| Error::not_found("credential", &guid))?;
    let is_revoked = credential.is_revoked();
    Ok(Json(CredentialInfo {
        server_guid: credential.server_guid,
        api_token_prefix: credential.api_token_prefix,
        is_legacy: credential.is_legacy,
        last_used_at: credential.last_used_at,
        is_revoked,
        created_at: credential.created_at,
    }))
}

pub async fn rotate_credential(
    State(state): State<AppState>,
    Path(guid): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut tx = state.store.begin().await?;
    let (api_token, api_token_prefix) = tokens::rotate_agent_token(&mut *tx, &guid).await?;
    tx.commit().await.map_err(Error::from)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "server_guid": guid,
        "api_token": api_token,
        "api_token_prefix": api_token_prefix,
    })))
}

pub async fn revoke_credential(
    State(state): State<AppState>,
    Path(guid): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut tx = state.store.begin().await?;
    tokens::revoke_agent_token(&mut *tx, &guid).await?;
    tx.commit().await.map_err(Error::from)?;
    Ok(Json(serde_json::json!({
        "success": true,
        "server_guid": guid,
    })))
}
