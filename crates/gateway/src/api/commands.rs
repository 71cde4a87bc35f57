//! Remediation endpoints: action CRUD for agent-pulled delivery, plus the
//! synchronous operator-driven execution path.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use hlh_domain::action::RemediationAction;
use hlh_domain::Error;
use hlh_store::{actions, servers};

use crate::api::error::ApiResult;
use crate::runtime::remediation::{self, SyncExecutor};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateActionRequest {
    pub action_type: String,
    pub command: String,
}

#[derive(Deserialize)]
pub struct ExecuteRequest {
    pub command: String,
    pub action_type: String,
}

#[derive(Serialize)]
pub struct ExecuteResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

pub async fn create_action(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(body): Json<CreateActionRequest>,
) -> ApiResult<(StatusCode, Json<RemediationAction>)> {
    let mut tx = state.store.begin().await?;
    let action = remediation::create_action(
        &mut *tx,
        &state.whitelist,
        &server_id,
        &body.action_type,
        &body.command,
    )
    .await?;
    tx.commit().await.map_err(Error::from)?;
    Ok((StatusCode::CREATED, Json(action)))
}

pub async fn list_actions(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut conn = state.store.acquire().await?;
    servers::require(&mut conn, &server_id).await?;
    let items = actions::list_for_server(&mut conn, &server_id, 100).await?;
    Ok(Json(serde_json::json!({
        "total": items.len(),
        "actions": items,
    })))
}

pub async fn get_action(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<RemediationAction>> {
    let mut conn = state.store.acquire().await?;
    Ok(Json(actions::require(&mut conn, id).await?))
}

pub async fn approve_action(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<RemediationAction>> {
    let mut tx = state.store.begin().await?;
    let action = remediation::approve_action(&mut *tx, id, "admin").await?;
    tx.commit().await.map_err(Error::from)?;
    Ok(Json(action))
}

pub async fn cancel_action(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<RemediationAction>> {
    let mut tx = state.store.begin().await?;
    let action = remediation::cancel_action(&mut *tx, id).await?;
    tx.commit().await.map_err(Error::from)?;
    Ok(Json(action))
}

/// Synchronous execution over SSH. A non-zero exit code is still `200 OK`;
/// only rate limits, whitelist rejections, timeouts, and transport failures
/// produce error statuses.
pub async fn execute_command(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(body): Json<ExecuteRequest>,
) -> ApiResult<Json<ExecuteResponse>> {
    let executor = SyncExecutor {
        store: &state.store,
        vault: &state.vault,
        pool: &state.ssh_pool,
        whitelist: &state.whitelist,
        limiter: &state.rate_limiter,
        command_timeout: Duration::from_secs(state.config.ssh.command_timeout_secs),
    };
    let output = executor
        .execute(&server_id, &body.command, &body.action_type)
        .await?;
    Ok(Json(ExecuteResponse {
        exit_code: output.exit_code,
        stdout: output.stdout,
        stderr: output.stderr,
        duration_ms: output.duration_ms,
    }))
}
