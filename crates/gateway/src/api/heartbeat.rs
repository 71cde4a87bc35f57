//! `POST /api/v1/agents/heartbeat` — the agent ingest endpoint.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::Json;

use hlh_domain::heartbeat::{HeartbeatRequest, HeartbeatResponse};

use crate::api::error::ApiResult;
use crate::runtime::heartbeat::process_heartbeat;
use crate::state::AppState;

pub async fn receive_heartbeat(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let response = process_heartbeat(
        &state.store,
        state.notifier.clone(),
        body,
        Some(peer.ip().to_string()),
    )
    .await?;
    Ok(Json(response))
}
