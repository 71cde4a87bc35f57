//! Alert listing and the acknowledge/resolve lifecycle.
//!
//! Service alerts cannot be acknowledged or resolved while the latest
//! sample still shows the service down (`SERVICE_STILL_DOWN`).

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use hlh_domain::alert::{Alert, AlertStatus};
use hlh_domain::Result as DomainResult;
use hlh_store::alerts;

use crate::api::error::{bad_request_with_code, ApiError, ApiResult};
use crate::runtime::alerting::service_still_down;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<AlertStatus>,
    pub server_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    100
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut conn = state.store.acquire().await?;
    let items = alerts::list(
        &mut conn,
        query.server_id.as_deref(),
        query.status,
        query.limit,
    )
    .await?;
    Ok(Json(serde_json::json!({
        "total": items.len(),
        "alerts": items,
    })))
}

pub async fn get(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Alert>> {
    let mut conn = state.store.acquire().await?;
    Ok(Json(alerts::require(&mut conn, id).await?))
}

enum Guard {
    Ok(Alert),
    InvalidState(&'static str),
    StillDown,
}

async fn guarded_alert(
    state: &AppState,
    id: i64,
    for_ack: bool,
) -> DomainResult<Guard> {
    let mut conn = state.store.acquire().await?;
    let alert = alerts::require(&mut conn, id).await?;

    if alert.status == AlertStatus::Resolved {
        return Ok(Guard::InvalidState(if for_ack {
            "Cannot acknowledge a resolved alert"
        } else {
            "Alert is already resolved"
        }));
    }

    if service_still_down(&mut conn, &alert).await? {
        return Ok(Guard::StillDown);
    }

    Ok(Guard::Ok(alert))
}

pub async fn acknowledge(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match guarded_alert(&state, id, true).await {
        Err(e) => ApiError(e).into_response(),
        Ok(Guard::InvalidState(message)) => bad_request_with_code("INVALID_STATE", message),
        Ok(Guard::StillDown) => bad_request_with_code(
            "SERVICE_STILL_DOWN",
            "Cannot acknowledge while the service is still down",
        ),
        Ok(Guard::Ok(alert)) => {
            let result = async {
                let mut conn = state.store.acquire().await?;
                alerts::acknowledge(&mut conn, alert.id).await?;
                alerts::require(&mut conn, alert.id).await
            }
            .await;
            match result {
                Ok(alert) => Json(alert).into_response(),
                Err(e) => ApiError(e).into_response(),
            }
        }
    }
}

pub async fn resolve(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match guarded_alert(&state, id, false).await {
        Err(e) => ApiError(e).into_response(),
        Ok(Guard::InvalidState(message)) => bad_request_with_code("INVALID_STATE", message),
        Ok(Guard::StillDown) => bad_request_with_code(
            "SERVICE_STILL_DOWN",
            "Cannot resolve while the service is still down",
        ),
        Ok(Guard::Ok(alert)) => {
            let result = async {
                let mut conn = state.store.acquire().await?;
                // Operator resolution: auto_resolved stays false.
                alerts::resolve(&mut conn, alert.id, false).await?;
                alerts::require(&mut conn, alert.id).await
            }
            .await;
            match result {
                Ok(alert) => Json(alert).into_response(),
                Err(e) => ApiError(e).into_response(),
            }
        }
    }
}
