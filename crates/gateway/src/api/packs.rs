//! Configuration-pack endpoints: compliance checks, diffs, apply/remove,
//! and the fleet-wide compliance summary.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use hlh_domain::compliance::ConfigCheck;
use hlh_domain::Error;
use hlh_store::{compliance as compliance_store, servers};

use crate::api::error::{ApiError, ApiResult};
use crate::runtime::compliance::{map_pack_error, ComplianceChecker};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
pub struct CheckRequest {
    pub pack_name: String,
}

#[derive(Deserialize)]
pub struct DiffQuery {
    pub pack: String,
}

#[derive(Deserialize)]
pub struct ApplyRequest {
    pub pack_name: String,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Deserialize)]
pub struct RemoveRequest {
    pub pack_name: String,
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Serialize)]
pub struct PackSummary {
    pub name: String,
    pub description: String,
    pub extends: Option<String>,
    pub item_count: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pack registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_packs(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let names = state
        .packs
        .list()
        .map_err(|e| Error::Internal(format!("listing packs: {e}")))?;

    let mut packs = Vec::with_capacity(names.len());
    for name in names {
        match state.packs.load(&name) {
            Ok(pack) => packs.push(PackSummary {
                name: pack.name.clone(),
                description: pack.description.clone(),
                extends: pack.extends.clone(),
                item_count: pack.item_count(),
            }),
            Err(e) => {
                tracing::warn!(pack = %name, error = %e, "skipping unloadable pack");
            }
        }
    }

    Ok(Json(serde_json::json!({
        "total": packs.len(),
        "packs": packs,
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compliance checks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn run_check(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(body): Json<CheckRequest>,
) -> ApiResult<Json<ConfigCheck>> {
    let checker = ComplianceChecker {
        store: &state.store,
        vault: &state.vault,
        pool: &state.ssh_pool,
        loader: &state.packs,
    };
    let check = checker.check(&server_id, &body.pack_name).await?;
    Ok(Json(check))
}

pub async fn list_checks(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut conn = state.store.acquire().await?;
    servers::require(&mut conn, &server_id).await?;
    let checks = compliance_store::list_checks(&mut conn, &server_id, 50).await?;
    Ok(Json(serde_json::json!({
        "total": checks.len(),
        "checks": checks,
    })))
}

/// Latest stored check for a pack, presented as a diff. Run a check first if
/// none exists.
pub async fn diff(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Query(query): Query<DiffQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    // Surface an unknown pack as 404 rather than an empty diff.
    state.packs.load(&query.pack).map_err(map_pack_error)?;

    let mut conn = state.store.acquire().await?;
    servers::require(&mut conn, &server_id).await?;
    let latest = compliance_store::latest_checks_for_server(&mut conn, &server_id)
        .await?
        .into_iter()
        .find(|c| c.pack_name == query.pack)
        .ok_or_else(|| {
            Error::not_found("config check", format!("{server_id}/{}", query.pack))
        })?;

    Ok(Json(serde_json::json!({
        "server_id": server_id,
        "pack_name": query.pack,
        "is_compliant": latest.is_compliant,
        "checked_at": latest.checked_at,
        "mismatches": latest.mismatches.0,
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Apply / remove
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn apply(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(body): Json<ApplyRequest>,
) -> Response {
    if body.dry_run {
        return match state.apply_engine.preview(&server_id, &body.pack_name).await {
            Ok(preview) => Json(preview).into_response(),
            Err(e) => ApiError(e).into_response(),
        };
    }

    match state
        .apply_engine
        .start(&server_id, &body.pack_name, "user")
        .await
    {
        Ok(apply) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "apply_id": apply.id,
                "server_id": apply.server_id,
                "pack_name": apply.pack_name,
                "status": apply.status,
                "started_at": apply.started_at,
            })),
        )
            .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

pub async fn apply_status(
    State(state): State<AppState>,
    Path((server_id, apply_id)): Path<(String, i64)>,
) -> ApiResult<Json<hlh_domain::compliance::ConfigApply>> {
    let mut conn = state.store.acquire().await?;
    let apply = compliance_store::require_apply(&mut conn, apply_id).await?;
    if apply.server_id != server_id {
        // Don't leak another server's apply ids.
        return Err(Error::not_found("apply operation", apply_id.to_string()).into());
    }
    Ok(Json(apply))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(body): Json<RemoveRequest>,
) -> Response {
    if !body.confirm {
        return match state
            .apply_engine
            .remove_preview(&server_id, &body.pack_name)
            .await
        {
            Ok(preview) => Json(preview).into_response(),
            Err(e) => ApiError(e).into_response(),
        };
    }

    match state.apply_engine.remove(&server_id, &body.pack_name).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fleet compliance summary
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Serialize)]
struct MachineCompliance {
    server_id: String,
    hostname: String,
    assigned_packs: Vec<String>,
    status: &'static str,
    mismatch_count: usize,
    last_checked: Option<chrono::DateTime<chrono::Utc>>,
}

pub async fn fleet_compliance(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut conn = state.store.acquire().await?;
    let all_servers = servers::list(&mut conn).await?;

    let mut compliant = 0usize;
    let mut non_compliant = 0usize;
    let mut never_checked = 0usize;
    let mut machines = Vec::with_capacity(all_servers.len());

    for server in &all_servers {
        let latest = compliance_store::latest_checks_for_server(&mut conn, &server.id).await?;
        // Only checks for currently assigned packs count.
        let relevant: Vec<&ConfigCheck> = latest
            .iter()
            .filter(|c| server.assigned_packs.0.contains(&c.pack_name))
            .collect();

        let (status, mismatch_count, last_checked) = if relevant.is_empty() {
            never_checked += 1;
            ("never_checked", 0, None)
        } else {
            let mismatch_count: usize = relevant.iter().map(|c| c.mismatches.0.len()).sum();
            let last_checked = relevant.iter().map(|c| c.checked_at).max();
            if relevant.iter().all(|c| c.is_compliant) {
                compliant += 1;
                ("compliant", mismatch_count, last_checked)
            } else {
                non_compliant += 1;
                ("non_compliant", mismatch_count, last_checked)
            }
        };

        machines.push(MachineCompliance {
            server_id: server.id.clone(),
            hostname: server.hostname.clone(),
            assigned_packs: server.assigned_packs.0.clone(),
            status,
            mismatch_count,
            last_checked,
        });
    }

    Ok(Json(serde_json::json!({
        "summary": {
            "compliant": compliant,
            "non_compliant": non_compliant,
            "never_checked": never_checked,
            "total": all_servers.len(),
        },
        "machines": machines,
    })))
}
