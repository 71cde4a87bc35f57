//! Server CRUD, pause/inactive toggles, pack assignment, and the
//! expected-services registry.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use hlh_domain::server::{
    is_valid_server_id, AgentMode, MachineCategory, MachineType, Server, ServerStatus, SudoMode,
};
use hlh_domain::{Error, Result as DomainResult};
use hlh_store::{servers, services};

use crate::api::error::ApiResult;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
pub struct CreateServerRequest {
    pub id: String,
    pub hostname: String,
    pub display_name: Option<String>,
    #[serde(default = "default_machine_type")]
    pub machine_type: MachineType,
}

fn default_machine_type() -> MachineType {
    MachineType::Server
}

/// Partial update; omitted fields keep their current values.
#[derive(Deserialize, Default)]
pub struct UpdateServerRequest {
    pub display_name: Option<String>,
    pub machine_type: Option<MachineType>,
    pub machine_category: Option<MachineCategory>,
    pub idle_watts: Option<f64>,
    pub tdp_watts: Option<f64>,
    pub agent_mode: Option<AgentMode>,
    pub ssh_username: Option<String>,
    pub sudo_mode: Option<SudoMode>,
    pub config_user: Option<String>,
    pub tailscale_hostname: Option<String>,
    pub drift_detection_enabled: Option<bool>,
}

#[derive(Deserialize)]
pub struct AssignPacksRequest {
    pub packs: Vec<String>,
}

#[derive(Deserialize)]
pub struct UpsertServiceRequest {
    pub service_name: String,
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_critical: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CRUD
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Server>>> {
    let mut conn = state.store.acquire().await?;
    Ok(Json(servers::list(&mut conn).await?))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Server>> {
    let mut conn = state.store.acquire().await?;
    Ok(Json(servers::require(&mut conn, &id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateServerRequest>,
) -> ApiResult<(StatusCode, Json<Server>)> {
    if !is_valid_server_id(&body.id) {
        return Err(Error::Validation(format!(
            "server id must match [a-z0-9-]+ (got '{}')",
            body.id
        ))
        .into());
    }

    let mut tx = state.store.begin().await?;
    if servers::get(&mut *tx, &body.id).await?.is_some() {
        return Err(Error::Conflict(format!("server '{}' already exists", body.id)).into());
    }
    let mut server = servers::create(
        &mut *tx,
        servers::CreateServer {
            id: body.id,
            guid: Some(uuid::Uuid::new_v4().to_string()),
            hostname: body.hostname,
            display_name: body.display_name,
            status: ServerStatus::Unknown,
            last_seen: None,
            machine_type: body.machine_type,
        },
    )
    .await?;

    // Default pack assignment follows the machine type.
    server.assigned_packs =
        sqlx::types::Json(hlh_packs::default_packs_for(server.machine_type));
    servers::update(&mut *tx, &server).await?;
    tx.commit().await.map_err(Error::from)?;

    Ok((StatusCode::CREATED, Json(server)))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateServerRequest>,
) -> ApiResult<Json<Server>> {
    let mut tx = state.store.begin().await?;
    let mut server = servers::require(&mut *tx, &id).await?;

    if let Some(display_name) = body.display_name {
        server.display_name = Some(display_name);
    }
    if let Some(machine_type) = body.machine_type {
        server.machine_type = machine_type;
    }
    if let Some(category) = body.machine_category {
        // An explicit category pins it against auto-inference.
        server.machine_category = Some(category);
        server.machine_category_source = hlh_domain::server::CategorySource::User;
    }
    if let Some(idle) = body.idle_watts {
        server.idle_watts = Some(idle);
    }
    if let Some(tdp) = body.tdp_watts {
        server.tdp_watts = Some(tdp);
    }
    if let Some(mode) = body.agent_mode {
        server.agent_mode = mode;
    }
    if let Some(user) = body.ssh_username {
        server.ssh_username = (!user.is_empty()).then_some(user);
    }
    if let Some(sudo_mode) = body.sudo_mode {
        server.sudo_mode = sudo_mode;
    }
    if let Some(user) = body.config_user {
        server.config_user = (!user.is_empty()).then_some(user);
    }
    if let Some(hostname) = body.tailscale_hostname {
        server.tailscale_hostname = (!hostname.is_empty()).then_some(hostname);
    }
    if let Some(drift) = body.drift_detection_enabled {
        server.drift_detection_enabled = drift;
    }

    servers::update(&mut *tx, &server).await?;
    tx.commit().await.map_err(Error::from)?;
    Ok(Json(server))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let mut conn = state.store.acquire().await?;
    if !servers::delete(&mut conn, &id).await? {
        return Err(Error::not_found("server", id).into());
    }
    tracing::info!(server_id = %id, "server deleted (cascade)");
    Ok(StatusCode::NO_CONTENT)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pause / inactive toggles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn set_paused(state: &AppState, id: &str, paused: bool) -> DomainResult<Server> {
    let mut conn = state.store.acquire().await?;
    servers::require(&mut conn, id).await?;
    servers::set_paused(&mut conn, id, paused).await?;
    servers::require(&mut conn, id).await
}

async fn set_inactive(state: &AppState, id: &str, inactive: bool) -> DomainResult<Server> {
    let mut conn = state.store.acquire().await?;
    servers::require(&mut conn, id).await?;
    servers::set_inactive(&mut conn, id, inactive).await?;
    servers::require(&mut conn, id).await
}

pub async fn pause(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Server>> {
    Ok(Json(set_paused(&state, &id, true).await?))
}

pub async fn unpause(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Server>> {
    Ok(Json(set_paused(&state, &id, false).await?))
}

pub async fn deactivate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Server>> {
    Ok(Json(set_inactive(&state, &id, true).await?))
}

/// Reactivation is explicit — heartbeats never reactivate a server.
pub async fn activate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Server>> {
    Ok(Json(set_inactive(&state, &id, false).await?))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pack assignment + pending packages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn assign_packs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AssignPacksRequest>,
) -> ApiResult<Json<Server>> {
    hlh_packs::validate_assignment(&body.packs).map_err(Error::Validation)?;

    let mut tx = state.store.begin().await?;
    servers::require(&mut *tx, &id).await?;
    servers::set_assigned_packs(&mut *tx, &id, &body.packs).await?;
    let server = servers::require(&mut *tx, &id).await?;
    tx.commit().await.map_err(Error::from)?;
    Ok(Json(server))
}

pub async fn pending_packages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut conn = state.store.acquire().await?;
    servers::require(&mut conn, &id).await?;
    let packages = services::list_pending_packages(&mut conn, &id).await?;
    Ok(Json(serde_json::json!({
        "total": packages.len(),
        "packages": packages,
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Expected services
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_services(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut conn = state.store.acquire().await?;
    servers::require(&mut conn, &id).await?;
    let expected = services::list_expected(&mut conn, &id).await?;
    Ok(Json(serde_json::json!({
        "total": expected.len(),
        "services": expected,
    })))
}

pub async fn upsert_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpsertServiceRequest>,
) -> ApiResult<Json<hlh_domain::service::ExpectedService>> {
    if body.service_name.is_empty() || body.service_name.len() > 255 {
        return Err(Error::Validation("service_name must be 1-255 characters".into()).into());
    }

    let mut tx = state.store.begin().await?;
    servers::require(&mut *tx, &id).await?;
    let service = services::upsert_expected(
        &mut *tx,
        &id,
        &body.service_name,
        body.display_name.as_deref(),
        body.is_critical,
        body.enabled,
    )
    .await?;
    tx.commit().await.map_err(Error::from)?;
    Ok(Json(service))
}

pub async fn delete_service(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let mut conn = state.store.acquire().await?;
    servers::require(&mut conn, &id).await?;
    if !services::delete_expected(&mut conn, &id, &name).await? {
        return Err(Error::not_found("expected service", name).into());
    }
    Ok(StatusCode::NO_CONTENT)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Vault credentials (per-server scope)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
pub struct StoreCredentialRequest {
    pub credential_type: hlh_domain::credential::CredentialType,
    pub value: String,
}

/// Metadata only — which credential types are configured, plus the SSH
/// access fields from the server row. Plaintext never appears here.
pub async fn list_credentials(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let server = {
        let mut conn = state.store.acquire().await?;
        servers::require(&mut conn, &id).await?
    };
    let entries = state.vault.list_for_server(&id).await?;
    Ok(Json(serde_json::json!({
        "server_id": id,
        "ssh_username": server.ssh_username,
        "sudo_mode": server.sudo_mode,
        "credentials": entries,
    })))
}

pub async fn store_credential(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<StoreCredentialRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.value.is_empty() {
        return Err(Error::Validation("credential value must not be empty".into()).into());
    }
    {
        let mut conn = state.store.acquire().await?;
        servers::require(&mut conn, &id).await?;
    }
    state
        .vault
        .store_secret(
            body.credential_type,
            &crate::vault::Scope::Server(id.clone()),
            body.value.as_bytes(),
        )
        .await?;
    tracing::info!(server_id = %id, credential_type = ?body.credential_type, "credential stored");
    Ok(Json(serde_json::json!({
        "success": true,
        "server_id": id,
        "credential_type": body.credential_type,
    })))
}

pub async fn delete_credential(
    State(state): State<AppState>,
    Path((id, credential_type)): Path<(String, hlh_domain::credential::CredentialType)>,
) -> ApiResult<StatusCode> {
    {
        let mut conn = state.store.acquire().await?;
        servers::require(&mut conn, &id).await?;
    }
    if !state
        .vault
        .delete(credential_type, &crate::vault::Scope::Server(id.clone()))
        .await?
    {
        return Err(Error::not_found("credential", format!("{id}/{credential_type:?}")).into());
    }
    Ok(StatusCode::NO_CONTENT)
}
