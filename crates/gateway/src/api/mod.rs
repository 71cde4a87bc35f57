//! HTTP surface. All routes live under `/api/v1`.
//!
//! Routes split three ways:
//! - **public** — install script, registration claim, health probe
//! - **agent** — heartbeat (agent token or admin key)
//! - **admin** — everything else, behind `X-API-Key`

pub mod alerts;
pub mod auth;
pub mod commands;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod metrics;
pub mod packs;
pub mod register;
pub mod servers;

use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};

use crate::state::AppState;

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Build the full API router. `state` is needed to wire the auth middleware
/// at build time.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/agents/register/claim", post(register::claim_token))
        .route(
            "/api/v1/agents/register/install.sh",
            get(register::install_script),
        );

    let agent = Router::new()
        .route("/api/v1/agents/heartbeat", post(heartbeat::receive_heartbeat))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_agent_or_admin,
        ));

    let admin = Router::new()
        // Registration tokens + agent credentials
        .route(
            "/api/v1/agents/register/tokens",
            post(register::create_token).get(register::list_tokens),
        )
        .route(
            "/api/v1/agents/register/tokens/:id",
            delete(register::cancel_token),
        )
        .route(
            "/api/v1/agents/register/credentials/:guid",
            get(register::credential_info),
        )
        .route(
            "/api/v1/agents/register/credentials/:guid/rotate",
            post(register::rotate_credential),
        )
        .route(
            "/api/v1/agents/register/credentials/:guid/revoke",
            post(register::revoke_credential),
        )
        // Servers
        .route("/api/v1/servers", get(servers::list).post(servers::create))
        .route(
            "/api/v1/servers/:id",
            get(servers::get).put(servers::update).delete(servers::remove),
        )
        .route("/api/v1/servers/:id/pause", post(servers::pause))
        .route("/api/v1/servers/:id/unpause", post(servers::unpause))
        .route("/api/v1/servers/:id/deactivate", post(servers::deactivate))
        .route("/api/v1/servers/:id/activate", post(servers::activate))
        .route("/api/v1/servers/:id/packs", put(servers::assign_packs))
        .route("/api/v1/servers/:id/packages", get(servers::pending_packages))
        // Expected services registry
        .route(
            "/api/v1/servers/:id/services",
            get(servers::list_services).post(servers::upsert_service),
        )
        .route(
            "/api/v1/servers/:id/services/:name",
            delete(servers::delete_service),
        )
        // Vault credentials (per-server scope; metadata only on reads)
        .route(
            "/api/v1/servers/:id/credentials",
            get(servers::list_credentials).post(servers::store_credential),
        )
        .route(
            "/api/v1/servers/:id/credentials/:credential_type",
            delete(servers::delete_credential),
        )
        // Remediation
        .route(
            "/api/v1/servers/:id/actions",
            get(commands::list_actions).post(commands::create_action),
        )
        .route("/api/v1/actions/:id", get(commands::get_action))
        .route("/api/v1/actions/:id/approve", post(commands::approve_action))
        .route("/api/v1/actions/:id/cancel", post(commands::cancel_action))
        .route(
            "/api/v1/servers/:id/commands/execute",
            post(commands::execute_command),
        )
        // Metrics
        .route("/api/v1/servers/:id/metrics", get(metrics::history))
        .route("/api/v1/servers/:id/metrics/export", get(metrics::export))
        // Alerts
        .route("/api/v1/alerts", get(alerts::list))
        .route("/api/v1/alerts/:id", get(alerts::get))
        .route("/api/v1/alerts/:id/acknowledge", post(alerts::acknowledge))
        .route("/api/v1/alerts/:id/resolve", post(alerts::resolve))
        // Settings
        .route("/api/v1/config", get(config::get_config))
        .route("/api/v1/config/thresholds", put(config::update_thresholds))
        .route(
            "/api/v1/config/notifications",
            put(config::update_notifications),
        )
        .route(
            "/api/v1/config/cost",
            get(config::get_cost).put(config::update_cost),
        )
        .route("/api/v1/config/test-webhook", post(config::test_webhook))
        // Global vault credentials (fleet-wide SSH key, Tailscale token)
        .route(
            "/api/v1/config/credentials",
            post(config::store_global_credential),
        )
        .route(
            "/api/v1/config/credentials/:credential_type",
            delete(config::delete_global_credential),
        )
        // Configuration packs
        .route("/api/v1/config/packs", get(packs::list_packs))
        .route("/api/v1/config/compliance", get(packs::fleet_compliance))
        .route("/api/v1/servers/:id/config/check", post(packs::run_check))
        .route("/api/v1/servers/:id/config/checks", get(packs::list_checks))
        .route("/api/v1/servers/:id/config/diff", get(packs::diff))
        .route(
            "/api/v1/servers/:id/config/apply",
            post(packs::apply).delete(packs::remove),
        )
        .route(
            "/api/v1/servers/:id/config/apply/:apply_id",
            get(packs::apply_status),
        )
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_admin,
        ));

    public
        .merge(agent)
        .merge(admin)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
