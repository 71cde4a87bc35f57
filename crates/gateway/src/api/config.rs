//! Settings endpoints: thresholds, notifications, cost, and the webhook
//! test. Updates are partial — only provided fields change.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use hlh_domain::settings::{
    CooldownConfig, CostConfig, MetricThreshold, NotificationsConfig, ThresholdsConfig,
};
use hlh_domain::Error;
use hlh_store::settings;

use crate::api::error::ApiResult;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Partial-update request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize, Default)]
pub struct MetricThresholdUpdate {
    pub high_percent: Option<f64>,
    pub critical_percent: Option<f64>,
    pub sustained_heartbeats: Option<u32>,
    pub sustained_seconds: Option<u64>,
}

#[derive(Deserialize, Default)]
pub struct ThresholdsUpdate {
    pub cpu: Option<MetricThresholdUpdate>,
    pub memory: Option<MetricThresholdUpdate>,
    pub disk: Option<MetricThresholdUpdate>,
    pub server_offline_seconds: Option<u64>,
}

#[derive(Deserialize, Default)]
pub struct CooldownUpdate {
    pub critical_minutes: Option<u64>,
    pub high_minutes: Option<u64>,
}

#[derive(Deserialize, Default)]
pub struct NotificationsUpdate {
    pub slack_webhook_url: Option<String>,
    pub notify_on_critical: Option<bool>,
    pub notify_on_high: Option<bool>,
    pub notify_on_remediation: Option<bool>,
    pub cooldowns: Option<CooldownUpdate>,
}

#[derive(Deserialize, Default)]
pub struct CostUpdate {
    pub electricity_rate: Option<f64>,
    pub currency_symbol: Option<String>,
}

#[derive(Deserialize)]
pub struct TestWebhookRequest {
    pub webhook_url: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Merge helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn merge_metric(
    current: &mut MetricThreshold,
    update: &MetricThresholdUpdate,
    prefix: &str,
    updated: &mut Vec<String>,
) {
    if let Some(v) = update.high_percent {
        if current.high_percent != v {
            current.high_percent = v;
            updated.push(format!("{prefix}.high_percent"));
        }
    }
    if let Some(v) = update.critical_percent {
        if current.critical_percent != v {
            current.critical_percent = v;
            updated.push(format!("{prefix}.critical_percent"));
        }
    }
    if let Some(v) = update.sustained_heartbeats {
        if current.sustained_heartbeats != v {
            current.sustained_heartbeats = v;
            updated.push(format!("{prefix}.sustained_heartbeats"));
        }
    }
    if let Some(v) = update.sustained_seconds {
        if current.sustained_seconds != v {
            current.sustained_seconds = v;
            updated.push(format!("{prefix}.sustained_seconds"));
        }
    }
}

fn merge_cooldowns(
    current: &mut CooldownConfig,
    update: &CooldownUpdate,
    updated: &mut Vec<String>,
) {
    if let Some(v) = update.critical_minutes {
        if current.critical_minutes != v {
            current.critical_minutes = v;
            updated.push("cooldowns.critical_minutes".into());
        }
    }
    if let Some(v) = update.high_minutes {
        if current.high_minutes != v {
            current.high_minutes = v;
            updated.push("cooldowns.high_minutes".into());
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_config(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let mut conn = state.store.acquire().await?;
    let thresholds: ThresholdsConfig = settings::get_typed(&mut conn, "thresholds").await?;
    let notifications: NotificationsConfig =
        settings::get_typed(&mut conn, "notifications").await?;
    Ok(Json(serde_json::json!({
        "thresholds": thresholds,
        "notifications": notifications,
    })))
}

pub async fn update_thresholds(
    State(state): State<AppState>,
    Json(update): Json<ThresholdsUpdate>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut tx = state.store.begin().await?;
    let mut current: ThresholdsConfig = settings::get_typed(&mut *tx, "thresholds").await?;
    let mut updated = Vec::new();

    if let Some(cpu) = &update.cpu {
        merge_metric(&mut current.cpu, cpu, "cpu", &mut updated);
    }
    if let Some(memory) = &update.memory {
        merge_metric(&mut current.memory, memory, "memory", &mut updated);
    }
    if let Some(disk) = &update.disk {
        merge_metric(&mut current.disk, disk, "disk", &mut updated);
    }
    if let Some(v) = update.server_offline_seconds {
        if current.server_offline_seconds != v {
            current.server_offline_seconds = v;
            updated.push("server_offline_seconds".into());
        }
    }

    current.validate().map_err(Error::Validation)?;
    settings::set_typed(&mut *tx, "thresholds", &current).await?;
    tx.commit().await.map_err(Error::from)?;

    Ok(Json(serde_json::json!({
        "updated": updated,
        "thresholds": current,
    })))
}

pub async fn update_notifications(
    State(state): State<AppState>,
    Json(update): Json<NotificationsUpdate>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut tx = state.store.begin().await?;
    let mut current: NotificationsConfig = settings::get_typed(&mut *tx, "notifications").await?;
    let mut updated = Vec::new();

    if let Some(url) = update.slack_webhook_url {
        if current.slack_webhook_url != url {
            current.slack_webhook_url = url;
            updated.push("slack_webhook_url".to_string());
        }
    }
    if let Some(v) = update.notify_on_critical {
        if current.notify_on_critical != v {
            current.notify_on_critical = v;
            updated.push("notify_on_critical".into());
        }
    }
    if let Some(v) = update.notify_on_high {
        if current.notify_on_high != v {
            current.notify_on_high = v;
            updated.push("notify_on_high".into());
        }
    }
    if let Some(v) = update.notify_on_remediation {
        if current.notify_on_remediation != v {
            current.notify_on_remediation = v;
            updated.push("notify_on_remediation".into());
        }
    }
    if let Some(cooldowns) = &update.cooldowns {
        merge_cooldowns(&mut current.cooldowns, cooldowns, &mut updated);
    }

    settings::set_typed(&mut *tx, "notifications", &current).await?;
    tx.commit().await.map_err(Error::from)?;

    Ok(Json(serde_json::json!({
        "updated": updated,
        "notifications": current,
    })))
}

pub async fn get_cost(State(state): State<AppState>) -> ApiResult<Json<CostConfig>> {
    let mut conn = state.store.acquire().await?;
    let cost: CostConfig = settings::get_typed(&mut conn, "cost").await?;
    Ok(Json(cost))
}

pub async fn update_cost(
    State(state): State<AppState>,
    Json(update): Json<CostUpdate>,
) -> ApiResult<Json<CostConfig>> {
    let mut tx = state.store.begin().await?;
    let mut current: CostConfig = settings::get_typed(&mut *tx, "cost").await?;

    if let Some(rate) = update.electricity_rate {
        if rate < 0.0 {
            return Err(Error::Validation("electricity_rate must be non-negative".into()).into());
        }
        current.electricity_rate = rate;
    }
    if let Some(symbol) = update.currency_symbol {
        current.currency_symbol = symbol;
    }

    settings::set_typed(&mut *tx, "cost", &current).await?;
    tx.commit().await.map_err(Error::from)?;
    Ok(Json(current))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Global vault credentials (fleet-wide SSH key, Tailscale token)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
pub struct StoreGlobalCredentialRequest {
    pub credential_type: hlh_domain::credential::CredentialType,
    pub value: String,
}

pub async fn store_global_credential(
    State(state): State<AppState>,
    Json(body): Json<StoreGlobalCredentialRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.value.is_empty() {
        return Err(Error::Validation("credential value must not be empty".into()).into());
    }
    state
        .vault
        .store_secret(
            body.credential_type,
            &crate::vault::Scope::Global,
            body.value.as_bytes(),
        )
        .await?;
    tracing::info!(credential_type = ?body.credential_type, "global credential stored");
    Ok(Json(serde_json::json!({
        "success": true,
        "credential_type": body.credential_type,
    })))
}

pub async fn delete_global_credential(
    State(state): State<AppState>,
    axum::extract::Path(credential_type): axum::extract::Path<
        hlh_domain::credential::CredentialType,
    >,
) -> ApiResult<axum::http::StatusCode> {
    if !state
        .vault
        .delete(credential_type, &crate::vault::Scope::Global)
        .await?
    {
        return Err(Error::not_found("credential", format!("{credential_type:?}")).into());
    }
    Ok(axum::http::StatusCode::NO_CONTENT)
}

/// Send a test message to the supplied webhook URL. Uses the body's URL, not
/// the stored configuration.
pub async fn test_webhook(
    State(state): State<AppState>,
    Json(body): Json<TestWebhookRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if !body.webhook_url.starts_with("https://") && !body.webhook_url.starts_with("http://") {
        return Err(Error::Validation("webhook_url must be an http(s) URL".into()).into());
    }

    match state.notifier.send_test(&body.webhook_url).await {
        Ok(()) => Ok(Json(serde_json::json!({
            "success": true,
            "message": "Test message sent successfully",
        }))),
        Err(error) => Ok(Json(serde_json::json!({
            "success": false,
            "error": error,
        }))),
    }
}
