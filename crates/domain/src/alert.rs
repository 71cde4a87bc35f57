//! Alert entities and the per-metric evaluator state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AlertType {
    Cpu,
    Memory,
    Disk,
    Offline,
    Service,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Cpu => "cpu",
            AlertType::Memory => "memory",
            AlertType::Disk => "disk",
            AlertType::Offline => "offline",
            AlertType::Service => "service",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Resolved,
}

/// A raised issue. At most one `open` alert exists per
/// `(server_id, alert_type, metric key)` — for service alerts the key is the
/// service name, for threshold alerts the metric itself.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Alert {
    pub id: i64,
    pub server_id: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub title: String,
    pub message: String,
    /// Set for service alerts; part of the dedup key.
    pub service_name: Option<String>,
    pub threshold_value: Option<f64>,
    pub actual_value: Option<f64>,
    /// True only when resolution came from a recovery sample, never from a
    /// user action.
    pub auto_resolved: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Breach level tracked by the evaluator between heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum BreachLevel {
    High,
    Critical,
}

/// Persisted evaluator state, keyed `(server_id, metric_key)`.
///
/// `metric_key` is `cpu` / `memory` / `disk` for thresholds, `offline` for
/// availability, and `service:{name}` for service alerts. The row carries the
/// sustained-breach counter and the notification cooldown clock.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlertState {
    pub id: i64,
    pub server_id: String,
    pub metric_key: String,
    pub breach_count: i64,
    pub breach_level: Option<BreachLevel>,
    pub first_breach_at: Option<DateTime<Utc>>,
    pub last_alert_id: Option<i64>,
    pub last_notified_at: Option<DateTime<Utc>>,
}

/// Notification event emitted after alert transitions are persisted.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub server_id: String,
    pub server_name: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub threshold_value: Option<f64>,
    pub actual_value: Option<f64>,
    /// Repeat notification for a still-offline server.
    pub is_reminder: bool,
    /// Recovery notification (alert auto-resolved).
    pub is_resolved: bool,
}
