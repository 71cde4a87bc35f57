//! Service registry (what should run) and observed service status history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ServiceState {
    Running,
    Stopped,
    Failed,
    Unknown,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
            ServiceState::Unknown => "unknown",
        }
    }

    /// Stopped and failed both count as down for alerting.
    pub fn is_down(&self) -> bool {
        matches!(self, ServiceState::Stopped | ServiceState::Failed)
    }
}

/// A service the operator expects to run on a server.
/// Unique per `(server_id, service_name)`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExpectedService {
    pub id: i64,
    pub server_id: String,
    pub service_name: String,
    pub display_name: Option<String>,
    pub is_critical: bool,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// One observed sample per service per heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ServiceStatusRecord {
    pub id: i64,
    pub server_id: String,
    pub service_name: String,
    pub status: ServiceState,
    pub pid: Option<i64>,
    pub memory_mb: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub status_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}
