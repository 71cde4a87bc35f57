//! Tiered telemetry rows: raw samples plus hourly/daily aggregates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One raw sample as reported in a heartbeat. One row per heartbeat that
/// carried a `metrics` payload.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Metrics {
    pub id: i64,
    pub server_id: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub memory_total_mb: Option<i64>,
    pub memory_used_mb: Option<i64>,
    pub disk_percent: Option<f64>,
    pub disk_total_gb: Option<f64>,
    pub disk_used_gb: Option<f64>,
    pub network_rx_bytes: Option<i64>,
    pub network_tx_bytes: Option<i64>,
    pub load_1m: Option<f64>,
    pub load_5m: Option<f64>,
    pub load_15m: Option<f64>,
    pub uptime_seconds: Option<i64>,
}

/// avg/min/max triple for a single metric inside one rollup bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

/// Hourly rollup bucket. `bucket` is the start of the hour (UTC).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MetricsHourly {
    pub id: i64,
    pub server_id: String,
    pub bucket: DateTime<Utc>,
    pub sample_count: i64,
    pub cpu_avg: Option<f64>,
    pub cpu_min: Option<f64>,
    pub cpu_max: Option<f64>,
    pub memory_avg: Option<f64>,
    pub memory_min: Option<f64>,
    pub memory_max: Option<f64>,
    pub disk_avg: Option<f64>,
    pub disk_min: Option<f64>,
    pub disk_max: Option<f64>,
}

/// Daily rollup bucket. `bucket` is midnight UTC.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MetricsDaily {
    pub id: i64,
    pub server_id: String,
    pub bucket: DateTime<Utc>,
    pub sample_count: i64,
    pub cpu_avg: Option<f64>,
    pub cpu_min: Option<f64>,
    pub cpu_max: Option<f64>,
    pub memory_avg: Option<f64>,
    pub memory_min: Option<f64>,
    pub memory_max: Option<f64>,
    pub disk_avg: Option<f64>,
    pub disk_min: Option<f64>,
    pub disk_max: Option<f64>,
}

/// Package with an available update, as reported by the agent. The set is
/// replaced wholesale on every heartbeat that carries a `packages` list.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PendingPackage {
    pub id: i64,
    pub server_id: String,
    pub name: String,
    pub current_version: String,
    pub new_version: String,
    pub repository: String,
    pub is_security: bool,
    pub detected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Retention windows for the three telemetry tiers.
pub const RAW_RETENTION_DAYS: i64 = 7;
pub const HOURLY_RETENTION_DAYS: i64 = 90;
pub const DAILY_RETENTION_DAYS: i64 = 365;
