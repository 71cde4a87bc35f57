//! Tiered metrics reads and CSV/JSON export.
//!
//! Range → tier: `24h` raw, `7d` raw aggregated into 1-hour buckets,
//! `30d` hourly table, `12m` daily table.

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

use hlh_domain::telemetry::{Metrics, MetricsDaily, MetricsHourly};
use hlh_domain::{Error, Result as DomainResult};
use hlh_store::{metrics, servers};

use crate::api::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
    #[serde(rename = "12m")]
    Year,
}

impl TimeRange {
    fn as_str(&self) -> &'static str {
        match self {
            TimeRange::Day => "24h",
            TimeRange::Week => "7d",
            TimeRange::Month => "30d",
            TimeRange::Year => "12m",
        }
    }

    fn window(&self) -> Duration {
        match self {
            TimeRange::Day => Duration::hours(24),
            TimeRange::Week => Duration::days(7),
            TimeRange::Month => Duration::days(30),
            TimeRange::Year => Duration::days(365),
        }
    }

    fn resolution(&self) -> &'static str {
        match self {
            TimeRange::Day => "raw",
            TimeRange::Week => "1h",
            TimeRange::Month => "1h",
            TimeRange::Year => "1d",
        }
    }
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_range")]
    pub range: TimeRange,
}

fn default_range() -> TimeRange {
    TimeRange::Day
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

#[derive(Deserialize)]
pub struct ExportQuery {
    #[serde(default = "default_range")]
    pub range: TimeRange,
    #[serde(default = "default_format")]
    pub format: ExportFormat,
}

fn default_format() -> ExportFormat {
    ExportFormat::Csv
}

/// One chart point. min/max are present for aggregated tiers only.
#[derive(Debug, Clone, Serialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_max: Option<f64>,
}

impl MetricPoint {
    fn raw(m: &Metrics) -> Self {
        Self {
            timestamp: m.timestamp,
            cpu_percent: m.cpu_percent,
            memory_percent: m.memory_percent,
            disk_percent: m.disk_percent,
            cpu_min: None,
            cpu_max: None,
            memory_min: None,
            memory_max: None,
            disk_min: None,
            disk_max: None,
        }
    }

    fn hourly(m: &MetricsHourly) -> Self {
        Self {
            timestamp: m.bucket,
            cpu_percent: m.cpu_avg,
            memory_percent: m.memory_avg,
            disk_percent: m.disk_avg,
            cpu_min: m.cpu_min,
            cpu_max: m.cpu_max,
            memory_min: m.memory_min,
            memory_max: m.memory_max,
            disk_min: m.disk_min,
            disk_max: m.disk_max,
        }
    }

    fn daily(m: &MetricsDaily) -> Self {
        Self {
            timestamp: m.bucket,
            cpu_percent: m.cpu_avg,
            memory_percent: m.memory_avg,
            disk_percent: m.disk_avg,
            cpu_min: m.cpu_min,
            cpu_max: m.cpu_max,
            memory_min: m.memory_min,
            memory_max: m.memory_max,
            disk_min: m.disk_min,
            disk_max: m.disk_max,
        }
    }
}

/// Collapse raw samples into fixed 1-hour buckets for the 7-day view.
fn aggregate_raw(samples: &[Metrics]) -> Vec<MetricPoint> {
    #[derive(Default)]
    struct Acc {
        cpu: Vec<f64>,
        memory: Vec<f64>,
        disk: Vec<f64>,
    }
    fn stats(values: &[f64]) -> (Option<f64>, Option<f64>, Option<f64>) {
        if values.is_empty() {
            return (None, None, None);
        }
        let sum: f64 = values.iter().sum();
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        (Some(sum / values.len() as f64), Some(min), Some(max))
    }

    let mut buckets: std::collections::BTreeMap<DateTime<Utc>, Acc> =
        std::collections::BTreeMap::new();
    for sample in samples {
        let Ok(bucket) = sample.timestamp.duration_trunc(Duration::hours(1)) else {
            continue;
        };
        let acc = buckets.entry(bucket).or_default();
        if let Some(v) = sample.cpu_percent {
            acc.cpu.push(v);
        }
        if let Some(v) = sample.memory_percent {
            acc.memory.push(v);
        }
        if let Some(v) = sample.disk_percent {
            acc.disk.push(v);
        }
    }

    buckets
        .into_iter()
        .map(|(timestamp, acc)| {
            let (cpu_avg, cpu_min, cpu_max) = stats(&acc.cpu);
            let (mem_avg, mem_min, mem_max) = stats(&acc.memory);
            let (disk_avg, disk_min, disk_max) = stats(&acc.disk);
            MetricPoint {
                timestamp,
                cpu_percent: cpu_avg,
                memory_percent: mem_avg,
                disk_percent: disk_avg,
                cpu_min,
                cpu_max,
                memory_min: mem_min,
                memory_max: mem_max,
                disk_min,
                disk_max,
            }
        })
        .collect()
}

async fn load_points(
    state: &AppState,
    server_id: &str,
    range: TimeRange,
) -> DomainResult<Vec<MetricPoint>> {
    let mut conn = state.store.acquire().await?;
    servers::require(&mut conn, server_id).await?;
    let since = Utc::now() - range.window();

    let points = match range {
        TimeRange::Day => metrics::raw_since(&mut conn, server_id, since)
            .await?
            .iter()
            .map(MetricPoint::raw)
            .collect(),
        TimeRange::Week => {
            let raw = metrics::raw_since(&mut conn, server_id, since).await?;
            aggregate_raw(&raw)
        }
        TimeRange::Month => metrics::hourly_since(&mut conn, server_id, since)
            .await?
            .iter()
            .map(MetricPoint::hourly)
            .collect(),
        TimeRange::Year => metrics::daily_since(&mut conn, server_id, since)
            .await?
            .iter()
            .map(MetricPoint::daily)
            .collect(),
    };
    Ok(points)
}

pub async fn history(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let points = load_points(&state, &server_id, query.range).await?;
    Ok(Json(serde_json::json!({
        "server_id": server_id,
        "range": query.range.as_str(),
        "resolution": query.range.resolution(),
        "count": points.len(),
        "data": points,
    })))
}

pub async fn export(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<Response> {
    let points = load_points(&state, &server_id, query.range).await?;
    let filename = format!("{server_id}-metrics-{}", query.range.as_str());

    match query.format {
        ExportFormat::Json => {
            let body = serde_json::to_string_pretty(&serde_json::json!({
                "server_id": server_id,
                "range": query.range.as_str(),
                "exported_at": Utc::now(),
                "data": points,
            }))
            .map_err(|e| Error::Internal(format!("export serialization: {e}")))?;
            Ok((
                [
                    (header::CONTENT_TYPE, "application/json".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{filename}.json\""),
                    ),
                ],
                body,
            )
                .into_response())
        }
        ExportFormat::Csv => {
            let aggregated = query.range != TimeRange::Day;
            Ok((
                [
                    (header::CONTENT_TYPE, "text/csv".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{filename}.csv\""),
                    ),
                ],
                to_csv(&points, aggregated),
            )
                .into_response())
        }
    }
}

fn csv_cell(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.2}")).unwrap_or_default()
}

fn to_csv(points: &[MetricPoint], aggregated: bool) -> String {
    let mut out = String::new();
    if aggregated {
        out.push_str(
            "timestamp,cpu_avg,cpu_min,cpu_max,memory_avg,memory_min,memory_max,disk_avg,disk_min,disk_max\n",
        );
        for p in points {
            out.push_str(&format!(
                "{},{},{},{},{},{},{},{},{},{}\n",
                p.timestamp.to_rfc3339(),
                csv_cell(p.cpu_percent),
                csv_cell(p.cpu_min),
                csv_cell(p.cpu_max),
                csv_cell(p.memory_percent),
                csv_cell(p.memory_min),
                csv_cell(p.memory_max),
                csv_cell(p.disk_percent),
                csv_cell(p.disk_min),
                csv_cell(p.disk_max),
            ));
        }
    } else {
        out.push_str("timestamp,cpu_percent,memory_percent,disk_percent\n");
        for p in points {
            out.push_str(&format!(
                "{},{},{},{}\n",
                p.timestamp.to_rfc3339(),
                csv_cell(p.cpu_percent),
                csv_cell(p.memory_percent),
                csv_cell(p.disk_percent),
            ));
        }
    }
    out
}
