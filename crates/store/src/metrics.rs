//! Telemetry repository: raw inserts, tier reads, rollups, retention prune.

use chrono::{DateTime, Duration, DurationRound, Utc};
use sqlx::SqliteConnection;
use std::collections::BTreeMap;

use hlh_domain::heartbeat::MetricsPayload;
use hlh_domain::telemetry::{Metrics, MetricsDaily, MetricsHourly};
use hlh_domain::{Error, Result};

pub async fn insert_sample(
    conn: &mut SqliteConnection,
    server_id: &str,
    timestamp: DateTime<Utc>,
    payload: &MetricsPayload,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO metrics
            (server_id, timestamp, cpu_percent, memory_percent, memory_total_mb,
             memory_used_mb, disk_percent, disk_total_gb, disk_used_gb,
             network_rx_bytes, network_tx_bytes, load_1m, load_5m, load_15m,
             uptime_seconds)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(server_id)
    .bind(timestamp)
    .bind(payload.cpu_percent)
    .bind(payload.memory_percent)
    .bind(payload.memory_total_mb)
    .bind(payload.memory_used_mb)
    .bind(payload.disk_percent)
    .bind(payload.disk_total_gb)
    .bind(payload.disk_used_gb)
    .bind(payload.network_rx_bytes)
    .bind(payload.network_tx_bytes)
    .bind(payload.load_1m)
    .bind(payload.load_5m)
    .bind(payload.load_15m)
    .bind(payload.uptime_seconds)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn raw_since(
    conn: &mut SqliteConnection,
    server_id: &str,
    since: DateTime<Utc>,
) -> Result<Vec<Metrics>> {
    Ok(sqlx::query_as::<_, Metrics>(
        "SELECT * FROM metrics WHERE server_id = ? AND timestamp >= ? ORDER BY timestamp",
    )
    .bind(server_id)
    .bind(since)
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn hourly_since(
    conn: &mut SqliteConnection,
    server_id: &str,
    since: DateTime<Utc>,
) -> Result<Vec<MetricsHourly>> {
    Ok(sqlx::query_as::<_, MetricsHourly>(
        "SELECT * FROM metrics_hourly WHERE server_id = ? AND bucket >= ? ORDER BY bucket",
    )
    .bind(server_id)
    .bind(since)
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn daily_since(
    conn: &mut SqliteConnection,
    server_id: &str,
    since: DateTime<Utc>,
) -> Result<Vec<MetricsDaily>> {
    Ok(sqlx::query_as::<_, MetricsDaily>(
        "SELECT * FROM metrics_daily WHERE server_id = ? AND bucket >= ? ORDER BY bucket",
    )
    .bind(server_id)
    .bind(since)
    .fetch_all(&mut *conn)
    .await?)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rollup
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Running aggregate over optional samples.
#[derive(Debug, Default, Clone, Copy)]
struct Acc {
    sum: f64,
    min: f64,
    max: f64,
    n: u64,
}

impl Acc {
    fn push(&mut self, value: Option<f64>) {
        let Some(v) = value else { return };
        if self.n == 0 {
            self.min = v;
            self.max = v;
        } else {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        self.sum += v;
        self.n += 1;
    }

    /// Fold in an already-aggregated bucket (weighted by its sample count).
    fn push_agg(&mut self, avg: Option<f64>, min: Option<f64>, max: Option<f64>, count: i64) {
        let (Some(avg), Some(min), Some(max)) = (avg, min, max) else {
            return;
        };
        let count = count.max(1) as u64;
        if self.n == 0 {
            self.min = min;
            self.max = max;
        } else {
            self.min = self.min.min(min);
            self.max = self.max.max(max);
        }
        self.sum += avg * count as f64;
        self.n += count;
    }

    fn avg(&self) -> Option<f64> {
        (self.n > 0).then(|| self.sum / self.n as f64)
    }

    fn min(&self) -> Option<f64> {
        (self.n > 0).then_some(self.min)
    }

    fn max(&self) -> Option<f64> {
        (self.n > 0).then_some(self.max)
    }
}

#[derive(Debug, Default)]
struct BucketAcc {
    rows: i64,
    cpu: Acc,
    memory: Acc,
    disk: Acc,
}

fn trunc(ts: DateTime<Utc>, granularity: Duration) -> Result<DateTime<Utc>> {
    ts.duration_trunc(granularity)
        .map_err(|e| Error::Internal(format!("timestamp truncation: {e}")))
}

async fn upsert_hourly(
    conn: &mut SqliteConnection,
    table: &str,
    server_id: &str,
    bucket: DateTime<Utc>,
    acc: &BucketAcc,
) -> Result<()> {
    // Same column set for the hourly and daily tables.
    let sql = format!(
        r#"
        INSERT INTO {table}
            (server_id, bucket, sample_count,
             cpu_avg, cpu_min, cpu_max,
             memory_avg, memory_min, memory_max,
             disk_avg, disk_min, disk_max)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (server_id, bucket) DO UPDATE SET
            sample_count = excluded.sample_count,
            cpu_avg = excluded.cpu_avg, cpu_min = excluded.cpu_min,
            cpu_max = excluded.cpu_max,
            memory_avg = excluded.memory_avg, memory_min = excluded.memory_min,
            memory_max = excluded.memory_max,
            disk_avg = excluded.disk_avg, disk_min = excluded.disk_min,
            disk_max = excluded.disk_max
        "#
    );
    sqlx::query(&sql)
        .bind(server_id)
        .bind(bucket)
        .bind(acc.rows)
        .bind(acc.cpu.avg())
        .bind(acc.cpu.min())
        .bind(acc.cpu.max())
        .bind(acc.memory.avg())
        .bind(acc.memory.min())
        .bind(acc.memory.max())
        .bind(acc.disk.avg())
        .bind(acc.disk.min())
        .bind(acc.disk.max())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Roll raw samples in `[window_start, window_end)` into hourly buckets.
/// Idempotent: recomputed buckets overwrite their previous values.
/// Returns the number of buckets written.
pub async fn rollup_hourly(
    conn: &mut SqliteConnection,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Result<u64> {
    let rows = sqlx::query_as::<_, Metrics>(
        "SELECT * FROM metrics WHERE timestamp >= ? AND timestamp < ? ORDER BY server_id",
    )
    .bind(window_start)
    .bind(window_end)
    .fetch_all(&mut *conn)
    .await?;

    let mut buckets: BTreeMap<(String, DateTime<Utc>), BucketAcc> = BTreeMap::new();
    for row in &rows {
        let bucket = trunc(row.timestamp, Duration::hours(1))?;
        let acc = buckets.entry((row.server_id.clone(), bucket)).or_default();
        acc.rows += 1;
        acc.cpu.push(row.cpu_percent);
        acc.memory.push(row.memory_percent);
        acc.disk.push(row.disk_percent);
    }

    let written = buckets.len() as u64;
    for ((server_id, bucket), acc) in &buckets {
        upsert_hourly(conn, "metrics_hourly", server_id, *bucket, acc).await?;
    }
    Ok(written)
}

/// Roll hourly buckets in `[window_start, window_end)` into daily buckets.
/// Averages are weighted by each hour's sample count.
pub async fn rollup_daily(
    conn: &mut SqliteConnection,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Result<u64> {
    let rows = sqlx::query_as::<_, MetricsHourly>(
        "SELECT * FROM metrics_hourly WHERE bucket >= ? AND bucket < ? ORDER BY server_id",
    )
    .bind(window_start)
    .bind(window_end)
    .fetch_all(&mut *conn)
    .await?;

    let mut buckets: BTreeMap<(String, DateTime<Utc>), BucketAcc> = BTreeMap::new();
    for row in &rows {
        let bucket = trunc(row.bucket, Duration::days(1))?;
        let acc = buckets.entry((row.server_id.clone(), bucket)).or_default();
        acc.rows += row.sample_count;
        acc.cpu
            .push_agg(row.cpu_avg, row.cpu_min, row.cpu_max, row.sample_count);
        acc.memory.push_agg(
            row.memory_avg,
            row.memory_min,
            row.memory_max,
            row.sample_count,
        );
        acc.disk
            .push_agg(row.disk_avg, row.disk_min, row.disk_max, row.sample_count);
    }

    let written = buckets.len() as u64;
    for ((server_id, bucket), acc) in &buckets {
        upsert_hourly(conn, "metrics_daily", server_id, *bucket, acc).await?;
    }
    Ok(written)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retention prune
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn prune_batch(
    conn: &mut SqliteConnection,
    table: &str,
    ts_column: &str,
    cutoff: DateTime<Utc>,
    batch_size: u32,
) -> Result<u64> {
    // SQLite has no DELETE ... LIMIT by default; go through a rowid subquery.
    let sql = format!(
        "DELETE FROM {table} WHERE id IN \
         (SELECT id FROM {table} WHERE {ts_column} < ? LIMIT ?)"
    );
    let result = sqlx::query(&sql)
        .bind(cutoff)
        .bind(batch_size)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn prune_raw_batch(
    conn: &mut SqliteConnection,
    cutoff: DateTime<Utc>,
    batch_size: u32,
) -> Result<u64> {
    prune_batch(conn, "metrics", "timestamp", cutoff, batch_size).await
}

pub async fn prune_hourly_batch(
    conn: &mut SqliteConnection,
    cutoff: DateTime<Utc>,
    batch_size: u32,
) -> Result<u64> {
    prune_batch(conn, "metrics_hourly", "bucket", cutoff, batch_size).await
}

pub async fn prune_daily_batch(
    conn: &mut SqliteConnection,
    cutoff: DateTime<Utc>,
    batch_size: u32,
) -> Result<u64> {
    prune_batch(conn, "metrics_daily", "bucket", cutoff, batch_size).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::seed_server;
    use crate::Store;
    use chrono::TimeZone;

    fn sample(cpu: f64) -> MetricsPayload {
        MetricsPayload {
            cpu_percent: Some(cpu),
            memory_percent: Some(50.0),
            disk_percent: Some(70.0),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn rollup_hourly_averages_bucket() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();
        seed_server(&mut conn, "alpha").await;

        let base = Utc.with_ymd_and_hms(2026, 6, 15, 10, 0, 0).unwrap();
        for (offset, cpu) in [(0i64, 10.0), (15, 20.0), (30, 60.0)] {
            insert_sample(
                &mut conn,
                "alpha",
                base + Duration::minutes(offset),
                &sample(cpu),
            )
            .await
            .unwrap();
        }

        let written = rollup_hourly(&mut conn, base, base + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(written, 1);

        let buckets = hourly_since(&mut conn, "alpha", base).await.unwrap();
        assert_eq!(buckets.len(), 1);
        let bucket = &buckets[0];
        assert_eq!(bucket.sample_count, 3);
        assert!((bucket.cpu_avg.unwrap() - 30.0).abs() < 1e-9);
        assert_eq!(bucket.cpu_min, Some(10.0));
        assert_eq!(bucket.cpu_max, Some(60.0));
    }

    #[tokio::test]
    async fn rollup_is_idempotent_over_same_window() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();
        seed_server(&mut conn, "alpha").await;

        let base = Utc.with_ymd_and_hms(2026, 6, 15, 10, 0, 0).unwrap();
        insert_sample(&mut conn, "alpha", base, &sample(40.0))
            .await
            .unwrap();

        rollup_hourly(&mut conn, base, base + Duration::hours(1))
            .await
            .unwrap();
        rollup_hourly(&mut conn, base, base + Duration::hours(1))
            .await
            .unwrap();

        let buckets = hourly_since(&mut conn, "alpha", base).await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].sample_count, 1);
    }

    #[tokio::test]
    async fn daily_rollup_weights_by_sample_count() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();
        seed_server(&mut conn, "alpha").await;

        let day = Utc.with_ymd_and_hms(2026, 6, 15, 0, 0, 0).unwrap();
        // Hour one: 3 samples at 10%. Hour two: 1 sample at 50%.
        for i in 0..3 {
            insert_sample(&mut conn, "alpha", day + Duration::minutes(i * 10), &sample(10.0))
                .await
                .unwrap();
        }
        insert_sample(&mut conn, "alpha", day + Duration::hours(1), &sample(50.0))
            .await
            .unwrap();

        rollup_hourly(&mut conn, day, day + Duration::days(1))
            .await
            .unwrap();
        rollup_daily(&mut conn, day, day + Duration::days(1))
            .await
            .unwrap();

        let buckets = daily_since(&mut conn, "alpha", day).await.unwrap();
        assert_eq!(buckets.len(), 1);
        // Weighted: (3*10 + 1*50) / 4 = 20.
        assert!((buckets[0].cpu_avg.unwrap() - 20.0).abs() < 1e-9);
        assert_eq!(buckets[0].sample_count, 4);
    }

    #[tokio::test]
    async fn prune_deletes_in_batches() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();
        seed_server(&mut conn, "alpha").await;

        let old = Utc::now() - Duration::days(10);
        for i in 0..5 {
            insert_sample(&mut conn, "alpha", old + Duration::seconds(i), &sample(1.0))
                .await
                .unwrap();
        }
        insert_sample(&mut conn, "alpha", Utc::now(), &sample(1.0))
            .await
            .unwrap();

        let cutoff = Utc::now() - Duration::days(7);
        let first = prune_raw_batch(&mut conn, cutoff, 3).await.unwrap();
        assert_eq!(first, 3);
        let second = prune_raw_batch(&mut conn, cutoff, 3).await.unwrap();
        assert_eq!(second, 2);

        let remaining = raw_since(&mut conn, "alpha", Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }
}
