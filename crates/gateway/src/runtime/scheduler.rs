//! Periodic background jobs: staleness detection, offline reminders, tiered
//! rollup, and retention pruning.
//!
//! Each job runs on its own ticker; a tick always runs to completion before
//! the next one is processed, so ticks never overlap themselves.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};

use hlh_domain::server::{MachineType, ServerStatus};
use hlh_domain::settings::{NotificationsConfig, ThresholdsConfig};
use hlh_domain::telemetry::{DAILY_RETENTION_DAYS, HOURLY_RETENTION_DAYS, RAW_RETENTION_DAYS};
use hlh_domain::{Error, Result};
use hlh_ssh::SshPool;
use hlh_store::{metrics, servers, settings, Store};

use crate::notify::Notifier;
use crate::runtime::alerting;
use crate::runtime::remediation::RateLimiter;

/// Rows deleted per commit while pruning.
pub const PRUNE_BATCH_SIZE: u32 = 10_000;

/// How far back the hourly rollup re-scans. Generous so late samples and
/// restarts are re-absorbed; the upsert makes re-scanning idempotent.
const HOURLY_ROLLUP_LOOKBACK_HOURS: i64 = 48;
const DAILY_ROLLUP_LOOKBACK_DAYS: i64 = 7;

pub struct Scheduler {
    store: Store,
    notifier: Arc<Notifier>,
    pool: Arc<SshPool>,
    limiter: Arc<RateLimiter>,
}

impl Scheduler {
    pub fn new(
        store: Store,
        notifier: Arc<Notifier>,
        pool: Arc<SshPool>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            store,
            notifier,
            pool,
            limiter,
        }
    }

    /// Spawn every run loop. Called once at startup.
    pub fn spawn_all(self: Arc<Self>, config: &hlh_domain::config::SchedulerConfig) {
        let stale_interval = std::time::Duration::from_secs(config.stale_check_interval_secs);
        let rollup_interval = std::time::Duration::from_secs(config.rollup_interval_secs);
        let prune_interval = std::time::Duration::from_secs(config.prune_interval_secs);

        {
            let scheduler = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(stale_interval);
                loop {
                    interval.tick().await;
                    if let Err(e) = scheduler.stale_tick().await {
                        tracing::warn!(error = %e, "stale check failed");
                    }
                }
            });
        }

        {
            let scheduler = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(rollup_interval);
                loop {
                    interval.tick().await;
                    if let Err(e) = scheduler.rollup_tick().await {
                        tracing::warn!(error = %e, "rollup failed");
                    }
                }
            });
        }

        {
            let scheduler = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(prune_interval);
                loop {
                    interval.tick().await;
                    match scheduler.prune_tick().await {
                        Ok(0) => {}
                        Ok(deleted) => tracing::info!(deleted, "retention prune complete"),
                        Err(e) => tracing::warn!(error = %e, "retention prune failed"),
                    }
                }
            });
        }

        // Housekeeping: idle SSH sessions + rate-limiter buckets.
        {
            let scheduler = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
                loop {
                    interval.tick().await;
                    scheduler.pool.evict_expired().await;
                    scheduler.limiter.prune();
                }
            });
        }
    }

    // ── Staleness + offline alerting ─────────────────────────────────

    /// Move stale online servers to offline, raise offline alerts, and emit
    /// cooldown-gated reminders for servers that stay offline. Returns how
    /// many servers were newly marked offline.
    pub async fn stale_tick(&self) -> Result<usize> {
        let mut conn = self.store.acquire().await?;
        let notifications: NotificationsConfig =
            settings::get_typed(&mut conn, "notifications").await?;
        let thresholds: ThresholdsConfig = settings::get_typed(&mut conn, "thresholds").await?;

        let cutoff = Utc::now()
            - ChronoDuration::seconds(thresholds.server_offline_seconds as i64);
        let stale = servers::list_online_stale(&mut conn, cutoff).await?;

        let mut events = Vec::new();
        let mut marked = 0usize;
        let mut handled: Vec<String> = Vec::new();

        for server in &stale {
            servers::set_status(&mut conn, &server.id, ServerStatus::Offline).await?;
            marked += 1;
            handled.push(server.id.clone());

            if server.machine_type == MachineType::Workstation {
                tracing::info!(
                    server_id = %server.id,
                    last_seen = ?server.last_seen,
                    "workstation marked offline, no alert generated"
                );
                continue;
            }

            tracing::info!(
                server_id = %server.id,
                last_seen = ?server.last_seen,
                "server marked offline"
            );
            if let Some(event) =
                alerting::trigger_offline_alert(&mut conn, server, &notifications).await?
            {
                events.push(event);
            }
        }

        // Reminder pass for servers that were already offline.
        let offline = servers::list_offline(&mut conn).await?;
        for server in offline
            .iter()
            .filter(|s| s.machine_type != MachineType::Workstation)
            .filter(|s| !handled.contains(&s.id))
        {
            if let Some(event) =
                alerting::trigger_offline_alert(&mut conn, server, &notifications).await?
            {
                events.push(event);
            }
        }
        drop(conn);

        if notifications.enabled() {
            for event in &events {
                self.notifier
                    .send_alert(&notifications.slack_webhook_url, event)
                    .await;
            }
        }

        if marked > 0 {
            tracing::info!(marked, "stale check marked server(s) offline");
        }
        Ok(marked)
    }

    // ── Rollup ───────────────────────────────────────────────────────

    /// Raw → hourly, then hourly → daily. Windows exclude the bucket that is
    /// still filling; upserts make re-runs idempotent.
    pub async fn rollup_tick(&self) -> Result<()> {
        let now = Utc::now();
        let hour = ChronoDuration::hours(1);
        let day = ChronoDuration::days(1);

        let hourly_end = trunc(now, hour)?;
        let hourly_start = trunc(now - ChronoDuration::hours(HOURLY_ROLLUP_LOOKBACK_HOURS), hour)?;
        let daily_end = trunc(now, day)?;
        let daily_start = trunc(now - ChronoDuration::days(DAILY_ROLLUP_LOOKBACK_DAYS), day)?;

        let mut conn = self.store.acquire().await?;
        let hourly = metrics::rollup_hourly(&mut conn, hourly_start, hourly_end).await?;
        let daily = metrics::rollup_daily(&mut conn, daily_start, daily_end).await?;
        tracing::debug!(hourly, daily, "rollup tick complete");
        Ok(())
    }

    // ── Retention prune ──────────────────────────────────────────────

    /// Delete beyond-retention rows in bounded batches, one commit each.
    pub async fn prune_tick(&self) -> Result<u64> {
        let now = Utc::now();
        let mut total = 0u64;

        let tiers: [(&str, DateTime<Utc>); 3] = [
            ("raw", now - ChronoDuration::days(RAW_RETENTION_DAYS)),
            ("hourly", now - ChronoDuration::days(HOURLY_RETENTION_DAYS)),
            ("daily", now - ChronoDuration::days(DAILY_RETENTION_DAYS)),
        ];

        for (tier, cutoff) in tiers {
            loop {
                let mut conn = self.store.acquire().await?;
                let deleted = match tier {
                    "raw" => metrics::prune_raw_batch(&mut conn, cutoff, PRUNE_BATCH_SIZE).await?,
                    "hourly" => {
                        metrics::prune_hourly_batch(&mut conn, cutoff, PRUNE_BATCH_SIZE).await?
                    }
                    _ => metrics::prune_daily_batch(&mut conn, cutoff, PRUNE_BATCH_SIZE).await?,
                };
                total += deleted;
                if deleted < u64::from(PRUNE_BATCH_SIZE) {
                    break;
                }
            }
        }

        Ok(total)
    }
}

fn trunc(ts: DateTime<Utc>, granularity: ChronoDuration) -> Result<DateTime<Utc>> {
    ts.duration_trunc(granularity)
        .map_err(|e| Error::Internal(format!("timestamp truncation: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hlh_domain::alert::{AlertStatus, AlertType};
    use hlh_domain::server::Server;
    use hlh_store::alerts;

    async fn scheduler_with_store() -> (Arc<Scheduler>, Store) {
        let store = Store::connect_in_memory().await.unwrap();
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            Arc::new(Notifier::new()),
            Arc::new(SshPool::new(
                hlh_ssh::PoolConfig::default(),
                Arc::new(crate::host_keys::DbHostKeys::new(store.clone())),
            )),
            Arc::new(RateLimiter::new()),
        ));
        (scheduler, store)
    }

    async fn seed(
        store: &Store,
        id: &str,
        machine_type: MachineType,
        last_seen_secs_ago: i64,
    ) -> Server {
        let mut conn = store.acquire().await.unwrap();
        servers::create(
            &mut conn,
            servers::CreateServer {
                id: id.into(),
                guid: Some(uuid::Uuid::new_v4().to_string()),
                hostname: format!("{id}.local"),
                display_name: None,
                status: ServerStatus::Online,
                last_seen: Some(Utc::now() - ChronoDuration::seconds(last_seen_secs_ago)),
                machine_type,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn server_just_inside_threshold_stays_online() {
        let (scheduler, store) = scheduler_with_store().await;
        seed(&store, "fresh", MachineType::Server, 179).await;

        let marked = scheduler.stale_tick().await.unwrap();
        assert_eq!(marked, 0);

        let mut conn = store.acquire().await.unwrap();
        let server = servers::require(&mut conn, "fresh").await.unwrap();
        assert_eq!(server.status, ServerStatus::Online);
    }

    #[tokio::test]
    async fn stale_server_goes_offline_with_alert() {
        let (scheduler, store) = scheduler_with_store().await;
        seed(&store, "stale", MachineType::Server, 181).await;

        let marked = scheduler.stale_tick().await.unwrap();
        assert_eq!(marked, 1);

        let mut conn = store.acquire().await.unwrap();
        let server = servers::require(&mut conn, "stale").await.unwrap();
        assert_eq!(server.status, ServerStatus::Offline);

        let open = alerts::open_alert(&mut conn, "stale", AlertType::Offline)
            .await
            .unwrap();
        assert!(open.is_some());
    }

    #[tokio::test]
    async fn workstations_go_offline_without_alert() {
        let (scheduler, store) = scheduler_with_store().await;
        seed(&store, "laptop", MachineType::Workstation, 300).await;

        scheduler.stale_tick().await.unwrap();

        let mut conn = store.acquire().await.unwrap();
        let server = servers::require(&mut conn, "laptop").await.unwrap();
        assert_eq!(server.status, ServerStatus::Offline);
        assert!(alerts::open_alert(&mut conn, "laptop", AlertType::Offline)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn inactive_servers_are_skipped() {
        let (scheduler, store) = scheduler_with_store().await;
        seed(&store, "retired", MachineType::Server, 500).await;
        {
            let mut conn = store.acquire().await.unwrap();
            servers::set_inactive(&mut conn, "retired", true).await.unwrap();
        }

        let marked = scheduler.stale_tick().await.unwrap();
        assert_eq!(marked, 0);
    }

    #[tokio::test]
    async fn repeated_ticks_keep_one_open_offline_alert() {
        let (scheduler, store) = scheduler_with_store().await;
        seed(&store, "stale", MachineType::Server, 400).await;

        scheduler.stale_tick().await.unwrap();
        scheduler.stale_tick().await.unwrap();
        scheduler.stale_tick().await.unwrap();

        let mut conn = store.acquire().await.unwrap();
        let open = alerts::list(&mut conn, Some("stale"), Some(AlertStatus::Open), 10)
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn prune_tick_removes_old_rows() {
        let (scheduler, store) = scheduler_with_store().await;
        seed(&store, "alpha", MachineType::Server, 0).await;
        {
            let mut conn = store.acquire().await.unwrap();
            let payload = hlh_domain::heartbeat::MetricsPayload {
                cpu_percent: Some(10.0),
                ..Default::default()
            };
            metrics::insert_sample(
                &mut conn,
                "alpha",
                Utc::now() - ChronoDuration::days(8),
                &payload,
            )
            .await
            .unwrap();
            metrics::insert_sample(&mut conn, "alpha", Utc::now(), &payload)
                .await
                .unwrap();
        }

        let deleted = scheduler.prune_tick().await.unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn rollup_tick_fills_hourly_buckets() {
        let (scheduler, store) = scheduler_with_store().await;
        seed(&store, "alpha", MachineType::Server, 0).await;
        {
            let mut conn = store.acquire().await.unwrap();
            let payload = hlh_domain::heartbeat::MetricsPayload {
                cpu_percent: Some(40.0),
                ..Default::default()
            };
            // Sample safely in a closed hour.
            metrics::insert_sample(
                &mut conn,
                "alpha",
                Utc::now() - ChronoDuration::hours(2),
                &payload,
            )
            .await
            .unwrap();
        }

        scheduler.rollup_tick().await.unwrap();

        let mut conn = store.acquire().await.unwrap();
        let buckets = metrics::hourly_since(
            &mut conn,
            "alpha",
            Utc::now() - ChronoDuration::hours(3),
        )
        .await
        .unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].cpu_avg, Some(40.0));
    }
}
