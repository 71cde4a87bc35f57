//! Alert evaluation: metric thresholds with hysteresis, service-down alerts,
//! offline alerts, and cooldown-governed notification events.
//!
//! All state mutation happens inside the caller's transaction; returned
//! [`AlertEvent`]s are already filtered by notify flags and cooldowns, so the
//! caller only needs to hand them to the notifier.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqliteConnection;

use hlh_domain::alert::{Alert, AlertEvent, AlertSeverity, AlertType, BreachLevel};
use hlh_domain::heartbeat::{MetricsPayload, ServicePayload};
use hlh_domain::server::Server;
use hlh_domain::service::ServiceState;
use hlh_domain::settings::{CooldownConfig, MetricThreshold, NotificationsConfig};
use hlh_domain::Result;
use hlh_store::{alerts, services};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Metric thresholds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn breach_level(value: f64, threshold: &MetricThreshold) -> Option<BreachLevel> {
    if value >= threshold.critical_percent {
        Some(BreachLevel::Critical)
    } else if value >= threshold.high_percent {
        Some(BreachLevel::High)
    } else {
        None
    }
}

fn severity_of(level: BreachLevel) -> AlertSeverity {
    match level {
        BreachLevel::High => AlertSeverity::High,
        BreachLevel::Critical => AlertSeverity::Critical,
    }
}

/// A breach is sustained after N consecutive samples, or once enough wall
/// time has passed since the first breaching sample. Zero heartbeats means
/// immediate.
fn is_sustained(
    threshold: &MetricThreshold,
    breach_count: i64,
    first_breach_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if breach_count >= i64::from(threshold.sustained_heartbeats.max(1)) {
        return true;
    }
    if threshold.sustained_seconds > 0 {
        if let Some(first) = first_breach_at {
            return (now - first) >= Duration::seconds(threshold.sustained_seconds as i64);
        }
    }
    false
}

/// Whether a notification may fire now, given the per-severity cooldown.
fn cooldown_allows(
    cooldowns: &CooldownConfig,
    severity: AlertSeverity,
    last_notified_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    match last_notified_at {
        None => true,
        Some(last) => {
            let window = Duration::minutes(cooldowns.minutes_for(severity) as i64);
            now - last >= window
        }
    }
}

/// Evaluate one metric sample against the thresholds, creating, upgrading,
/// or auto-resolving alerts. Returns the notification events to send.
pub async fn evaluate_metrics(
    conn: &mut SqliteConnection,
    server: &Server,
    metrics: &MetricsPayload,
    thresholds: &hlh_domain::settings::ThresholdsConfig,
    notifications: &NotificationsConfig,
) -> Result<Vec<AlertEvent>> {
    let now = Utc::now();
    let mut events = Vec::new();

    let samples = [
        (AlertType::Cpu, "cpu", metrics.cpu_percent, &thresholds.cpu),
        (
            AlertType::Memory,
            "memory",
            metrics.memory_percent,
            &thresholds.memory,
        ),
        (
            AlertType::Disk,
            "disk",
            metrics.disk_percent,
            &thresholds.disk,
        ),
    ];

    for (alert_type, metric_key, sample, threshold) in samples {
        let Some(value) = sample else { continue };
        if let Some(event) = evaluate_one_metric(
            conn,
            server,
            alert_type,
            metric_key,
            value,
            threshold,
            notifications,
            now,
        )
        .await?
        {
            events.push(event);
        }
    }

    Ok(events)
}

#[allow(clippy::too_many_arguments)]
async fn evaluate_one_metric(
    conn: &mut SqliteConnection,
    server: &Server,
    alert_type: AlertType,
    metric_key: &str,
    value: f64,
    threshold: &MetricThreshold,
    notifications: &NotificationsConfig,
    now: DateTime<Utc>,
) -> Result<Option<AlertEvent>> {
    let mut state = alerts::state_for(conn, &server.id, metric_key).await?;
    let candidate = breach_level(value, threshold);

    let Some(level) = candidate else {
        // Recovery sample: reset the streak and auto-resolve any open alert.
        let open = alerts::open_alert(conn, &server.id, alert_type).await?;
        state.breach_count = 0;
        state.breach_level = None;
        state.first_breach_at = None;
        alerts::upsert_state(conn, &state).await?;

        if let Some(alert) = open {
            alerts::resolve(conn, alert.id, true).await?;
            tracing::info!(
                server_id = %server.id,
                metric = metric_key,
                value,
                "alert auto-resolved on recovery sample"
            );
            if notifications.notify_on(alert.severity) {
                return Ok(Some(resolved_event(server, &alert)));
            }
        }
        return Ok(None);
    };

    // Streak bookkeeping: a level change restarts the count.
    if state.breach_level == Some(level) {
        state.breach_count += 1;
    } else {
        state.breach_level = Some(level);
        state.breach_count = 1;
        state.first_breach_at = Some(now);
    }

    let mut event = None;

    if is_sustained(threshold, state.breach_count, state.first_breach_at, now) {
        let severity = severity_of(level);
        let threshold_value = match level {
            BreachLevel::High => threshold.high_percent,
            BreachLevel::Critical => threshold.critical_percent,
        };
        let existing = alerts::open_alert(conn, &server.id, alert_type).await?;

        match existing {
            None => {
                let alert = alerts::insert(
                    conn,
                    alerts::CreateAlert {
                        server_id: server.id.clone(),
                        alert_type,
                        severity,
                        title: metric_title(alert_type, level, server),
                        message: metric_message(alert_type, value, threshold_value),
                        service_name: None,
                        threshold_value: Some(threshold_value),
                        actual_value: Some(value),
                    },
                )
                .await?;
                state.last_alert_id = Some(alert.id);
                event = maybe_notify(&mut state, notifications, &threshold_event(server, &alert), now);
            }
            Some(mut alert) if severity > alert.severity => {
                // Escalation upgrades the open alert instead of opening a
                // second one.
                alert.severity = severity;
                alert.title = metric_title(alert_type, level, server);
                alert.message = metric_message(alert_type, value, threshold_value);
                alert.threshold_value = Some(threshold_value);
                alert.actual_value = Some(value);
                alerts::update_open_fields(conn, &alert).await?;
                event = maybe_notify(&mut state, notifications, &threshold_event(server, &alert), now);
            }
            Some(mut alert) => {
                alert.actual_value = Some(value);
                alerts::update_open_fields(conn, &alert).await?;
            }
        }
    } else if let Some(mut alert) = alerts::open_alert(conn, &server.id, alert_type).await? {
        // Not (yet) sustained at this level but an alert is open — keep its
        // observed value current.
        alert.actual_value = Some(value);
        alerts::update_open_fields(conn, &alert).await?;
    }

    alerts::upsert_state(conn, &state).await?;
    Ok(event)
}

/// Gate an event on notify flags and the cooldown clock; stamps
/// `last_notified_at` when it passes.
fn maybe_notify(
    state: &mut hlh_domain::alert::AlertState,
    notifications: &NotificationsConfig,
    event: &AlertEvent,
    now: DateTime<Utc>,
) -> Option<AlertEvent> {
    if !notifications.enabled() || !notifications.notify_on(event.severity) {
        return None;
    }
    if !cooldown_allows(&notifications.cooldowns, event.severity, state.last_notified_at, now) {
        return None;
    }
    state.last_notified_at = Some(now);
    Some(event.clone())
}

fn metric_label(alert_type: AlertType) -> &'static str {
    match alert_type {
        AlertType::Cpu => "CPU",
        AlertType::Memory => "Memory",
        AlertType::Disk => "Disk",
        AlertType::Offline => "Offline",
        AlertType::Service => "Service",
    }
}

fn metric_title(alert_type: AlertType, level: BreachLevel, server: &Server) -> String {
    let level_str = match level {
        BreachLevel::High => "high",
        BreachLevel::Critical => "critical",
    };
    format!(
        "{} usage {level_str} on {}",
        metric_label(alert_type),
        server.label()
    )
}

fn metric_message(alert_type: AlertType, value: f64, threshold: f64) -> String {
    format!(
        "{} usage at {value:.1}% (threshold {threshold:.0}%)",
        metric_label(alert_type)
    )
}

fn threshold_event(server: &Server, alert: &Alert) -> AlertEvent {
    AlertEvent {
        server_id: server.id.clone(),
        server_name: server.label().to_string(),
        alert_type: alert.alert_type,
        severity: alert.severity,
        title: alert.title.clone(),
        message: alert.message.clone(),
        threshold_value: alert.threshold_value,
        actual_value: alert.actual_value,
        is_reminder: false,
        is_resolved: false,
    }
}

fn resolved_event(server: &Server, alert: &Alert) -> AlertEvent {
    AlertEvent {
        server_id: server.id.clone(),
        server_name: server.label().to_string(),
        alert_type: alert.alert_type,
        severity: alert.severity,
        title: alert.title.clone(),
        message: format!("Resolved: {}", alert.message),
        threshold_value: alert.threshold_value,
        actual_value: alert.actual_value,
        is_reminder: false,
        is_resolved: true,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Service alerts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Evaluate reported service samples against the expected-services registry.
/// Stopped/failed opens (severity by `is_critical`), running auto-resolves,
/// unknown is a no-op.
pub async fn evaluate_services(
    conn: &mut SqliteConnection,
    server: &Server,
    reported: &[ServicePayload],
    notifications: &NotificationsConfig,
) -> Result<Vec<AlertEvent>> {
    let now = Utc::now();
    let mut events = Vec::new();
    let expected = services::list_expected(conn, &server.id).await?;

    for service in expected.iter().filter(|s| s.enabled) {
        let Some(sample) = reported.iter().find(|r| r.name == service.service_name) else {
            continue;
        };

        match sample.status {
            ServiceState::Stopped | ServiceState::Failed => {
                let metric_key = format!("service:{}", service.service_name);
                let mut state = alerts::state_for(conn, &server.id, &metric_key).await?;
                let severity = if service.is_critical {
                    AlertSeverity::High
                } else {
                    AlertSeverity::Medium
                };
                let title = format!(
                    "Service {} is {}",
                    service.service_name,
                    sample.status.as_str()
                );

                let existing =
                    alerts::open_service_alert(conn, &server.id, &service.service_name).await?;
                match existing {
                    None => {
                        let alert = alerts::insert(
                            conn,
                            alerts::CreateAlert {
                                server_id: server.id.clone(),
                                alert_type: AlertType::Service,
                                severity,
                                title: title.clone(),
                                message: format!(
                                    "Expected service {} on {} reported {}",
                                    service.service_name,
                                    server.label(),
                                    sample.status.as_str()
                                ),
                                service_name: Some(service.service_name.clone()),
                                threshold_value: None,
                                actual_value: None,
                            },
                        )
                        .await?;
                        state.last_alert_id = Some(alert.id);
                        if let Some(event) =
                            maybe_notify(&mut state, notifications, &threshold_event(server, &alert), now)
                        {
                            events.push(event);
                        }
                    }
                    Some(mut alert) => {
                        // Dedup per (server, service): refresh the title when
                        // e.g. stopped becomes failed.
                        if alert.title != title {
                            alert.title = title;
                            alerts::update_open_fields(conn, &alert).await?;
                        }
                    }
                }
                alerts::upsert_state(conn, &state).await?;
            }
            ServiceState::Running => {
                if let Some(alert) =
                    alerts::open_service_alert(conn, &server.id, &service.service_name).await?
                {
                    alerts::resolve(conn, alert.id, true).await?;
                    let metric_key = format!("service:{}", service.service_name);
                    let mut state = alerts::state_for(conn, &server.id, &metric_key).await?;
                    state.breach_count = 0;
                    state.first_breach_at = None;
                    alerts::upsert_state(conn, &state).await?;
                    if notifications.enabled() && notifications.notify_on(alert.severity) {
                        events.push(resolved_event(server, &alert));
                    }
                }
            }
            // Explicit no-op: unknown usually means systemd is unavailable.
            ServiceState::Unknown => {}
        }
    }

    Ok(events)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Offline alerts (scheduler-driven)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Open (or re-notify) the offline alert for a server. First call opens the
/// alert and notifies; later calls emit reminders bounded by the critical
/// cooldown. Workstation gating happens in the scheduler.
pub async fn trigger_offline_alert(
    conn: &mut SqliteConnection,
    server: &Server,
    notifications: &NotificationsConfig,
) -> Result<Option<AlertEvent>> {
    let now = Utc::now();
    let mut state = alerts::state_for(conn, &server.id, "offline").await?;

    let existing = alerts::open_alert(conn, &server.id, AlertType::Offline).await?;
    let (alert, is_reminder) = match existing {
        Some(alert) => (alert, true),
        None => {
            let alert = alerts::insert(
                conn,
                alerts::CreateAlert {
                    server_id: server.id.clone(),
                    alert_type: AlertType::Offline,
                    severity: AlertSeverity::Critical,
                    title: format!("Server {} is offline", server.label()),
                    message: format!(
                        "No heartbeat received from {} since {}",
                        server.label(),
                        server
                            .last_seen
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "unknown".into())
                    ),
                    service_name: None,
                    threshold_value: None,
                    actual_value: None,
                },
            )
            .await?;
            state.last_alert_id = Some(alert.id);
            (alert, false)
        }
    };

    let mut event = maybe_notify(&mut state, notifications, &threshold_event(server, &alert), now);
    if let Some(e) = event.as_mut() {
        e.is_reminder = is_reminder;
    }
    alerts::upsert_state(conn, &state).await?;
    Ok(event)
}

/// Auto-resolve the offline alert when a heartbeat arrives again.
pub async fn resolve_offline_alert(
    conn: &mut SqliteConnection,
    server: &Server,
    notifications: &NotificationsConfig,
) -> Result<Option<AlertEvent>> {
    let Some(alert) = alerts::open_alert(conn, &server.id, AlertType::Offline).await? else {
        return Ok(None);
    };
    alerts::resolve(conn, alert.id, true).await?;
    tracing::info!(server_id = %server.id, "offline alert auto-resolved, heartbeat received");

    let mut state = alerts::state_for(conn, &server.id, "offline").await?;
    state.last_notified_at = None;
    alerts::upsert_state(conn, &state).await?;

    if notifications.enabled() && notifications.notify_on(alert.severity) {
        Ok(Some(resolved_event(server, &alert)))
    } else {
        Ok(None)
    }
}

/// Guard used by the ack/resolve endpoints: a service alert whose service is
/// still down may not be acknowledged or resolved by the operator.
pub async fn service_still_down(conn: &mut SqliteConnection, alert: &Alert) -> Result<bool> {
    if alert.alert_type != AlertType::Service {
        return Ok(false);
    }
    let Some(service_name) = alert.service_name.as_deref() else {
        return Ok(false);
    };
    services::is_service_down(conn, &alert.server_id, service_name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use hlh_domain::alert::AlertStatus;
    use hlh_domain::settings::ThresholdsConfig;
    use hlh_store::Store;

    async fn setup() -> (Store, Server) {
        let store = Store::connect_in_memory().await.unwrap();
        let server = {
            let mut conn = store.acquire().await.unwrap();
            hlh_store::servers::create(
                &mut conn,
                hlh_store::servers::CreateServer {
                    id: "alpha".into(),
                    guid: Some(uuid::Uuid::new_v4().to_string()),
                    hostname: "alpha.local".into(),
                    display_name: None,
                    status: hlh_domain::server::ServerStatus::Online,
                    last_seen: Some(Utc::now()),
                    machine_type: hlh_domain::server::MachineType::Server,
                },
            )
            .await
            .unwrap()
        };
        (store, server)
    }

    fn notifications() -> NotificationsConfig {
        NotificationsConfig {
            slack_webhook_url: "https://hooks.slack.com/services/T/B/x".into(),
            ..Default::default()
        }
    }

    fn cpu_sample(value: f64) -> MetricsPayload {
        MetricsPayload {
            cpu_percent: Some(value),
            ..Default::default()
        }
    }

    fn thresholds() -> ThresholdsConfig {
        let mut t = ThresholdsConfig::default();
        t.cpu.sustained_heartbeats = 3;
        t.cpu.sustained_seconds = 0;
        t
    }

    async fn eval_cpu(
        store: &Store,
        server: &Server,
        value: f64,
    ) -> Vec<AlertEvent> {
        let mut conn = store.acquire().await.unwrap();
        evaluate_metrics(
            &mut conn,
            server,
            &cpu_sample(value),
            &thresholds(),
            &notifications(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn breach_needs_sustained_samples() {
        let (store, server) = setup().await;

        // Two breaching samples: no alert yet.
        assert!(eval_cpu(&store, &server, 90.0).await.is_empty());
        assert!(eval_cpu(&store, &server, 91.0).await.is_empty());
        {
            let mut conn = store.acquire().await.unwrap();
            assert!(alerts::open_alert(&mut conn, "alpha", AlertType::Cpu)
                .await
                .unwrap()
                .is_none());
        }

        // Third consecutive sample opens the alert and notifies.
        let events = eval_cpu(&store, &server, 92.0).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, AlertSeverity::High);
        assert!(!events[0].is_resolved);

        let mut conn = store.acquire().await.unwrap();
        let alert = alerts::open_alert(&mut conn, "alpha", AlertType::Cpu)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.severity, AlertSeverity::High);
        assert_eq!(alert.actual_value, Some(92.0));
    }

    #[tokio::test]
    async fn interrupted_streak_resets_counter() {
        let (store, server) = setup().await;
        eval_cpu(&store, &server, 90.0).await;
        eval_cpu(&store, &server, 91.0).await;
        // Recovery sample resets the streak.
        eval_cpu(&store, &server, 40.0).await;
        eval_cpu(&store, &server, 92.0).await;
        let events = eval_cpu(&store, &server, 93.0).await;
        assert!(events.is_empty(), "only two samples since reset");
    }

    #[tokio::test]
    async fn escalation_upgrades_open_alert() {
        let (store, server) = setup().await;
        for _ in 0..3 {
            eval_cpu(&store, &server, 90.0).await;
        }
        // Critical streak: counter restarts at the new level.
        eval_cpu(&store, &server, 97.0).await;
        eval_cpu(&store, &server, 97.5).await;
        eval_cpu(&store, &server, 98.0).await;

        let mut conn = store.acquire().await.unwrap();
        let alert = alerts::open_alert(&mut conn, "alpha", AlertType::Cpu)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.severity, AlertSeverity::Critical);
        // Still the same alert row (dedup), upgraded in place.
        let all = alerts::list(&mut conn, Some("alpha"), None, 10).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn recovery_auto_resolves() {
        let (store, server) = setup().await;
        for _ in 0..3 {
            eval_cpu(&store, &server, 90.0).await;
        }
        let events = eval_cpu(&store, &server, 50.0).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_resolved);

        let mut conn = store.acquire().await.unwrap();
        let all = alerts::list(&mut conn, Some("alpha"), None, 10).await.unwrap();
        assert_eq!(all[0].status, AlertStatus::Resolved);
        assert!(all[0].auto_resolved);
    }

    #[tokio::test]
    async fn notification_cooldown_suppresses_repeat() {
        let (store, server) = setup().await;
        for _ in 0..3 {
            eval_cpu(&store, &server, 90.0).await;
        }
        // Resolve by hand, then breach again immediately: the new alert's
        // notification falls inside the high cooldown window.
        {
            let mut conn = store.acquire().await.unwrap();
            let alert = alerts::open_alert(&mut conn, "alpha", AlertType::Cpu)
                .await
                .unwrap()
                .unwrap();
            alerts::resolve(&mut conn, alert.id, false).await.unwrap();
        }
        for _ in 0..2 {
            assert!(eval_cpu(&store, &server, 90.0).await.is_empty());
        }
        let events = eval_cpu(&store, &server, 90.0).await;
        assert!(events.is_empty(), "cooldown must suppress the repeat");

        // The alert itself still opened.
        let mut conn = store.acquire().await.unwrap();
        assert!(alerts::open_alert(&mut conn, "alpha", AlertType::Cpu)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn disk_with_zero_sustain_alerts_immediately() {
        let (store, server) = setup().await;
        let mut conn = store.acquire().await.unwrap();
        let events = evaluate_metrics(
            &mut conn,
            &server,
            &MetricsPayload {
                disk_percent: Some(85.0),
                ..Default::default()
            },
            &ThresholdsConfig::default(),
            &notifications(),
        )
        .await
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].alert_type, AlertType::Disk);
    }

    #[tokio::test]
    async fn service_lifecycle_stopped_then_running() {
        let (store, server) = setup().await;
        let mut conn = store.acquire().await.unwrap();
        services::upsert_expected(&mut conn, "alpha", "plex", None, true, true)
            .await
            .unwrap();

        let stopped = ServicePayload {
            name: "plex".into(),
            status: ServiceState::Stopped,
            status_reason: None,
            pid: None,
            memory_mb: None,
            cpu_percent: None,
        };
        let events = evaluate_services(&mut conn, &server, &[stopped], &notifications())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, AlertSeverity::High);
        assert_eq!(events[0].title, "Service plex is stopped");

        let alert = alerts::open_service_alert(&mut conn, "alpha", "plex")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.title, "Service plex is stopped");

        let running = ServicePayload {
            name: "plex".into(),
            status: ServiceState::Running,
            status_reason: None,
            pid: Some(4242),
            memory_mb: None,
            cpu_percent: None,
        };
        let events = evaluate_services(&mut conn, &server, &[running], &notifications())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_resolved);

        let resolved = alerts::require(&mut conn, alert.id).await.unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert!(resolved.auto_resolved);
    }

    #[tokio::test]
    async fn non_critical_service_opens_medium_alert() {
        let (store, server) = setup().await;
        let mut conn = store.acquire().await.unwrap();
        services::upsert_expected(&mut conn, "alpha", "sonarr", None, false, true)
            .await
            .unwrap();

        let failed = ServicePayload {
            name: "sonarr".into(),
            status: ServiceState::Failed,
            status_reason: None,
            pid: None,
            memory_mb: None,
            cpu_percent: None,
        };
        let events = evaluate_services(&mut conn, &server, &[failed], &notifications())
            .await
            .unwrap();
        assert_eq!(events[0].severity, AlertSeverity::Medium);
        assert_eq!(events[0].title, "Service sonarr is failed");
    }

    #[tokio::test]
    async fn unknown_status_and_disabled_services_are_ignored() {
        let (store, server) = setup().await;
        let mut conn = store.acquire().await.unwrap();
        services::upsert_expected(&mut conn, "alpha", "plex", None, true, true)
            .await
            .unwrap();
        services::upsert_expected(&mut conn, "alpha", "old-svc", None, true, false)
            .await
            .unwrap();

        let samples = vec![
            ServicePayload {
                name: "plex".into(),
                status: ServiceState::Unknown,
                status_reason: Some("systemd not available (container)".into()),
                pid: None,
                memory_mb: None,
                cpu_percent: None,
            },
            ServicePayload {
                name: "old-svc".into(),
                status: ServiceState::Stopped,
                status_reason: None,
                pid: None,
                memory_mb: None,
                cpu_percent: None,
            },
        ];
        let events = evaluate_services(&mut conn, &server, &samples, &notifications())
            .await
            .unwrap();
        assert!(events.is_empty());
        assert!(alerts::list(&mut conn, Some("alpha"), None, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn offline_alert_first_fire_then_cooled_reminder() {
        let (store, server) = setup().await;
        let mut conn = store.acquire().await.unwrap();

        let first = trigger_offline_alert(&mut conn, &server, &notifications())
            .await
            .unwrap()
            .unwrap();
        assert!(!first.is_reminder);
        assert_eq!(first.severity, AlertSeverity::Critical);

        // Immediately after: reminder suppressed by cooldown.
        let second = trigger_offline_alert(&mut conn, &server, &notifications())
            .await
            .unwrap();
        assert!(second.is_none());

        // Only one open offline alert either way.
        assert_eq!(
            alerts::list(&mut conn, Some("alpha"), Some(AlertStatus::Open), 10)
                .await
                .unwrap()
                .len(),
            1
        );

        // Backdate the cooldown clock: the next trigger is a reminder.
        let mut state = alerts::state_for(&mut conn, "alpha", "offline").await.unwrap();
        state.last_notified_at = Some(Utc::now() - Duration::minutes(31));
        alerts::upsert_state(&mut conn, &state).await.unwrap();

        let third = trigger_offline_alert(&mut conn, &server, &notifications())
            .await
            .unwrap()
            .unwrap();
        assert!(third.is_reminder);
    }

    #[tokio::test]
    async fn offline_alert_resolves_on_heartbeat() {
        let (store, server) = setup().await;
        let mut conn = store.acquire().await.unwrap();
        trigger_offline_alert(&mut conn, &server, &notifications())
            .await
            .unwrap();

        let event = resolve_offline_alert(&mut conn, &server, &notifications())
            .await
            .unwrap()
            .unwrap();
        assert!(event.is_resolved);
        assert!(alerts::open_alert(&mut conn, "alpha", AlertType::Offline)
            .await
            .unwrap()
            .is_none());
    }
}
