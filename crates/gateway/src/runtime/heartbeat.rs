//! Heartbeat ingestion — the hot path.
//!
//! The pipeline runs its steps in strict order inside one transaction:
//! acknowledge prior command results, resolve identity, reject inactive
//! servers, refresh volatile fields, infer the machine category, persist
//! telemetry, evaluate alerts, then dispatch at most one approved command.
//! Notifications go out after commit and never fail the request.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use sqlx::SqliteConnection;

use hlh_domain::action::{
    truncate_output, ActionStatus, RemediationAction, BACKGROUND_START_SENTINEL,
};
use hlh_domain::alert::AlertEvent;
use hlh_domain::heartbeat::{HeartbeatRequest, HeartbeatResponse, PendingCommand};
use hlh_domain::server::{is_valid_guid, is_valid_server_id, Server, ServerStatus};
use hlh_domain::settings::{NotificationsConfig, ThresholdsConfig};
use hlh_domain::{Error, Result};
use hlh_store::{actions, metrics, servers, services, settings, Store};

use crate::category::infer_category;
use crate::notify::{ActionEvent, Notifier};
use crate::runtime::alerting;

/// Timeout handed to agents with each dispatched command.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Process one heartbeat. `peer_ip` is the connection peer, used to refresh
/// the server's volatile address.
pub async fn process_heartbeat(
    store: &Store,
    notifier: Arc<Notifier>,
    request: HeartbeatRequest,
    peer_ip: Option<String>,
) -> Result<HeartbeatResponse> {
    validate_identity_fields(&request)?;

    let now = Utc::now();
    let mut tx = store.begin().await?;

    // 1. Acknowledge results reported for previously dispatched commands.
    let acked = acknowledge_results(&mut *tx, &request).await?;
    let results_acknowledged: Vec<i64> = acked.iter().map(|a| a.action.id).collect();

    // 2. Resolve identity: GUID first, server_id fallback, GUID migration.
    let (mut server, server_registered) = resolve_server(&mut *tx, &request, now).await?;

    // 3. Inactive servers get a hard refusal; the agent should be removed.
    if server.is_inactive {
        tracing::warn!(
            server_id = %server.id,
            "rejected heartbeat from inactive server"
        );
        return Err(Error::InactiveServer(server.id));
    }

    let was_offline = server.status == ServerStatus::Offline;

    // 4. Volatile fields refresh on every heartbeat.
    server.status = ServerStatus::Online;
    server.last_seen = Some(now);
    server.hostname = request.hostname.clone();
    if let Some(ip) = peer_ip {
        server.ip_address = Some(ip);
    }
    if let Some(os) = &request.os_info {
        server.os_distribution = os.distribution.clone();
        server.os_version = os.version.clone();
        server.kernel_version = os.kernel.clone();
        server.architecture = os.architecture.clone();
    }
    if let Some(cpu) = &request.cpu_info {
        server.cpu_model = cpu.cpu_model.clone();
        server.cpu_cores = cpu.cpu_cores;
    }
    if let Some(version) = &request.agent_version {
        server.agent_version = Some(version.clone());
    }
    if let Some(mode) = request.agent_mode {
        server.agent_mode = mode;
    }
    if let Some(updates) = request.updates_available {
        server.updates_available = updates;
    }
    if let Some(security) = request.security_updates {
        server.security_updates = security;
    }

    // 5. Machine-category inference, unless the operator pinned it.
    if server.machine_category_source != hlh_domain::server::CategorySource::User {
        if let Some(cpu) = &request.cpu_info {
            let inferred = infer_category(
                cpu.cpu_model.as_deref(),
                request
                    .os_info
                    .as_ref()
                    .and_then(|os| os.architecture.as_deref()),
            );
            if let Some(category) = inferred {
                server.machine_category = Some(category);
                server.machine_category_source = hlh_domain::server::CategorySource::Auto;
            }
        }
    }

    servers::update(&mut *tx, &server).await?;

    // 6. Persist the metric sample, one row per heartbeat that carries one.
    if let Some(payload) = &request.metrics {
        metrics::insert_sample(&mut *tx, &server.id, request.timestamp, payload).await?;
    }

    // 7. Service status rows + pending-package replacement.
    if let Some(reported) = &request.services {
        services::insert_status_rows(&mut *tx, &server.id, request.timestamp, reported).await?;
    }
    if let Some(packages) = &request.packages {
        services::replace_pending_packages(&mut *tx, &server.id, packages).await?;
    }

    // 8. Alert evaluation.
    let notifications: NotificationsConfig = settings::get_typed(&mut *tx, "notifications").await?;
    let thresholds: ThresholdsConfig = settings::get_typed(&mut *tx, "thresholds").await?;

    let mut alert_events: Vec<AlertEvent> = Vec::new();
    if was_offline {
        if let Some(event) =
            alerting::resolve_offline_alert(&mut *tx, &server, &notifications).await?
        {
            alert_events.push(event);
        }
    }
    if let Some(payload) = &request.metrics {
        alert_events.extend(
            alerting::evaluate_metrics(&mut *tx, &server, payload, &thresholds, &notifications)
                .await?,
        );
    }
    if let Some(reported) = &request.services {
        alert_events.extend(
            alerting::evaluate_services(&mut *tx, &server, reported, &notifications).await?,
        );
    }

    // 9. Action notifications for the just-acknowledged results. Background
    // starts are acknowledged but never notified; only the final result is.
    let action_events: Vec<ActionEvent> = if notifications.enabled()
        && notifications.notify_on_remediation
    {
        acked
            .iter()
            .filter(|a| !a.background_start)
            .map(|a| action_event(&server, &a.action))
            .collect()
    } else {
        Vec::new()
    };

    // 10. Dispatch the oldest approved action, at most one per heartbeat.
    let mut pending_commands = Vec::new();
    if let Some(mut action) = actions::oldest_approved(&mut *tx, &server.id).await? {
        debug_assert!(action.status.can_transition_to(ActionStatus::Executing));
        action.status = ActionStatus::Executing;
        action.executed_at = Some(now);
        actions::update(&mut *tx, &action).await?;
        tracing::info!(
            action_id = action.id,
            server_id = %server.id,
            action_type = %action.action_type,
            "delivering action to agent"
        );
        pending_commands.push(pending_command(&action));
    }

    tx.commit().await?;

    // Post-commit: notifications are fire-and-forget.
    if notifications.enabled() {
        let webhook = notifications.slack_webhook_url.clone();
        let notifier = notifier.clone();
        tokio::spawn(async move {
            for event in &alert_events {
                notifier.send_alert(&webhook, event).await;
            }
            for event in &action_events {
                notifier.send_action(&webhook, event).await;
            }
        });
    }

    Ok(HeartbeatResponse::ok(
        server_registered,
        pending_commands,
        results_acknowledged,
    ))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Steps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn validate_identity_fields(request: &HeartbeatRequest) -> Result<()> {
    if !is_valid_server_id(&request.server_id) {
        return Err(Error::Validation(format!(
            "server_id must match [a-z0-9-]+ (got '{}')",
            request.server_id
        )));
    }
    if request.hostname.is_empty() || request.hostname.len() > 255 {
        return Err(Error::Validation("hostname must be 1-255 characters".into()));
    }
    if let Some(guid) = &request.server_guid {
        if !is_valid_guid(guid) {
            return Err(Error::Validation(format!(
                "server_guid must be a UUID v4 (got '{guid}')"
            )));
        }
    }
    Ok(())
}

struct AckedResult {
    action: RemediationAction,
    /// Result stdout carried the background-start sentinel: acknowledged,
    /// still executing, not notified.
    background_start: bool,
}

async fn acknowledge_results(
    conn: &mut SqliteConnection,
    request: &HeartbeatRequest,
) -> Result<Vec<AckedResult>> {
    let mut acked = Vec::new();
    let Some(results) = &request.command_results else {
        return Ok(acked);
    };

    for result in results {
        let Some(mut action) = actions::get(conn, result.action_id).await? else {
            tracing::warn!(
                action_id = result.action_id,
                server_id = %request.server_id,
                "result reported for unknown action"
            );
            continue;
        };

        // Idempotent: anything not mid-flight was already acknowledged (or
        // never dispatched) — a late duplicate changes nothing.
        if action.status != ActionStatus::Executing {
            tracing::debug!(
                action_id = action.id,
                status = ?action.status,
                "ignoring result for non-executing action"
            );
            continue;
        }

        action.exit_code = Some(result.exit_code);
        action.stdout = result.stdout.as_deref().map(truncate_output);
        action.stderr = result.stderr.as_deref().map(truncate_output);
        action.completed_at = Some(result.completed_at);

        let background_start = result
            .stdout
            .as_deref()
            .is_some_and(|out| out.contains(BACKGROUND_START_SENTINEL));

        if background_start {
            // Still running on the host; acknowledge so the agent stops
            // re-reporting, but keep the action executing until the final
            // result lands.
            tracing::info!(action_id = action.id, "action started in background");
        } else if result.exit_code == 0 {
            action.status = ActionStatus::Completed;
            tracing::info!(action_id = action.id, "action completed");
        } else {
            action.status = ActionStatus::Failed;
            tracing::warn!(
                action_id = action.id,
                exit_code = result.exit_code,
                "action failed"
            );
        }

        actions::update(conn, &action).await?;
        acked.push(AckedResult {
            action,
            background_start,
        });
    }

    Ok(acked)
}

async fn resolve_server(
    conn: &mut SqliteConnection,
    request: &HeartbeatRequest,
    now: chrono::DateTime<Utc>,
) -> Result<(Server, bool)> {
    // GUID is the permanent identity and wins over the slug.
    if let Some(guid) = &request.server_guid {
        if let Some(server) = servers::get_by_guid(conn, guid).await? {
            return Ok((server, false));
        }
    }

    if let Some(mut server) = servers::get(conn, &request.server_id).await? {
        if let Some(guid) = &request.server_guid {
            match &server.guid {
                None => {
                    // Migration: an upgraded agent brings a GUID to a legacy
                    // row.
                    server.guid = Some(guid.clone());
                    servers::update(conn, &server).await?;
                    tracing::info!(
                        server_id = %server.id,
                        guid = %guid,
                        "adopted GUID for existing server"
                    );
                }
                Some(existing) if existing != guid => {
                    tracing::error!(
                        server_id = %server.id,
                        existing_guid = %existing,
                        presented_guid = %guid,
                        "GUID mismatch on heartbeat"
                    );
                    return Err(Error::Conflict(format!(
                        "Server '{}' already has a different GUID",
                        server.id
                    )));
                }
                Some(_) => {}
            }
        }
        return Ok((server, false));
    }

    // Unknown server: auto-register.
    let server = servers::create(
        conn,
        servers::CreateServer {
            id: request.server_id.clone(),
            guid: request.server_guid.clone(),
            hostname: request.hostname.clone(),
            display_name: None,
            status: ServerStatus::Online,
            last_seen: Some(now),
            machine_type: hlh_domain::server::MachineType::Server,
        },
    )
    .await?;
    tracing::info!(
        server_id = %server.id,
        guid = server.guid.as_deref().unwrap_or("none"),
        "auto-registered new server"
    );
    Ok((server, true))
}

fn pending_command(action: &RemediationAction) -> PendingCommand {
    let mut parameters = HashMap::new();
    if let Some(service) = &action.service_name {
        parameters.insert("service_name".to_string(), service.clone());
    }
    PendingCommand {
        action_id: action.id,
        action_type: action.action_type.clone(),
        command: action.command.clone(),
        parameters,
        timeout_seconds: DEFAULT_COMMAND_TIMEOUT_SECS,
    }
}

fn action_event(server: &Server, action: &RemediationAction) -> ActionEvent {
    ActionEvent {
        action_id: action.id,
        server_id: server.id.clone(),
        server_name: server.hostname.clone(),
        action_type: action.action_type.clone(),
        service_name: action.service_name.clone(),
        is_success: action.status == ActionStatus::Completed,
        exit_code: action.exit_code,
        stderr: action.stderr.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hlh_domain::heartbeat::{CommandResultPayload, MetricsPayload};

    const GUID_A: &str = "11111111-1111-4111-8111-111111111111";
    const GUID_B: &str = "22222222-2222-4222-8222-222222222222";

    fn request(server_id: &str, guid: Option<&str>) -> HeartbeatRequest {
        HeartbeatRequest {
            server_guid: guid.map(String::from),
            server_id: server_id.into(),
            hostname: format!("{server_id}.local"),
            timestamp: Utc::now(),
            agent_version: Some("1.2.0".into()),
            agent_mode: None,
            os_info: None,
            cpu_info: None,
            metrics: None,
            updates_available: None,
            security_updates: None,
            services: None,
            packages: None,
            command_results: None,
        }
    }

    async fn heartbeat(
        store: &Store,
        req: HeartbeatRequest,
    ) -> Result<HeartbeatResponse> {
        process_heartbeat(store, Arc::new(Notifier::new()), req, Some("10.0.0.9".into())).await
    }

    #[tokio::test]
    async fn unknown_server_is_auto_registered() {
        let store = Store::connect_in_memory().await.unwrap();
        let resp = heartbeat(&store, request("delta", Some(GUID_A))).await.unwrap();
        assert!(resp.server_registered);
        assert_eq!(resp.status, "ok");

        let mut conn = store.acquire().await.unwrap();
        let server = servers::require(&mut conn, "delta").await.unwrap();
        assert_eq!(server.guid.as_deref(), Some(GUID_A));
        assert_eq!(server.status, ServerStatus::Online);
        assert_eq!(server.ip_address.as_deref(), Some("10.0.0.9"));
    }

    #[tokio::test]
    async fn legacy_server_adopts_guid() {
        let store = Store::connect_in_memory().await.unwrap();
        {
            let mut conn = store.acquire().await.unwrap();
            servers::create(
                &mut conn,
                servers::CreateServer {
                    id: "beta".into(),
                    guid: None,
                    hostname: "beta.local".into(),
                    display_name: None,
                    status: ServerStatus::Unknown,
                    last_seen: None,
                    machine_type: hlh_domain::server::MachineType::Server,
                },
            )
            .await
            .unwrap();
        }

        let resp = heartbeat(&store, request("beta", Some(GUID_A))).await.unwrap();
        assert!(!resp.server_registered);

        let mut conn = store.acquire().await.unwrap();
        let server = servers::require(&mut conn, "beta").await.unwrap();
        assert_eq!(server.guid.as_deref(), Some(GUID_A));
    }

    #[tokio::test]
    async fn guid_mismatch_is_a_conflict() {
        let store = Store::connect_in_memory().await.unwrap();
        heartbeat(&store, request("beta", Some(GUID_A))).await.unwrap();

        let err = heartbeat(&store, request("beta", Some(GUID_B))).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn inactive_server_is_rejected() {
        let store = Store::connect_in_memory().await.unwrap();
        heartbeat(&store, request("beta", Some(GUID_A))).await.unwrap();
        {
            let mut conn = store.acquire().await.unwrap();
            servers::set_inactive(&mut conn, "beta", true).await.unwrap();
        }

        let err = heartbeat(&store, request("beta", Some(GUID_A))).await.unwrap_err();
        assert!(matches!(err, Error::InactiveServer(_)));
    }

    #[tokio::test]
    async fn metrics_row_inserted_per_heartbeat_with_payload() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut req = request("delta", Some(GUID_A));
        req.metrics = Some(MetricsPayload {
            cpu_percent: Some(12.0),
            ..Default::default()
        });

        heartbeat(&store, req.clone()).await.unwrap();
        heartbeat(&store, req.clone()).await.unwrap();
        // No payload: no extra row.
        heartbeat(&store, request("delta", Some(GUID_A))).await.unwrap();

        let mut conn = store.acquire().await.unwrap();
        let rows = metrics::raw_since(
            &mut conn,
            "delta",
            Utc::now() - chrono::Duration::hours(1),
        )
        .await
        .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn command_dispatch_lifecycle() {
        let store = Store::connect_in_memory().await.unwrap();
        heartbeat(&store, request("gamma", Some(GUID_A))).await.unwrap();

        let action = {
            let mut conn = store.acquire().await.unwrap();
            actions::create(
                &mut conn,
                actions::CreateAction {
                    server_id: "gamma".into(),
                    action_type: "restart_service".into(),
                    command: "systemctl restart plex".into(),
                    service_name: Some("plex".into()),
                    status: ActionStatus::Approved,
                    approved_by: Some("auto".into()),
                },
            )
            .await
            .unwrap()
        };

        // First heartbeat delivers the command and marks it executing.
        let resp = heartbeat(&store, request("gamma", Some(GUID_A))).await.unwrap();
        assert_eq!(resp.pending_commands.len(), 1);
        let delivered = &resp.pending_commands[0];
        assert_eq!(delivered.action_id, action.id);
        assert_eq!(delivered.parameters.get("service_name").unwrap(), "plex");
        assert_eq!(delivered.timeout_seconds, 30);
        {
            let mut conn = store.acquire().await.unwrap();
            let db_action = actions::require(&mut conn, action.id).await.unwrap();
            assert_eq!(db_action.status, ActionStatus::Executing);
            assert!(db_action.executed_at.is_some());
        }

        // Second heartbeat without a result: nothing to deliver.
        let resp = heartbeat(&store, request("gamma", Some(GUID_A))).await.unwrap();
        assert!(resp.pending_commands.is_empty());

        // Third heartbeat reports the result: completed + acknowledged.
        let mut req = request("gamma", Some(GUID_A));
        req.command_results = Some(vec![CommandResultPayload {
            action_id: action.id,
            exit_code: 0,
            stdout: Some("ok".into()),
            stderr: Some(String::new()),
            executed_at: Utc::now(),
            completed_at: Utc::now(),
        }]);
        let resp = heartbeat(&store, req).await.unwrap();
        assert_eq!(resp.results_acknowledged, vec![action.id]);

        let mut conn = store.acquire().await.unwrap();
        let done = actions::require(&mut conn, action.id).await.unwrap();
        assert_eq!(done.status, ActionStatus::Completed);
        assert_eq!(done.exit_code, Some(0));
    }

    #[tokio::test]
    async fn duplicate_result_ack_is_idempotent() {
        let store = Store::connect_in_memory().await.unwrap();
        heartbeat(&store, request("gamma", Some(GUID_A))).await.unwrap();
        let action = {
            let mut conn = store.acquire().await.unwrap();
            actions::create(
                &mut conn,
                actions::CreateAction {
                    server_id: "gamma".into(),
                    action_type: "clear_logs".into(),
                    command: "journalctl --vacuum-time=7d".into(),
                    service_name: None,
                    status: ActionStatus::Approved,
                    approved_by: Some("auto".into()),
                },
            )
            .await
            .unwrap()
        };
        heartbeat(&store, request("gamma", Some(GUID_A))).await.unwrap();

        let result = CommandResultPayload {
            action_id: action.id,
            exit_code: 0,
            stdout: None,
            stderr: None,
            executed_at: Utc::now(),
            completed_at: Utc::now(),
        };
        let mut req = request("gamma", Some(GUID_A));
        req.command_results = Some(vec![result.clone()]);
        let resp = heartbeat(&store, req).await.unwrap();
        assert_eq!(resp.results_acknowledged, vec![action.id]);

        // Replay: no state change, nothing newly acknowledged.
        let mut replay = request("gamma", Some(GUID_A));
        replay.command_results = Some(vec![result]);
        let resp = heartbeat(&store, replay).await.unwrap();
        assert!(resp.results_acknowledged.is_empty());
    }

    #[tokio::test]
    async fn background_start_keeps_action_executing() {
        let store = Store::connect_in_memory().await.unwrap();
        heartbeat(&store, request("gamma", Some(GUID_A))).await.unwrap();
        let action = {
            let mut conn = store.acquire().await.unwrap();
            actions::create(
                &mut conn,
                actions::CreateAction {
                    server_id: "gamma".into(),
                    action_type: "apply_updates".into(),
                    command: "apt-get update && apt-get upgrade -y".into(),
                    service_name: None,
                    status: ActionStatus::Approved,
                    approved_by: Some("auto".into()),
                },
            )
            .await
            .unwrap()
        };
        heartbeat(&store, request("gamma", Some(GUID_A))).await.unwrap();

        // Agent reports the detach marker: acknowledged but still executing.
        let mut req = request("gamma", Some(GUID_A));
        req.command_results = Some(vec![CommandResultPayload {
            action_id: action.id,
            exit_code: 0,
            stdout: Some("Started background execution".into()),
            stderr: None,
            executed_at: Utc::now(),
            completed_at: Utc::now(),
        }]);
        let resp = heartbeat(&store, req).await.unwrap();
        assert_eq!(resp.results_acknowledged, vec![action.id]);
        {
            let mut conn = store.acquire().await.unwrap();
            let db_action = actions::require(&mut conn, action.id).await.unwrap();
            assert_eq!(db_action.status, ActionStatus::Executing);
        }

        // Final result later completes it.
        let mut req = request("gamma", Some(GUID_A));
        req.command_results = Some(vec![CommandResultPayload {
            action_id: action.id,
            exit_code: 0,
            stdout: Some("upgraded 14 packages".into()),
            stderr: None,
            executed_at: Utc::now(),
            completed_at: Utc::now(),
        }]);
        let resp = heartbeat(&store, req).await.unwrap();
        assert_eq!(resp.results_acknowledged, vec![action.id]);
        let mut conn = store.acquire().await.unwrap();
        let done = actions::require(&mut conn, action.id).await.unwrap();
        assert_eq!(done.status, ActionStatus::Completed);
    }

    #[tokio::test]
    async fn oversized_output_truncated_at_limit() {
        let store = Store::connect_in_memory().await.unwrap();
        heartbeat(&store, request("gamma", Some(GUID_A))).await.unwrap();
        let action = {
            let mut conn = store.acquire().await.unwrap();
            actions::create(
                &mut conn,
                actions::CreateAction {
                    server_id: "gamma".into(),
                    action_type: "clear_logs".into(),
                    command: "journalctl --vacuum-time=7d".into(),
                    service_name: None,
                    status: ActionStatus::Approved,
                    approved_by: Some("auto".into()),
                },
            )
            .await
            .unwrap()
        };
        heartbeat(&store, request("gamma", Some(GUID_A))).await.unwrap();

        let mut req = request("gamma", Some(GUID_A));
        req.command_results = Some(vec![CommandResultPayload {
            action_id: action.id,
            exit_code: 1,
            stdout: Some("x".repeat(20_000)),
            stderr: Some("y".repeat(12_345)),
            executed_at: Utc::now(),
            completed_at: Utc::now(),
        }]);
        heartbeat(&store, req).await.unwrap();

        let mut conn = store.acquire().await.unwrap();
        let done = actions::require(&mut conn, action.id).await.unwrap();
        assert_eq!(done.status, ActionStatus::Failed);
        assert_eq!(done.stdout.unwrap().len(), 10_000);
        assert_eq!(done.stderr.unwrap().len(), 10_000);
    }

    #[tokio::test]
    async fn invalid_guid_is_a_validation_error() {
        let store = Store::connect_in_memory().await.unwrap();
        let err = heartbeat(&store, request("beta", Some("not-a-guid"))).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn category_inferred_from_cpu_info() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut req = request("epsilon", Some(GUID_A));
        req.cpu_info = Some(hlh_domain::heartbeat::CpuInfo {
            cpu_model: Some("Intel(R) Xeon(R) CPU E5-2680 v4".into()),
            cpu_cores: Some(28),
        });
        heartbeat(&store, req).await.unwrap();

        let mut conn = store.acquire().await.unwrap();
        let server = servers::require(&mut conn, "epsilon").await.unwrap();
        assert_eq!(
            server.machine_category,
            Some(hlh_domain::server::MachineCategory::RackServer)
        );
        assert_eq!(
            server.machine_category_source,
            hlh_domain::server::CategorySource::Auto
        );
    }
}
