//! Remediation pipeline: action lifecycle, per-server rate limiting, and
//! synchronous operator-driven command execution.
//!
//! Asynchronous delivery to agents lives in the heartbeat pipeline; this
//! module owns creation/approval/cancellation and the direct SSH path.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sqlx::SqliteConnection;

use hlh_domain::action::{ActionStatus, RemediationAction};
use hlh_domain::{Error, Result};
use hlh_ssh::{CommandOutput, SshError, SshPool};
use hlh_store::{actions, servers, Store};

use crate::runtime::resolve_ssh_access;
use crate::vault::Vault;
use crate::whitelist::CommandWhitelist;

/// Synchronous executions allowed per server per window.
pub const RATE_LIMIT_MAX_REQUESTS: usize = 10;
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rate limiter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process-local sliding-window limiter keyed by server id. State is lost on
/// restart, which is acceptable for this guard.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Record one request; `Err(retry_after_secs)` when the window is full.
    pub fn check(&self, server_id: &str) -> std::result::Result<(), u64> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(server_id.to_string()).or_default();
        bucket.retain(|t| now.duration_since(*t) < RATE_LIMIT_WINDOW);

        if bucket.len() >= RATE_LIMIT_MAX_REQUESTS {
            let oldest = bucket[0];
            let retry_after = RATE_LIMIT_WINDOW
                .saturating_sub(now.duration_since(oldest))
                .as_secs()
                .max(1);
            return Err(retry_after);
        }
        bucket.push(now);
        Ok(())
    }

    /// Drop empty buckets; called periodically by the scheduler.
    pub fn prune(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        buckets.retain(|_, bucket| {
            bucket.retain(|t| now.duration_since(*t) < RATE_LIMIT_WINDOW);
            !bucket.is_empty()
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Action lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Create an action after whitelist validation. Auto-approved unless the
/// server is paused, in which case it waits for manual approval.
pub async fn create_action(
    conn: &mut SqliteConnection,
    whitelist: &CommandWhitelist,
    server_id: &str,
    action_type: &str,
    command: &str,
) -> Result<RemediationAction> {
    let server = servers::require(conn, server_id).await?;
    let params = whitelist
        .check(command, action_type)
        .map_err(Error::WhitelistViolation)?;

    let (status, approved_by) = if server.is_paused {
        (ActionStatus::Pending, None)
    } else {
        (ActionStatus::Approved, Some("auto".to_string()))
    };

    actions::create(
        conn,
        actions::CreateAction {
            server_id: server.id,
            action_type: action_type.to_string(),
            command: command.to_string(),
            service_name: params.get("service_name").cloned(),
            status,
            approved_by,
        },
    )
    .await
}

pub async fn approve_action(
    conn: &mut SqliteConnection,
    action_id: i64,
    approved_by: &str,
) -> Result<RemediationAction> {
    let mut action = actions::require(conn, action_id).await?;
    if !action.status.can_transition_to(ActionStatus::Approved) {
        return Err(Error::Conflict(format!(
            "action {action_id} is {:?}, only pending actions can be approved",
            action.status
        )));
    }
    action.status = ActionStatus::Approved;
    action.approved_at = Some(chrono::Utc::now());
    action.approved_by = Some(approved_by.to_string());
    actions::update(conn, &action).await?;
    Ok(action)
}

pub async fn cancel_action(
    conn: &mut SqliteConnection,
    action_id: i64,
) -> Result<RemediationAction> {
    let mut action = actions::require(conn, action_id).await?;
    if !action.status.can_transition_to(ActionStatus::Cancelled) {
        return Err(Error::Conflict(format!(
            "action {action_id} is {:?}, only pending actions can be cancelled",
            action.status
        )));
    }
    action.status = ActionStatus::Cancelled;
    actions::update(conn, &action).await?;
    Ok(action)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Synchronous execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SyncExecutor<'a> {
    pub store: &'a Store,
    pub vault: &'a Vault,
    pub pool: &'a SshPool,
    pub whitelist: &'a CommandWhitelist,
    pub limiter: &'a RateLimiter,
    pub command_timeout: Duration,
}

impl SyncExecutor<'_> {
    /// `POST /servers/{id}/commands/execute`: rate limit, whitelist, SSH,
    /// return the captured output. A non-zero exit code is a successful
    /// execution — only transport and auth failures error.
    pub async fn execute(
        &self,
        server_id: &str,
        command: &str,
        action_type: &str,
    ) -> Result<CommandOutput> {
        if let Err(retry_after_secs) = self.limiter.check(server_id) {
            return Err(Error::RateLimited { retry_after_secs });
        }

        self.whitelist
            .check(command, action_type)
            .map_err(Error::WhitelistViolation)?;

        let mut conn = self.store.acquire().await?;
        let server = servers::require(&mut conn, server_id).await?;
        let access = resolve_ssh_access(&mut conn, self.vault, &server)
            .await
            .map_err(map_exec_error)?;
        drop(conn);

        let output = self
            .pool
            .execute(
                &access.target,
                &access.private_key_pem,
                command,
                self.command_timeout,
            )
            .await
            .map_err(map_exec_error)?;

        tracing::info!(
            server_id,
            action_type,
            exit_code = output.exit_code,
            duration_ms = output.duration_ms,
            "synchronous command executed"
        );
        Ok(output)
    }
}

/// Sync-path mapping: timeouts surface as 408; key/auth/connection problems
/// are infrastructure failures (500).
fn map_exec_error(error: SshError) -> Error {
    match error {
        SshError::CommandTimeout(secs) => Error::CommandTimeout(secs),
        other => Error::Internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hlh_domain::server::ServerStatus;

    async fn seed(store: &Store, id: &str, paused: bool) {
        let mut conn = store.acquire().await.unwrap();
        servers::create(
            &mut conn,
            servers::CreateServer {
                id: id.into(),
                guid: Some(uuid::Uuid::new_v4().to_string()),
                hostname: format!("{id}.local"),
                display_name: None,
                status: ServerStatus::Online,
                last_seen: None,
                machine_type: hlh_domain::server::MachineType::Server,
            },
        )
        .await
        .unwrap();
        if paused {
            servers::set_paused(&mut conn, id, true).await.unwrap();
        }
    }

    #[test]
    fn rate_limiter_caps_per_server() {
        let limiter = RateLimiter::new();
        for _ in 0..RATE_LIMIT_MAX_REQUESTS {
            assert!(limiter.check("alpha").is_ok());
        }
        let retry_after = limiter.check("alpha").unwrap_err();
        assert!(retry_after >= 1 && retry_after <= 60);

        // Other servers have their own bucket.
        assert!(limiter.check("beta").is_ok());
    }

    #[test]
    fn rate_limiter_prune_drops_empty_buckets() {
        let limiter = RateLimiter::new();
        limiter.check("alpha").unwrap();
        limiter.prune();
        // Bucket still live (entry is recent), so the cap still applies.
        for _ in 0..RATE_LIMIT_MAX_REQUESTS - 1 {
            limiter.check("alpha").unwrap();
        }
        assert!(limiter.check("alpha").is_err());
    }

    #[tokio::test]
    async fn unpaused_server_auto_approves() {
        let store = Store::connect_in_memory().await.unwrap();
        seed(&store, "gamma", false).await;
        let whitelist = CommandWhitelist::standard();

        let mut conn = store.acquire().await.unwrap();
        let action = create_action(
            &mut conn,
            &whitelist,
            "gamma",
            "restart_service",
            "systemctl restart plex",
        )
        .await
        .unwrap();

        assert_eq!(action.status, ActionStatus::Approved);
        assert_eq!(action.approved_by.as_deref(), Some("auto"));
        assert_eq!(action.service_name.as_deref(), Some("plex"));
    }

    #[tokio::test]
    async fn paused_server_waits_for_approval() {
        let store = Store::connect_in_memory().await.unwrap();
        seed(&store, "gamma", true).await;
        let whitelist = CommandWhitelist::standard();

        let mut conn = store.acquire().await.unwrap();
        let action = create_action(
            &mut conn,
            &whitelist,
            "gamma",
            "restart_service",
            "systemctl restart plex",
        )
        .await
        .unwrap();
        assert_eq!(action.status, ActionStatus::Pending);
        assert!(action.approved_by.is_none());

        let approved = approve_action(&mut conn, action.id, "operator").await.unwrap();
        assert_eq!(approved.status, ActionStatus::Approved);
        assert_eq!(approved.approved_by.as_deref(), Some("operator"));

        // Approving twice conflicts.
        let err = approve_action(&mut conn, action.id, "operator").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn whitelist_violation_blocks_creation() {
        let store = Store::connect_in_memory().await.unwrap();
        seed(&store, "gamma", false).await;
        let whitelist = CommandWhitelist::standard();

        let mut conn = store.acquire().await.unwrap();
        let err = create_action(
            &mut conn,
            &whitelist,
            "gamma",
            "restart_service",
            "systemctl restart nginx; rm -rf /",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::WhitelistViolation(_)));

        // Nothing persisted.
        let list = actions::list_for_server(&mut conn, "gamma", 10).await.unwrap();
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn cancel_only_from_pending() {
        let store = Store::connect_in_memory().await.unwrap();
        seed(&store, "gamma", true).await;
        let whitelist = CommandWhitelist::standard();

        let mut conn = store.acquire().await.unwrap();
        let action = create_action(
            &mut conn,
            &whitelist,
            "gamma",
            "clear_logs",
            "journalctl --vacuum-time=7d",
        )
        .await
        .unwrap();

        let cancelled = cancel_action(&mut conn, action.id).await.unwrap();
        assert_eq!(cancelled.status, ActionStatus::Cancelled);

        let err = cancel_action(&mut conn, action.id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn exec_error_mapping() {
        assert!(matches!(
            map_exec_error(SshError::CommandTimeout(30)),
            Error::CommandTimeout(30)
        ));
        assert!(matches!(
            map_exec_error(SshError::KeyNotConfigured("host".into())),
            Error::Internal(_)
        ));
    }
}
