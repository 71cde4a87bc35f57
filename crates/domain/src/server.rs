//! Server entity — the aggregate root of the fleet model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Enumerations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ServerStatus {
    Online,
    Offline,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum MachineType {
    Server,
    Workstation,
}

/// Hardware taxonomy used for power profiles and pack defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum MachineCategory {
    Sbc,
    MiniPc,
    Nas,
    OfficeDesktop,
    GamingDesktop,
    Workstation,
    OfficeLaptop,
    GamingLaptop,
    RackServer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum CategorySource {
    Auto,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AgentMode {
    Readonly,
    Readwrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SudoMode {
    Passwordless,
    Password,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tracked machine. `id` is the user-facing slug; `guid` is the permanent
/// identity that survives hostname and IP changes (nullable for legacy
/// agents that predate GUIDs).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Server {
    pub id: String,
    pub guid: Option<String>,
    pub hostname: String,
    pub display_name: Option<String>,
    pub ip_address: Option<String>,
    pub tailscale_hostname: Option<String>,

    pub status: ServerStatus,
    pub last_seen: Option<DateTime<Utc>>,
    /// Agent removed; heartbeats are rejected while set.
    pub is_inactive: bool,
    pub inactive_since: Option<DateTime<Utc>>,

    pub machine_type: MachineType,
    pub machine_category: Option<MachineCategory>,
    pub machine_category_source: CategorySource,
    pub idle_watts: Option<f64>,
    pub tdp_watts: Option<f64>,
    pub cpu_model: Option<String>,
    pub cpu_cores: Option<i64>,
    pub architecture: Option<String>,

    pub os_distribution: Option<String>,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,

    pub agent_version: Option<String>,
    pub agent_mode: AgentMode,
    pub is_paused: bool,
    pub paused_at: Option<DateTime<Utc>>,

    pub ssh_username: Option<String>,
    pub sudo_mode: SudoMode,
    pub config_user: Option<String>,
    /// Ordered pack assignment; `base` is always present and first.
    pub assigned_packs: Json<Vec<String>>,
    pub drift_detection_enabled: bool,

    pub updates_available: i64,
    pub security_updates: i64,

    pub created_at: DateTime<Utc>,
}

impl Server {
    /// SSH target in preference order: Tailscale hostname, IP, hostname.
    pub fn ssh_target(&self) -> &str {
        self.tailscale_hostname
            .as_deref()
            .or(self.ip_address.as_deref())
            .unwrap_or(&self.hostname)
    }

    /// Name shown in notifications.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.hostname)
    }
}

/// Server-id slugs accepted from agents and operators: `[a-z0-9-]+`, max 100.
pub fn is_valid_server_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 100
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Lowercase hex UUID v4 with dashes, as produced by `uuid::Uuid::new_v4()`.
pub fn is_valid_guid(guid: &str) -> bool {
    uuid::Uuid::try_parse(guid)
        .map(|u| u.get_version_num() == 4)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_server() -> Server {
        Server {
            id: "alpha".into(),
            guid: Some("11111111-1111-4111-8111-111111111111".into()),
            hostname: "alpha.local".into(),
            display_name: None,
            ip_address: None,
            tailscale_hostname: None,
            status: ServerStatus::Online,
            last_seen: None,
            is_inactive: false,
            inactive_since: None,
            machine_type: MachineType::Server,
            machine_category: None,
            machine_category_source: CategorySource::Auto,
            idle_watts: None,
            tdp_watts: None,
            cpu_model: None,
            cpu_cores: None,
            architecture: None,
            os_distribution: None,
            os_version: None,
            kernel_version: None,
            agent_version: None,
            agent_mode: AgentMode::Readonly,
            is_paused: false,
            paused_at: None,
            ssh_username: None,
            sudo_mode: SudoMode::Passwordless,
            config_user: None,
            assigned_packs: Json(vec!["base".into()]),
            drift_detection_enabled: false,
            updates_available: 0,
            security_updates: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn ssh_target_prefers_tailscale_then_ip_then_hostname() {
        let mut server = base_server();
        assert_eq!(server.ssh_target(), "alpha.local");

        server.ip_address = Some("192.168.1.10".into());
        assert_eq!(server.ssh_target(), "192.168.1.10");

        server.tailscale_hostname = Some("alpha.tail.net".into());
        assert_eq!(server.ssh_target(), "alpha.tail.net");
    }

    #[test]
    fn server_id_slug_validation() {
        assert!(is_valid_server_id("omv-mediaserver"));
        assert!(is_valid_server_id("a1"));
        assert!(!is_valid_server_id(""));
        assert!(!is_valid_server_id("Upper"));
        assert!(!is_valid_server_id("has space"));
        assert!(!is_valid_server_id(&"x".repeat(101)));
    }

    #[test]
    fn guid_must_be_uuid_v4() {
        assert!(is_valid_guid("11111111-1111-4111-8111-111111111111"));
        // v1 UUID rejected
        assert!(!is_valid_guid("11111111-1111-1111-8111-111111111111"));
        assert!(!is_valid_guid("not-a-guid"));
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ServerStatus::Online).unwrap(),
            "\"online\""
        );
        assert_eq!(
            serde_json::to_string(&MachineCategory::RackServer).unwrap(),
            "\"rack_server\""
        );
    }
}
