//! Wire contract for `POST /api/v1/agents/heartbeat`.
//!
//! These types are the agent-facing schema; field names are load-bearing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::server::AgentMode;
use crate::service::ServiceState;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OsInfo {
    pub distribution: Option<String>,
    pub version: Option<String>,
    pub kernel: Option<String>,
    pub architecture: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuInfo {
    pub cpu_model: Option<String>,
    pub cpu_cores: Option<i64>,
}

/// Metric sample; every field optional so partial collectors stay valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsPayload {
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePayload {
    pub name: String,
    pub status: ServiceState,
    pub status_reason: Option<String>,
    pub pid: Option<i64>,
    pub memory_mb: Option<f64>,
    pub cpu_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagePayload {
    pub name: String,
    pub current_version: String,
    pub new_version: String,
    pub repository: String,
    pub is_security: bool,
}

/// Result of a previously dispatched command, reported on a later heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResultPayload {
    pub action_id: i64,
    pub exit_code: i64,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub executed_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Permanent identity; preferred over `server_id` when present.
    pub server_guid: Option<String>,
    pub server_id: String,
    pub hostname: String,
    pub timestamp: DateTime<Utc>,
    pub agent_version: Option<String>,
    pub agent_mode: Option<AgentMode>,
    pub os_info: Option<OsInfo>,
    pub cpu_info: Option<CpuInfo>,
    pub metrics: Option<MetricsPayload>,
    pub updates_available: Option<i64>,
    pub security_updates: Option<i64>,
    pub services: Option<Vec<ServicePayload>>,
    pub packages: Option<Vec<PackagePayload>>,
    pub command_results: Option<Vec<CommandResultPayload>>,
}

/// Approved action handed to the agent. At most one per heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCommand {
    pub action_id: i64,
    pub action_type: String,
    pub command: String,
    pub parameters: HashMap<String, String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
    pub server_registered: bool,
    pub pending_commands: Vec<PendingCommand>,
    pub results_acknowledged: Vec<i64>,
}

impl HeartbeatResponse {
    pub fn ok(
        server_registered: bool,
        pending_commands: Vec<PendingCommand>,
        results_acknowledged: Vec<i64>,
    ) -> Self {
        Self {
            status: "ok".into(),
            server_registered,
            pending_commands,
            results_acknowledged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_heartbeat_deserializes() {
        let body = r#"{
            "server_id": "omv-mediaserver",
            "hostname": "mediaserver.home.lan",
            "timestamp": "2026-01-19T12:00:00Z"
        }"#;
        let req: HeartbeatRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.server_id, "omv-mediaserver");
        assert!(req.server_guid.is_none());
        assert!(req.metrics.is_none());
    }

    #[test]
    fn full_heartbeat_deserializes() {
        let body = r#"{
            "server_guid": "a1b2c3d4-e5f6-4890-abcd-ef1234567890",
            "server_id": "omv-mediaserver",
            "hostname": "mediaserver.home.lan",
            "timestamp": "2026-01-19T12:00:00Z",
            "agent_mode": "readwrite",
            "metrics": {"cpu_percent": 45.2, "memory_percent": 62.5, "disk_percent": 78.3},
            "services": [{"name": "plex", "status": "stopped", "status_reason": null,
                          "pid": null, "memory_mb": null, "cpu_percent": null}],
            "command_results": [{"action_id": 42, "exit_code": 0, "stdout": "", "stderr": "",
                                 "executed_at": "2026-01-19T11:59:30Z",
                                 "completed_at": "2026-01-19T11:59:32Z"}]
        }"#;
        let req: HeartbeatRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.agent_mode, Some(AgentMode::Readwrite));
        assert_eq!(req.services.as_ref().unwrap()[0].status, ServiceState::Stopped);
        assert_eq!(req.command_results.as_ref().unwrap()[0].action_id, 42);
    }

    #[test]
    fn response_serializes_contract_fields() {
        let resp = HeartbeatResponse::ok(true, vec![], vec![7]);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["server_registered"], true);
        assert_eq!(json["results_acknowledged"][0], 7);
    }
}
