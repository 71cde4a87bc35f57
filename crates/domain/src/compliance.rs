//! Compliance-check history and config-apply operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

/// Categorised difference between expected pack state and observed host
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum MismatchKind {
    MissingFile,
    WrongPermissions,
    WrongContent,
    MissingPackage,
    WrongVersion,
    WrongSetting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mismatch {
    pub kind: MismatchKind,
    /// File path, package name, or setting key.
    pub item: String,
    pub expected: serde_json::Value,
    pub actual: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

/// Result of one compliance check run against one pack.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConfigCheck {
    pub id: i64,
    pub server_id: String,
    pub pack_name: String,
    pub is_compliant: bool,
    pub mismatches: Json<Vec<Mismatch>>,
    pub checked_at: DateTime<Utc>,
    pub check_duration_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ApplyStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ApplyStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ApplyStatus::Completed | ApplyStatus::Failed)
    }
}

/// Per-item outcome recorded while an apply runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyItemResult {
    pub item: String,
    /// `write_file`, `install_package`, `set_env_var`, `backup_file`,
    /// `remove_env_var`.
    pub action: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A pack application run. The row is the single source of truth for the
/// background worker; progress fields update after every item.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConfigApply {
    pub id: i64,
    pub server_id: String,
    pub pack_name: String,
    pub status: ApplyStatus,
    /// 0-100.
    pub progress: i64,
    pub current_item: Option<String>,
    pub items_total: i64,
    pub items_completed: i64,
    pub items_failed: i64,
    pub results: Json<Vec<ApplyItemResult>>,
    pub error: Option<String>,
    pub triggered_by: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Suffix appended to files backed up during pack removal.
pub const REMOVAL_BACKUP_SUFFIX: &str = ".homelabcmd.bak";
