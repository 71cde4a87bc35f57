//! Credential records: one-shot registration tokens and per-agent API tokens.
//!
//! Only SHA-256 hashes are persisted; plaintext leaves the process exactly
//! once, in the response that issued it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

use crate::server::AgentMode;

/// One-time install credential. Claimable while unclaimed and unexpired.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RegistrationToken {
    pub id: i64,
    pub token_hash: String,
    /// First 16 chars of the plaintext; safe to display.
    pub token_prefix: String,
    pub mode: AgentMode,
    pub display_name: Option<String>,
    pub monitored_services: Option<Json<Vec<String>>>,
    pub expires_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by_server_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RegistrationToken {
    pub fn is_claimed(&self) -> bool {
        self.claimed_at.is_some()
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Long-lived per-server API token. At most one unrevoked row per
/// `server_guid`; rotation revokes the old row and inserts the new one in
/// the same transaction.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AgentCredential {
    pub id: i64,
    pub server_guid: String,
    pub api_token_hash: String,
    /// First ~20 chars of the plaintext; safe to display.
    pub api_token_prefix: String,
    pub is_legacy: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AgentCredential {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// Secret kinds held by the credential vault, keyed together with a scope
/// (`global` or `server:{id}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CredentialType {
    SshPrivateKey,
    TailscaleToken,
    SudoPassword,
}

impl CredentialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialType::SshPrivateKey => "ssh_private_key",
            CredentialType::TailscaleToken => "tailscale_token",
            CredentialType::SudoPassword => "sudo_password",
        }
    }
}

/// Metadata-only view of a vault entry. Never carries plaintext.
#[derive(Debug, Clone, Serialize)]
pub struct VaultEntryInfo {
    pub credential_type: CredentialType,
    pub scope: String,
    pub configured: bool,
    pub last_used_at: Option<DateTime<Utc>>,
}
