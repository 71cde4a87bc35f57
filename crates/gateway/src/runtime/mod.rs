//! Ingest pipelines and background workers.

pub mod alerting;
pub mod apply;
pub mod compliance;
pub mod heartbeat;
pub mod remediation;
pub mod scheduler;

use sqlx::SqliteConnection;

use hlh_domain::credential::CredentialType;
use hlh_domain::server::Server;
use hlh_domain::settings::SshSettings;
use hlh_ssh::{SshError, SshTarget};
use hlh_store::settings;

use crate::vault::{Scope, Vault};

/// Everything needed to open an SSH session to a server.
pub struct SshAccess {
    pub target: SshTarget,
    pub private_key_pem: String,
    /// User owning files and rc entries; defaults to the SSH user.
    pub config_user: String,
    /// True when the SSH user differs from the config user and probes need
    /// `sudo -n`.
    pub use_sudo: bool,
}

/// Resolve target host, username, and private key for a server.
///
/// Target preference: Tailscale hostname, then IP, then hostname. Username:
/// per-server override, then the configured default. Key: per-server vault
/// entry, then the global one.
pub async fn resolve_ssh_access(
    conn: &mut SqliteConnection,
    vault: &Vault,
    server: &Server,
) -> Result<SshAccess, SshError> {
    let host = server.ssh_target().to_string();

    let ssh_settings: SshSettings = settings::get_typed(conn, "ssh")
        .await
        .map_err(|e| SshError::Internal(format!("ssh settings: {e}")))?;
    let user = server
        .ssh_username
        .clone()
        .unwrap_or(ssh_settings.default_username);

    let key_bytes = match vault
        .get(
            CredentialType::SshPrivateKey,
            &Scope::Server(server.id.clone()),
        )
        .await
        .map_err(|e| SshError::Internal(format!("vault: {e}")))?
    {
        Some(key) => Some(key),
        None => vault
            .get(CredentialType::SshPrivateKey, &Scope::Global)
            .await
            .map_err(|e| SshError::Internal(format!("vault: {e}")))?,
    };
    let Some(key_bytes) = key_bytes else {
        return Err(SshError::KeyNotConfigured(host));
    };
    let private_key_pem = String::from_utf8(key_bytes)
        .map_err(|_| SshError::Internal("stored SSH key is not valid UTF-8".into()))?;

    let config_user = server.config_user.clone().unwrap_or_else(|| user.clone());
    let use_sudo = config_user != user;

    Ok(SshAccess {
        target: SshTarget { host, user },
        private_key_pem,
        config_user,
        use_sudo,
    })
}
