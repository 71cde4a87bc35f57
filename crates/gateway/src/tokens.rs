//! Token service: registration tokens (one-shot install credentials) and
//! per-agent API tokens.
//!
//! Formats:
//! - Registration: `hlh_rt_{64 hex}`, prefix = first 16 chars.
//! - Agent API:    `hlh_ag_{guid_prefix8}_{64 hex}`, prefix = first 20 chars.
//!
//! Only SHA-256 hex digests are stored. Verification hashes the presented
//! token and compares digests in constant time.

use chrono::{Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::SqliteConnection;
use subtle::ConstantTimeEq;

use hlh_domain::credential::RegistrationToken;
use hlh_domain::server::AgentMode;
use hlh_domain::{Error, Result};
use hlh_store::{credentials, servers};

pub const REGISTRATION_TOKEN_PREFIX: &str = "hlh_rt_";
pub const AGENT_TOKEN_PREFIX: &str = "hlh_ag_";

/// Registration tokens expire after 15 minutes unless the caller overrides.
pub const DEFAULT_REGISTRATION_EXPIRY_MINUTES: i64 = 15;

const REGISTRATION_PREFIX_LEN: usize = 16;
const AGENT_PREFIX_LEN: usize = 20;

/// A freshly generated token: the plaintext leaves the process exactly once.
#[derive(Debug, Clone)]
pub struct GeneratedToken {
    pub plaintext: String,
    pub token_hash: String,
    pub prefix: String,
}

fn random_hex_64() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn hash_token(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

/// Constant-time comparison of the presented token against a stored digest.
pub fn verify_token(plaintext: &str, stored_hash: &str) -> bool {
    let computed = hash_token(plaintext);
    computed.as_bytes().ct_eq(stored_hash.as_bytes()).into()
}

pub fn generate_registration_token() -> GeneratedToken {
    let plaintext = format!("{REGISTRATION_TOKEN_PREFIX}{}", random_hex_64());
    GeneratedToken {
        token_hash: hash_token(&plaintext),
        prefix: plaintext[..REGISTRATION_PREFIX_LEN].to_string(),
        plaintext,
    }
}

pub fn generate_agent_token(server_guid: &str) -> GeneratedToken {
    let guid_prefix: String = server_guid.chars().take(8).collect();
    let plaintext = format!("{AGENT_TOKEN_PREFIX}{guid_prefix}_{}", random_hex_64());
    GeneratedToken {
        token_hash: hash_token(&plaintext),
        prefix: plaintext[..AGENT_PREFIX_LEN].to_string(),
        plaintext,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registration token lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn create_registration_token(
    conn: &mut SqliteConnection,
    mode: AgentMode,
    display_name: Option<String>,
    monitored_services: Option<Vec<String>>,
    expiry_minutes: Option<i64>,
) -> Result<(RegistrationToken, String)> {
    let generated = generate_registration_token();
    let expiry = expiry_minutes.unwrap_or(DEFAULT_REGISTRATION_EXPIRY_MINUTES);

    let token = credentials::insert_registration_token(
        conn,
        credentials::CreateRegistrationToken {
            token_hash: generated.token_hash.clone(),
            token_prefix: generated.prefix.clone(),
            mode,
            display_name,
            monitored_services,
            expires_at: Utc::now() + Duration::minutes(expiry),
        },
    )
    .await?;

    tracing::info!(
        token_id = token.id,
        prefix = %token.token_prefix,
        mode = ?mode,
        expires_at = %token.expires_at,
        "created registration token"
    );

    Ok((token, generated.plaintext))
}

/// Everything the installer needs after a successful claim.
#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    pub server_id: String,
    pub server_guid: String,
    pub api_token: String,
    pub config_yaml: String,
}

/// Claim a registration token: validate, create or adopt the server record,
/// mint the agent credential, mark the token claimed, and render the agent
/// config. Runs inside the caller's transaction.
pub async fn claim_registration_token(
    conn: &mut SqliteConnection,
    plaintext_token: &str,
    server_id: &str,
    hostname: &str,
    hub_url: &str,
) -> Result<ClaimOutcome> {
    let token = credentials::get_registration_token_by_hash(conn, &hash_token(plaintext_token))
        .await?
        .ok_or_else(|| Error::Validation("Invalid token".into()))?;
    if token.is_claimed() {
        return Err(Error::Validation("Token has already been claimed".into()));
    }
    if token.is_expired() {
        return Err(Error::Validation("Token has expired".into()));
    }

    if !hlh_domain::server::is_valid_server_id(server_id) {
        return Err(Error::Validation(format!(
            "server_id must match [a-z0-9-]+ (got '{server_id}')"
        )));
    }

    // Re-registration of a live server must go through rotation instead.
    let mut server = match servers::get(conn, server_id).await? {
        Some(existing) => {
            if let Some(guid) = &existing.guid {
                if credentials::active_credential_for_guid(conn, guid)
                    .await?
                    .is_some()
                {
                    tracing::warn!(server_id, "claim refused: server already has active credentials");
                    return Err(Error::Validation(
                        "Server already registered. Use token rotation to update credentials."
                            .into(),
                    ));
                }
            }
            existing
        }
        None => {
            servers::create(
                conn,
                servers::CreateServer {
                    id: server_id.to_string(),
                    guid: Some(uuid::Uuid::new_v4().to_string()),
                    hostname: hostname.to_string(),
                    display_name: token.display_name.clone(),
                    status: hlh_domain::server::ServerStatus::Unknown,
                    last_seen: None,
                    machine_type: hlh_domain::server::MachineType::Server,
                },
            )
            .await?
        }
    };

    if server.guid.is_none() {
        server.guid = Some(uuid::Uuid::new_v4().to_string());
        servers::update(conn, &server).await?;
    }
    let guid = server.guid.clone().expect("guid assigned above");

    let agent_token = generate_agent_token(&guid);
    credentials::insert_agent_credential(conn, &guid, &agent_token.token_hash, &agent_token.prefix)
        .await?;
    credentials::mark_registration_token_claimed(conn, token.id, &server.id).await?;

    let monitored = token.monitored_services.as_ref().map(|json| json.0.clone());
    let config_yaml = render_agent_config(
        hub_url,
        &server.id,
        &guid,
        &agent_token.plaintext,
        token.mode,
        monitored.as_deref(),
    );

    tracing::info!(
        token_id = token.id,
        server_id = %server.id,
        server_guid = %guid,
        "registration token claimed"
    );

    Ok(ClaimOutcome {
        server_id: server.id,
        server_guid: guid,
        api_token: agent_token.plaintext,
        config_yaml,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent token lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rotate: mint a new credential and revoke the old one in one transaction.
/// No grace period — the old token stops authenticating immediately.
pub async fn rotate_agent_token(
    conn: &mut SqliteConnection,
    server_guid: &str,
) -> Result<(String, String)> {
    let old = credentials::active_credential_for_guid(conn, server_guid)
        .await?
        .ok_or_else(|| Error::not_found("credential", server_guid))?;

    let new_token = generate_agent_token(server_guid);
    credentials::insert_agent_credential(conn, server_guid, &new_token.token_hash, &new_token.prefix)
        .await?;
    credentials::revoke_credential(conn, old.id).await?;

    tracing::info!(
        server_guid,
        old_prefix = %old.api_token_prefix,
        new_prefix = %new_token.prefix,
        "agent token rotated"
    );

    Ok((new_token.plaintext, new_token.prefix))
}

pub async fn revoke_agent_token(conn: &mut SqliteConnection, server_guid: &str) -> Result<()> {
    let credential = credentials::active_credential_for_guid(conn, server_guid)
        .await?
        .ok_or_else(|| Error::not_found("credential", server_guid))?;
    credentials::revoke_credential(conn, credential.id).await?;
    tracing::info!(server_guid, prefix = %credential.api_token_prefix, "agent token revoked");
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent config rendering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The YAML written to `/etc/homelab-agent/config.yaml` by the installer.
pub fn render_agent_config(
    hub_url: &str,
    server_id: &str,
    server_guid: &str,
    api_token: &str,
    mode: AgentMode,
    monitored_services: Option<&[String]>,
) -> String {
    let mode_str = match mode {
        AgentMode::Readonly => "readonly",
        AgentMode::Readwrite => "readwrite",
    };
    let mut lines = vec![
        format!("hub_url: {hub_url}"),
        format!("server_id: {server_id}"),
        format!("server_guid: {server_guid}"),
        format!("api_token: {api_token}"),
        format!("mode: {mode_str}"),
        "heartbeat_interval: 60".to_string(),
    ];

    if let Some(services) = monitored_services {
        if !services.is_empty() {
            lines.push("monitored_services:".to_string());
            for service in services {
                lines.push(format!("  - {service}"));
            }
        }
    }

    if mode == AgentMode::Readwrite {
        lines.push("command_execution_enabled: true".to_string());
    }

    lines.join("\n") + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use hlh_store::Store;

    #[test]
    fn registration_token_format() {
        let token = generate_registration_token();
        assert!(token.plaintext.starts_with("hlh_rt_"));
        assert_eq!(token.plaintext.len(), "hlh_rt_".len() + 64);
        assert_eq!(token.prefix.len(), 16);
        assert_eq!(token.token_hash.len(), 64);
        assert!(verify_token(&token.plaintext, &token.token_hash));
        assert!(!verify_token("hlh_rt_wrong", &token.token_hash));
    }

    #[test]
    fn agent_token_embeds_guid_prefix() {
        let guid = "a1b2c3d4-e5f6-4890-abcd-ef1234567890";
        let token = generate_agent_token(guid);
        assert!(token.plaintext.starts_with("hlh_ag_a1b2c3d4_"));
        assert_eq!(token.prefix.len(), 20);
    }

    #[test]
    fn config_yaml_shape() {
        let yaml = render_agent_config(
            "https://hub.local",
            "alpha",
            "a1b2c3d4-e5f6-4890-abcd-ef1234567890",
            "hlh_ag_a1b2c3d4_secret",
            AgentMode::Readwrite,
            Some(&["plex".to_string(), "sonarr".to_string()]),
        );
        let expected_order = [
            "hub_url:",
            "server_id:",
            "server_guid:",
            "api_token:",
            "mode:",
            "heartbeat_interval:",
            "monitored_services:",
        ];
        let mut last = 0;
        for key in expected_order {
            let pos = yaml.find(key).unwrap_or_else(|| panic!("missing {key}"));
            assert!(pos >= last, "{key} out of order");
            last = pos;
        }
        assert!(yaml.contains("heartbeat_interval: 60"));
        assert!(yaml.contains("  - plex"));
        assert!(yaml.ends_with("command_execution_enabled: true\n"));
    }

    #[test]
    fn readonly_config_omits_command_execution() {
        let yaml = render_agent_config(
            "https://hub.local",
            "alpha",
            "guid",
            "token",
            AgentMode::Readonly,
            None,
        );
        assert!(!yaml.contains("command_execution_enabled"));
    }

    #[tokio::test]
    async fn claim_flow_mints_credentials() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();

        let (_, plaintext) = create_registration_token(
            &mut conn,
            AgentMode::Readonly,
            Some("Alpha".into()),
            None,
            None,
        )
        .await
        .unwrap();

        let outcome = claim_registration_token(
            &mut conn,
            &plaintext,
            "alpha",
            "alpha.local",
            "https://hub.local",
        )
        .await
        .unwrap();

        assert_eq!(outcome.server_id, "alpha");
        assert!(outcome.api_token.starts_with("hlh_ag_"));
        assert!(outcome.config_yaml.contains("server_id: alpha"));
        assert!(outcome.config_yaml.contains("mode: readonly"));

        // Credential is live for the new GUID.
        let cred = credentials::active_credential_for_guid(&mut conn, &outcome.server_guid)
            .await
            .unwrap();
        assert!(cred.is_some());
    }

    #[tokio::test]
    async fn claiming_twice_fails() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();

        let (_, plaintext) =
            create_registration_token(&mut conn, AgentMode::Readonly, None, None, None)
                .await
                .unwrap();

        claim_registration_token(&mut conn, &plaintext, "alpha", "alpha.local", "http://h")
            .await
            .unwrap();
        let err =
            claim_registration_token(&mut conn, &plaintext, "alpha", "alpha.local", "http://h")
                .await
                .unwrap_err();
        assert!(matches!(err, Error::Validation(msg) if msg.contains("already been claimed")));
    }

    #[tokio::test]
    async fn claim_for_registered_server_requires_rotation() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();

        let (_, first) =
            create_registration_token(&mut conn, AgentMode::Readonly, None, None, None)
                .await
                .unwrap();
        claim_registration_token(&mut conn, &first, "alpha", "alpha.local", "http://h")
            .await
            .unwrap();

        let (_, second) =
            create_registration_token(&mut conn, AgentMode::Readonly, None, None, None)
                .await
                .unwrap();
        let err = claim_registration_token(&mut conn, &second, "alpha", "alpha.local", "http://h")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(msg) if msg.contains("rotation")));
    }

    #[tokio::test]
    async fn rotate_revokes_old_token_immediately() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();

        let (_, plaintext) =
            create_registration_token(&mut conn, AgentMode::Readonly, None, None, None)
                .await
                .unwrap();
        let outcome =
            claim_registration_token(&mut conn, &plaintext, "alpha", "alpha.local", "http://h")
                .await
                .unwrap();

        let (new_plaintext, _) = rotate_agent_token(&mut conn, &outcome.server_guid)
            .await
            .unwrap();
        assert_ne!(new_plaintext, outcome.api_token);

        let active = credentials::active_credential_for_guid(&mut conn, &outcome.server_guid)
            .await
            .unwrap()
            .unwrap();
        assert!(verify_token(&new_plaintext, &active.api_token_hash));
        assert!(!verify_token(&outcome.api_token, &active.api_token_hash));
    }
}
