//! Registration-token and agent-credential repositories. Hash-only storage.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::SqliteConnection;

use hlh_domain::credential::{AgentCredential, RegistrationToken};
use hlh_domain::server::AgentMode;
use hlh_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registration tokens
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CreateRegistrationToken {
    pub token_hash: String,
    pub token_prefix: String,
    pub mode: AgentMode,
    pub display_name: Option<String>,
    pub monitored_services: Option<Vec<String>>,
    pub expires_at: DateTime<Utc>,
}

pub async fn insert_registration_token(
    conn: &mut SqliteConnection,
    params: CreateRegistrationToken,
) -> Result<RegistrationToken> {
    let result = sqlx::query(
        r#"
        INSERT INTO registration_tokens
            (token_hash, token_prefix, mode, display_name, monitored_services,
             expires_at, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&params.token_hash)
    .bind(&params.token_prefix)
    .bind(params.mode)
    .bind(&params.display_name)
    .bind(params.monitored_services.map(Json))
    .bind(params.expires_at)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    require_registration_token(conn, result.last_insert_rowid()).await
}

pub async fn get_registration_token(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<RegistrationToken>> {
    Ok(
        sqlx::query_as::<_, RegistrationToken>("SELECT * FROM registration_tokens WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

pub async fn require_registration_token(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<RegistrationToken> {
    get_registration_token(conn, id)
        .await?
        .ok_or_else(|| Error::not_found("registration token", id.to_string()))
}

pub async fn get_registration_token_by_hash(
    conn: &mut SqliteConnection,
    token_hash: &str,
) -> Result<Option<RegistrationToken>> {
    Ok(sqlx::query_as::<_, RegistrationToken>(
        "SELECT * FROM registration_tokens WHERE token_hash = ?",
    )
    .bind(token_hash)
    .fetch_optional(&mut *conn)
    .await?)
}

/// Unclaimed, unexpired tokens, newest first.
pub async fn list_pending_registration_tokens(
    conn: &mut SqliteConnection,
) -> Result<Vec<RegistrationToken>> {
    Ok(sqlx::query_as::<_, RegistrationToken>(
        r#"
        SELECT * FROM registration_tokens
        WHERE claimed_at IS NULL AND expires_at > ?
        ORDER BY created_at DESC
        "#,
    )
    .bind(Utc::now())
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn delete_registration_token(conn: &mut SqliteConnection, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM registration_tokens WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn mark_registration_token_claimed(
    conn: &mut SqliteConnection,
    id: i64,
    server_id: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE registration_tokens SET claimed_at = ?, claimed_by_server_id = ? WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(server_id)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent credentials
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn insert_agent_credential(
    conn: &mut SqliteConnection,
    server_guid: &str,
    api_token_hash: &str,
    api_token_prefix: &str,
) -> Result<AgentCredential> {
    let result = sqlx::query(
        r#"
        INSERT INTO agent_credentials
            (server_guid, api_token_hash, api_token_prefix, created_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(server_guid)
    .bind(api_token_hash)
    .bind(api_token_prefix)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    let id = result.last_insert_rowid();
    Ok(
        sqlx::query_as::<_, AgentCredential>("SELECT * FROM agent_credentials WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *conn)
            .await?,
    )
}

/// The single unrevoked credential for a GUID, if any.
pub async fn active_credential_for_guid(
    conn: &mut SqliteConnection,
    server_guid: &str,
) -> Result<Option<AgentCredential>> {
    Ok(sqlx::query_as::<_, AgentCredential>(
        "SELECT * FROM agent_credentials WHERE server_guid = ? AND revoked_at IS NULL",
    )
    .bind(server_guid)
    .fetch_optional(&mut *conn)
    .await?)
}

pub async fn revoke_credential(conn: &mut SqliteConnection, id: i64) -> Result<()> {
    sqlx::query("UPDATE agent_credentials SET revoked_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn touch_last_used(conn: &mut SqliteConnection, id: i64) -> Result<()> {
    sqlx::query("UPDATE agent_credentials SET last_used_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
