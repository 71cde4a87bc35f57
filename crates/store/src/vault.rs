//! Encrypted-secret rows for the credential vault. This layer only moves
//! ciphertext; encryption lives in the gateway's vault service.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};

use hlh_domain::credential::CredentialType;
use hlh_domain::Result;

/// Ciphertext plus its nonce, both base64.
#[derive(Debug, Clone)]
pub struct SecretRow {
    pub nonce: String,
    pub ciphertext: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

pub async fn get_secret(
    conn: &mut SqliteConnection,
    credential_type: CredentialType,
    scope: &str,
) -> Result<Option<SecretRow>> {
    let row = sqlx::query(
        r#"
        SELECT nonce, ciphertext, created_at, last_used_at
        FROM vault_secrets WHERE credential_type = ? AND scope = ?
        "#,
    )
    .bind(credential_type)
    .bind(scope)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(match row {
        Some(row) => Some(SecretRow {
            nonce: row.try_get("nonce")?,
            ciphertext: row.try_get("ciphertext")?,
            created_at: row.try_get("created_at")?,
            last_used_at: row.try_get("last_used_at")?,
        }),
        None => None,
    })
}

pub async fn put_secret(
    conn: &mut SqliteConnection,
    credential_type: CredentialType,
    scope: &str,
    nonce: &str,
    ciphertext: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO vault_secrets (credential_type, scope, nonce, ciphertext, created_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (credential_type, scope) DO UPDATE SET
            nonce = excluded.nonce,
            ciphertext = excluded.ciphertext,
            created_at = excluded.created_at
        "#,
    )
    .bind(credential_type)
    .bind(scope)
    .bind(nonce)
    .bind(ciphertext)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn delete_secret(
    conn: &mut SqliteConnection,
    credential_type: CredentialType,
    scope: &str,
) -> Result<bool> {
    let result = sqlx::query("DELETE FROM vault_secrets WHERE credential_type = ? AND scope = ?")
        .bind(credential_type)
        .bind(scope)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn exists(
    conn: &mut SqliteConnection,
    credential_type: CredentialType,
    scope: &str,
) -> Result<bool> {
    Ok(get_secret(conn, credential_type, scope).await?.is_some())
}

pub async fn touch_last_used(
    conn: &mut SqliteConnection,
    credential_type: CredentialType,
    scope: &str,
) -> Result<()> {
    sqlx::query("UPDATE vault_secrets SET last_used_at = ? WHERE credential_type = ? AND scope = ?")
        .bind(Utc::now())
        .bind(credential_type)
        .bind(scope)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Types configured for a scope, with timestamps. No ciphertext leaves this
/// function.
pub async fn list_for_scope(
    conn: &mut SqliteConnection,
    scope: &str,
) -> Result<Vec<(CredentialType, DateTime<Utc>, Option<DateTime<Utc>>)>> {
    let rows = sqlx::query(
        "SELECT credential_type, created_at, last_used_at FROM vault_secrets WHERE scope = ?",
    )
    .bind(scope)
    .fetch_all(&mut *conn)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push((
            row.try_get("credential_type")?,
            row.try_get("created_at")?,
            row.try_get("last_used_at")?,
        ));
    }
    Ok(out)
}
