//! Pinned SSH host keys. First contact stores the key; later mismatches are
//! treated as authentication failures by the executor.

use chrono::Utc;
use sqlx::{Row, SqliteConnection};

use hlh_domain::Result;

pub async fn get(
    conn: &mut SqliteConnection,
    host: &str,
) -> Result<Option<(String, String)>> {
    let row = sqlx::query("SELECT key_type, key_base64 FROM ssh_host_keys WHERE host = ?")
        .bind(host)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(match row {
        Some(row) => Some((row.try_get("key_type")?, row.try_get("key_base64")?)),
        None => None,
    })
}

pub async fn pin(
    conn: &mut SqliteConnection,
    host: &str,
    key_type: &str,
    key_base64: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ssh_host_keys (host, key_type, key_base64, first_seen)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (host) DO NOTHING
        "#,
    )
    .bind(host)
    .bind(key_type)
    .bind(key_base64)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}
