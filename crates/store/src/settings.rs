//! Key/value settings store. Values are opaque JSON; typed parsing happens
//! at the call site.

use chrono::Utc;
use sqlx::types::Json;
use sqlx::{Row, SqliteConnection};

use hlh_domain::Result;

pub async fn get_value(
    conn: &mut SqliteConnection,
    key: &str,
) -> Result<Option<serde_json::Value>> {
    let row = sqlx::query("SELECT value FROM config WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => {
            let value: Json<serde_json::Value> = row.try_get("value")?;
            Ok(Some(value.0))
        }
        None => Ok(None),
    }
}

pub async fn set_value(
    conn: &mut SqliteConnection,
    key: &str,
    value: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO config (key, value, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT (key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(Json(value.clone()))
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Load a typed settings record, falling back to its `Default` when the key
/// has never been written or fails to parse.
pub async fn get_typed<T: serde::de::DeserializeOwned + Default>(
    conn: &mut SqliteConnection,
    key: &str,
) -> Result<T> {
    match get_value(conn, key).await? {
        Some(value) => Ok(serde_json::from_value(value).unwrap_or_else(|e| {
            tracing::warn!(key, error = %e, "stored config value failed to parse, using defaults");
            T::default()
        })),
        None => Ok(T::default()),
    }
}

pub async fn set_typed<T: serde::Serialize>(
    conn: &mut SqliteConnection,
    key: &str,
    value: &T,
) -> Result<()> {
    let json = serde_json::to_value(value)
        .map_err(|e| hlh_domain::Error::Internal(format!("serializing config {key}: {e}")))?;
    set_value(conn, key, &json).await
}
