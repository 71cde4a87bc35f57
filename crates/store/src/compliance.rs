//! Compliance-check history and config-apply rows.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::SqliteConnection;

use hlh_domain::compliance::{ConfigApply, ConfigCheck, Mismatch};
use hlh_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config checks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn insert_check(
    conn: &mut SqliteConnection,
    server_id: &str,
    pack_name: &str,
    mismatches: &[Mismatch],
    checked_at: DateTime<Utc>,
    check_duration_ms: i64,
) -> Result<ConfigCheck> {
    let result = sqlx::query(
        r#"
        INSERT INTO config_checks
            (server_id, pack_name, is_compliant, mismatches, checked_at,
             check_duration_ms)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(server_id)
    .bind(pack_name)
    .bind(mismatches.is_empty())
    .bind(Json(mismatches.to_vec()))
    .bind(checked_at)
    .bind(check_duration_ms)
    .execute(&mut *conn)
    .await?;

    let id = result.last_insert_rowid();
    Ok(
        sqlx::query_as::<_, ConfigCheck>("SELECT * FROM config_checks WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *conn)
            .await?,
    )
}

pub async fn list_checks(
    conn: &mut SqliteConnection,
    server_id: &str,
    limit: u32,
) -> Result<Vec<ConfigCheck>> {
    Ok(sqlx::query_as::<_, ConfigCheck>(
        r#"
        SELECT * FROM config_checks
        WHERE server_id = ?
        ORDER BY checked_at DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(server_id)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?)
}

/// Latest check per pack for one server.
pub async fn latest_checks_for_server(
    conn: &mut SqliteConnection,
    server_id: &str,
) -> Result<Vec<ConfigCheck>> {
    Ok(sqlx::query_as::<_, ConfigCheck>(
        r#"
        SELECT * FROM config_checks
        WHERE server_id = ?
          AND id IN (SELECT MAX(id) FROM config_checks WHERE server_id = ?
                     GROUP BY pack_name)
        ORDER BY pack_name
        "#,
    )
    .bind(server_id)
    .bind(server_id)
    .fetch_all(&mut *conn)
    .await?)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config applies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn insert_apply(
    conn: &mut SqliteConnection,
    server_id: &str,
    pack_name: &str,
    items_total: i64,
    triggered_by: &str,
) -> Result<ConfigApply> {
    let result = sqlx::query(
        r#"
        INSERT INTO config_applies
            (server_id, pack_name, status, items_total, triggered_by, started_at)
        VALUES (?, ?, 'pending', ?, ?, ?)
        "#,
    )
    .bind(server_id)
    .bind(pack_name)
    .bind(items_total)
    .bind(triggered_by)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    require_apply(conn, result.last_insert_rowid()).await
}

pub async fn get_apply(conn: &mut SqliteConnection, id: i64) -> Result<Option<ConfigApply>> {
    Ok(
        sqlx::query_as::<_, ConfigApply>("SELECT * FROM config_applies WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

pub async fn require_apply(conn: &mut SqliteConnection, id: i64) -> Result<ConfigApply> {
    get_apply(conn, id)
        .await?
        .ok_or_else(|| Error::not_found("apply operation", id.to_string()))
}

/// An apply that is still pending or running, if one exists for the server.
/// At most one is permitted at a time.
pub async fn non_terminal_apply(
    conn: &mut SqliteConnection,
    server_id: &str,
) -> Result<Option<ConfigApply>> {
    Ok(sqlx::query_as::<_, ConfigApply>(
        r#"
        SELECT * FROM config_applies
        WHERE server_id = ? AND status IN ('pending', 'running')
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(server_id)
    .fetch_optional(&mut *conn)
    .await?)
}

pub async fn update_apply(conn: &mut SqliteConnection, apply: &ConfigApply) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE config_applies SET
            status = ?, progress = ?, current_item = ?, items_total = ?,
            items_completed = ?, items_failed = ?, results = ?, error = ?,
            completed_at = ?
        WHERE id = ?
        "#,
    )
    .bind(apply.status)
    .bind(apply.progress)
    .bind(&apply.current_item)
    .bind(apply.items_total)
    .bind(apply.items_completed)
    .bind(apply.items_failed)
    .bind(&apply.results)
    .bind(&apply.error)
    .bind(apply.completed_at)
    .bind(apply.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::seed_server;
    use crate::Store;
    use hlh_domain::compliance::{ApplyStatus, MismatchKind};

    #[tokio::test]
    async fn check_round_trips_mismatches() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();
        seed_server(&mut conn, "alpha").await;

        let mismatch = Mismatch {
            kind: MismatchKind::MissingPackage,
            item: "vim".into(),
            expected: serde_json::json!({"installed": true}),
            actual: serde_json::json!({"installed": false}),
            diff: None,
        };
        let check = insert_check(&mut conn, "alpha", "base", &[mismatch], Utc::now(), 125)
            .await
            .unwrap();
        assert!(!check.is_compliant);
        assert_eq!(check.mismatches.0.len(), 1);
        assert_eq!(check.mismatches.0[0].kind, MismatchKind::MissingPackage);

        let compliant = insert_check(&mut conn, "alpha", "base", &[], Utc::now(), 80)
            .await
            .unwrap();
        assert!(compliant.is_compliant);

        let latest = latest_checks_for_server(&mut conn, "alpha").await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id, compliant.id);
    }

    #[tokio::test]
    async fn one_non_terminal_apply_per_server() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();
        seed_server(&mut conn, "alpha").await;

        let mut apply = insert_apply(&mut conn, "alpha", "base", 4, "user")
            .await
            .unwrap();
        assert_eq!(apply.status, ApplyStatus::Pending);
        assert!(non_terminal_apply(&mut conn, "alpha").await.unwrap().is_some());

        apply.status = ApplyStatus::Completed;
        apply.progress = 100;
        apply.completed_at = Some(Utc::now());
        update_apply(&mut conn, &apply).await.unwrap();

        assert!(non_terminal_apply(&mut conn, "alpha").await.unwrap().is_none());
    }
}
