//! Alert and alert-state repositories.

use chrono::Utc;
use sqlx::SqliteConnection;

use hlh_domain::alert::{Alert, AlertSeverity, AlertState, AlertStatus, AlertType};
use hlh_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Alerts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CreateAlert {
    pub server_id: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub service_name: Option<String>,
    pub threshold_value: Option<f64>,
    pub actual_value: Option<f64>,
}

pub async fn insert(conn: &mut SqliteConnection, params: CreateAlert) -> Result<Alert> {
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        INSERT INTO alerts
            (server_id, alert_type, severity, status, title, message, service_name,
             threshold_value, actual_value, created_at, updated_at)
        VALUES (?, ?, ?, 'open', ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&params.server_id)
    .bind(params.alert_type)
    .bind(params.severity)
    .bind(&params.title)
    .bind(&params.message)
    .bind(&params.service_name)
    .bind(params.threshold_value)
    .bind(params.actual_value)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    require(conn, result.last_insert_rowid()).await
}

pub async fn get(conn: &mut SqliteConnection, id: i64) -> Result<Option<Alert>> {
    Ok(sqlx::query_as::<_, Alert>("SELECT * FROM alerts WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?)
}

pub async fn require(conn: &mut SqliteConnection, id: i64) -> Result<Alert> {
    get(conn, id)
        .await?
        .ok_or_else(|| Error::not_found("alert", id.to_string()))
}

/// The open threshold/offline alert for `(server, type)`. Service alerts are
/// keyed by name instead — see [`open_service_alert`].
pub async fn open_alert(
    conn: &mut SqliteConnection,
    server_id: &str,
    alert_type: AlertType,
) -> Result<Option<Alert>> {
    Ok(sqlx::query_as::<_, Alert>(
        r#"
        SELECT * FROM alerts
        WHERE server_id = ? AND alert_type = ? AND status = 'open'
          AND service_name IS NULL
        "#,
    )
    .bind(server_id)
    .bind(alert_type)
    .fetch_optional(&mut *conn)
    .await?)
}

pub async fn open_service_alert(
    conn: &mut SqliteConnection,
    server_id: &str,
    service_name: &str,
) -> Result<Option<Alert>> {
    Ok(sqlx::query_as::<_, Alert>(
        r#"
        SELECT * FROM alerts
        WHERE server_id = ? AND alert_type = 'service' AND status = 'open'
          AND service_name = ?
        "#,
    )
    .bind(server_id)
    .bind(service_name)
    .fetch_optional(&mut *conn)
    .await?)
}

/// Persist evaluation-time mutations: severity upgrades, refreshed values,
/// title/message rewrites.
pub async fn update_open_fields(conn: &mut SqliteConnection, alert: &Alert) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE alerts SET severity = ?, title = ?, message = ?,
            threshold_value = ?, actual_value = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(alert.severity)
    .bind(&alert.title)
    .bind(&alert.message)
    .bind(alert.threshold_value)
    .bind(alert.actual_value)
    .bind(Utc::now())
    .bind(alert.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn acknowledge(conn: &mut SqliteConnection, id: i64) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        "UPDATE alerts SET status = 'acknowledged', acknowledged_at = ?, updated_at = ? WHERE id = ?",
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// `auto` marks hub-side resolution from a recovery sample; user resolutions
/// keep `auto_resolved = false`.
pub async fn resolve(conn: &mut SqliteConnection, id: i64, auto: bool) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        "UPDATE alerts SET status = 'resolved', resolved_at = ?, auto_resolved = ?, updated_at = ? WHERE id = ?",
    )
    .bind(now)
    .bind(auto)
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Newest-first listing with optional filters.
pub async fn list(
    conn: &mut SqliteConnection,
    server_id: Option<&str>,
    status: Option<AlertStatus>,
    limit: u32,
) -> Result<Vec<Alert>> {
    // Filters are optional; NULL-checks keep this a single prepared query.
    Ok(sqlx::query_as::<_, Alert>(
        r#"
        SELECT * FROM alerts
        WHERE (? IS NULL OR server_id = ?)
          AND (? IS NULL OR status = ?)
        ORDER BY created_at DESC
        LIMIT ?
        "#,
    )
    .bind(server_id)
    .bind(server_id)
    .bind(status)
    .bind(status)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Alert state (evaluator counters + cooldown clocks)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Read-or-default; the row is only written back via [`upsert_state`].
pub async fn state_for(
    conn: &mut SqliteConnection,
    server_id: &str,
    metric_key: &str,
) -> Result<AlertState> {
    let existing = sqlx::query_as::<_, AlertState>(
        "SELECT * FROM alert_state WHERE server_id = ? AND metric_key = ?",
    )
    .bind(server_id)
    .bind(metric_key)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(existing.unwrap_or(AlertState {
        id: 0,
        server_id: server_id.to_string(),
        metric_key: metric_key.to_string(),
        breach_count: 0,
        breach_level: None,
        first_breach_at: None,
        last_alert_id: None,
        last_notified_at: None,
    }))
}

pub async fn upsert_state(conn: &mut SqliteConnection, state: &AlertState) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO alert_state
            (server_id, metric_key, breach_count, breach_level, first_breach_at,
             last_alert_id, last_notified_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (server_id, metric_key) DO UPDATE SET
            breach_count = excluded.breach_count,
            breach_level = excluded.breach_level,
            first_breach_at = excluded.first_breach_at,
            last_alert_id = excluded.last_alert_id,
            last_notified_at = excluded.last_notified_at
        "#,
    )
    .bind(&state.server_id)
    .bind(&state.metric_key)
    .bind(state.breach_count)
    .bind(state.breach_level)
    .bind(state.first_breach_at)
    .bind(state.last_alert_id)
    .bind(state.last_notified_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::seed_server;
    use crate::Store;

    fn cpu_alert(server_id: &str) -> CreateAlert {
        CreateAlert {
            server_id: server_id.into(),
            alert_type: AlertType::Cpu,
            severity: AlertSeverity::High,
            title: "CPU usage high".into(),
            message: "CPU at 91%".into(),
            service_name: None,
            threshold_value: Some(85.0),
            actual_value: Some(91.0),
        }
    }

    #[tokio::test]
    async fn one_open_alert_per_metric_key() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();
        seed_server(&mut conn, "alpha").await;

        let created = insert(&mut conn, cpu_alert("alpha")).await.unwrap();
        let open = open_alert(&mut conn, "alpha", AlertType::Cpu)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(open.id, created.id);

        // A service alert with the same server does not collide.
        assert!(open_service_alert(&mut conn, "alpha", "plex")
            .await
            .unwrap()
            .is_none());

        resolve(&mut conn, created.id, true).await.unwrap();
        assert!(open_alert(&mut conn, "alpha", AlertType::Cpu)
            .await
            .unwrap()
            .is_none());

        let resolved = require(&mut conn, created.id).await.unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert!(resolved.auto_resolved);
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();
        seed_server(&mut conn, "alpha").await;

        let a = insert(&mut conn, cpu_alert("alpha")).await.unwrap();
        acknowledge(&mut conn, a.id).await.unwrap();
        insert(
            &mut conn,
            CreateAlert {
                alert_type: AlertType::Memory,
                ..cpu_alert("alpha")
            },
        )
        .await
        .unwrap();

        let open = list(&mut conn, None, Some(AlertStatus::Open), 100)
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].alert_type, AlertType::Memory);

        let all = list(&mut conn, Some("alpha"), None, 100).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn alert_state_round_trips() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();
        seed_server(&mut conn, "alpha").await;

        let mut state = state_for(&mut conn, "alpha", "cpu").await.unwrap();
        assert_eq!(state.breach_count, 0);

        state.breach_count = 2;
        state.first_breach_at = Some(Utc::now());
        upsert_state(&mut conn, &state).await.unwrap();

        let reloaded = state_for(&mut conn, "alpha", "cpu").await.unwrap();
        assert_eq!(reloaded.breach_count, 2);
        assert!(reloaded.first_breach_at.is_some());

        // Upsert overwrites in place, no duplicate rows.
        state.breach_count = 3;
        upsert_state(&mut conn, &state).await.unwrap();
        let again = state_for(&mut conn, "alpha", "cpu").await.unwrap();
        assert_eq!(again.breach_count, 3);
    }
}
