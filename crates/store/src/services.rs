//! Expected-service registry, observed status history, pending packages.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use hlh_domain::heartbeat::{PackagePayload, ServicePayload};
use hlh_domain::service::{ExpectedService, ServiceStatusRecord};
use hlh_domain::telemetry::PendingPackage;
use hlh_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Expected services
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_expected(
    conn: &mut SqliteConnection,
    server_id: &str,
) -> Result<Vec<ExpectedService>> {
    Ok(sqlx::query_as::<_, ExpectedService>(
        "SELECT * FROM expected_services WHERE server_id = ? ORDER BY service_name",
    )
    .bind(server_id)
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn get_expected(
    conn: &mut SqliteConnection,
    server_id: &str,
    service_name: &str,
) -> Result<Option<ExpectedService>> {
    Ok(sqlx::query_as::<_, ExpectedService>(
        "SELECT * FROM expected_services WHERE server_id = ? AND service_name = ?",
    )
    .bind(server_id)
    .bind(service_name)
    .fetch_optional(&mut *conn)
    .await?)
}

pub async fn upsert_expected(
    conn: &mut SqliteConnection,
    server_id: &str,
    service_name: &str,
    display_name: Option<&str>,
    is_critical: bool,
    enabled: bool,
) -> Result<ExpectedService> {
    sqlx::query(
        r#"
        INSERT INTO expected_services
            (server_id, service_name, display_name, is_critical, enabled, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT (server_id, service_name) DO UPDATE SET
            display_name = excluded.display_name,
            is_critical = excluded.is_critical,
            enabled = excluded.enabled
        "#,
    )
    .bind(server_id)
    .bind(service_name)
    .bind(display_name)
    .bind(is_critical)
    .bind(enabled)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    get_expected(conn, server_id, service_name)
        .await?
        .ok_or_else(|| Error::not_found("expected service", service_name))
}

pub async fn delete_expected(
    conn: &mut SqliteConnection,
    server_id: &str,
    service_name: &str,
) -> Result<bool> {
    let result =
        sqlx::query("DELETE FROM expected_services WHERE server_id = ? AND service_name = ?")
            .bind(server_id)
            .bind(service_name)
            .execute(&mut *conn)
            .await?;
    Ok(result.rows_affected() > 0)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Observed status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Insert one row per reported service for this heartbeat.
pub async fn insert_status_rows(
    conn: &mut SqliteConnection,
    server_id: &str,
    timestamp: DateTime<Utc>,
    services: &[ServicePayload],
) -> Result<()> {
    for svc in services {
        sqlx::query(
            r#"
            INSERT INTO service_status
                (server_id, service_name, status, pid, memory_mb, cpu_percent,
                 status_reason, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(server_id)
        .bind(&svc.name)
        .bind(svc.status)
        .bind(svc.pid)
        .bind(svc.memory_mb)
        .bind(svc.cpu_percent)
        .bind(&svc.status_reason)
        .bind(timestamp)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Most recent observed state of one service, if any sample exists.
pub async fn latest_status(
    conn: &mut SqliteConnection,
    server_id: &str,
    service_name: &str,
) -> Result<Option<ServiceStatusRecord>> {
    Ok(sqlx::query_as::<_, ServiceStatusRecord>(
        r#"
        SELECT * FROM service_status
        WHERE server_id = ? AND service_name = ?
        ORDER BY timestamp DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(server_id)
    .bind(service_name)
    .fetch_optional(&mut *conn)
    .await?)
}

/// Whether the most recent sample for the service is stopped or failed.
pub async fn is_service_down(
    conn: &mut SqliteConnection,
    server_id: &str,
    service_name: &str,
) -> Result<bool> {
    Ok(latest_status(conn, server_id, service_name)
        .await?
        .map(|s| s.status.is_down())
        .unwrap_or(false))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pending packages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Replace the server's pending-package set wholesale, deduplicated by name
/// (agents occasionally report the same package twice).
pub async fn replace_pending_packages(
    conn: &mut SqliteConnection,
    server_id: &str,
    packages: &[PackagePayload],
) -> Result<()> {
    sqlx::query("DELETE FROM pending_packages WHERE server_id = ?")
        .bind(server_id)
        .execute(&mut *conn)
        .await?;

    let now = Utc::now();
    let mut seen = std::collections::HashSet::new();
    for pkg in packages {
        if !seen.insert(pkg.name.as_str()) {
            continue;
        }
        sqlx::query(
            r#"
            INSERT INTO pending_packages
                (server_id, name, current_version, new_version, repository,
                 is_security, detected_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(server_id)
        .bind(&pkg.name)
        .bind(&pkg.current_version)
        .bind(&pkg.new_version)
        .bind(&pkg.repository)
        .bind(pkg.is_security)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn list_pending_packages(
    conn: &mut SqliteConnection,
    server_id: &str,
) -> Result<Vec<PendingPackage>> {
    Ok(sqlx::query_as::<_, PendingPackage>(
        "SELECT * FROM pending_packages WHERE server_id = ? ORDER BY name",
    )
    .bind(server_id)
    .fetch_all(&mut *conn)
    .await?)
}
