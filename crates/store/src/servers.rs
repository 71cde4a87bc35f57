//! Server repository.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::SqliteConnection;

use hlh_domain::server::{MachineType, Server, ServerStatus};
use hlh_domain::{Error, Result};

/// Parameters for inserting a new server row. Everything not listed takes
/// the schema default.
pub struct CreateServer {
    pub id: String,
    pub guid: Option<String>,
    pub hostname: String,
    pub display_name: Option<String>,
    pub status: ServerStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub machine_type: MachineType,
}

pub async fn create(conn: &mut SqliteConnection, params: CreateServer) -> Result<Server> {
    sqlx::query(
        r#"
        INSERT INTO servers (id, guid, hostname, display_name, status, last_seen,
                             machine_type, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&params.id)
    .bind(&params.guid)
    .bind(&params.hostname)
    .bind(&params.display_name)
    .bind(params.status)
    .bind(params.last_seen)
    .bind(params.machine_type)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    require(conn, &params.id).await
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Option<Server>> {
    Ok(sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?)
}

pub async fn require(conn: &mut SqliteConnection, id: &str) -> Result<Server> {
    get(conn, id)
        .await?
        .ok_or_else(|| Error::not_found("server", id))
}

pub async fn get_by_guid(conn: &mut SqliteConnection, guid: &str) -> Result<Option<Server>> {
    Ok(
        sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE guid = ?")
            .bind(guid)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<Server>> {
    Ok(sqlx::query_as::<_, Server>("SELECT * FROM servers ORDER BY id")
        .fetch_all(&mut *conn)
        .await?)
}

/// Persist every mutable column of the given server. The heartbeat pipeline
/// mutates the struct in memory and saves it once.
pub async fn update(conn: &mut SqliteConnection, server: &Server) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE servers SET
            guid = ?, hostname = ?, display_name = ?, ip_address = ?,
            tailscale_hostname = ?, status = ?, last_seen = ?,
            is_inactive = ?, inactive_since = ?,
            machine_type = ?, machine_category = ?, machine_category_source = ?,
            idle_watts = ?, tdp_watts = ?, cpu_model = ?, cpu_cores = ?,
            architecture = ?, os_distribution = ?, os_version = ?, kernel_version = ?,
            agent_version = ?, agent_mode = ?, is_paused = ?, paused_at = ?,
            ssh_username = ?, sudo_mode = ?, config_user = ?, assigned_packs = ?,
            drift_detection_enabled = ?, updates_available = ?, security_updates = ?
        WHERE id = ?
        "#,
    )
    .bind(&server.guid)
    .bind(&server.hostname)
    .bind(&server.display_name)
    .bind(&server.ip_address)
    .bind(&server.tailscale_hostname)
    .bind(server.status)
    .bind(server.last_seen)
    .bind(server.is_inactive)
    .bind(server.inactive_since)
    .bind(server.machine_type)
    .bind(server.machine_category)
    .bind(server.machine_category_source)
    .bind(server.idle_watts)
    .bind(server.tdp_watts)
    .bind(&server.cpu_model)
    .bind(server.cpu_cores)
    .bind(&server.architecture)
    .bind(&server.os_distribution)
    .bind(&server.os_version)
    .bind(&server.kernel_version)
    .bind(&server.agent_version)
    .bind(server.agent_mode)
    .bind(server.is_paused)
    .bind(server.paused_at)
    .bind(&server.ssh_username)
    .bind(server.sudo_mode)
    .bind(&server.config_user)
    .bind(&server.assigned_packs)
    .bind(server.drift_detection_enabled)
    .bind(server.updates_available)
    .bind(server.security_updates)
    .bind(&server.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Cascade delete. Returns false when no such server existed.
pub async fn delete(conn: &mut SqliteConnection, id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM servers WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_status(
    conn: &mut SqliteConnection,
    id: &str,
    status: ServerStatus,
) -> Result<()> {
    sqlx::query("UPDATE servers SET status = ? WHERE id = ?")
        .bind(status)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn set_paused(conn: &mut SqliteConnection, id: &str, paused: bool) -> Result<()> {
    let paused_at = paused.then(Utc::now);
    sqlx::query("UPDATE servers SET is_paused = ?, paused_at = ? WHERE id = ?")
        .bind(paused)
        .bind(paused_at)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn set_inactive(conn: &mut SqliteConnection, id: &str, inactive: bool) -> Result<()> {
    let inactive_since = inactive.then(Utc::now);
    sqlx::query("UPDATE servers SET is_inactive = ?, inactive_since = ? WHERE id = ?")
        .bind(inactive)
        .bind(inactive_since)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn set_assigned_packs(
    conn: &mut SqliteConnection,
    id: &str,
    packs: &[String],
) -> Result<()> {
    sqlx::query("UPDATE servers SET assigned_packs = ? WHERE id = ?")
        .bind(Json(packs.to_vec()))
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Online servers whose last heartbeat predates `cutoff`. Inactive servers
/// are skipped (no agent, offline is expected).
pub async fn list_online_stale(
    conn: &mut SqliteConnection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Server>> {
    Ok(sqlx::query_as::<_, Server>(
        r#"
        SELECT * FROM servers
        WHERE status = 'online'
          AND last_seen IS NOT NULL
          AND last_seen < ?
          AND is_inactive = 0
        "#,
    )
    .bind(cutoff)
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn list_offline(conn: &mut SqliteConnection) -> Result<Vec<Server>> {
    Ok(sqlx::query_as::<_, Server>(
        "SELECT * FROM servers WHERE status = 'offline' AND is_inactive = 0",
    )
    .fetch_all(&mut *conn)
    .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    use crate::testutil::seed_server as seed;

    #[tokio::test]
    async fn create_and_fetch_round_trip() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();

        let created = seed(&mut conn, "alpha").await;
        assert_eq!(created.status, ServerStatus::Online);
        assert_eq!(created.assigned_packs.0, vec!["base".to_string()]);

        let by_guid = get_by_guid(&mut conn, created.guid.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_guid.id, "alpha");
    }

    #[tokio::test]
    async fn update_persists_volatile_fields() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();

        let mut server = seed(&mut conn, "beta").await;
        server.ip_address = Some("10.0.0.5".into());
        server.status = ServerStatus::Offline;
        server.updates_available = 12;
        update(&mut conn, &server).await.unwrap();

        let reloaded = require(&mut conn, "beta").await.unwrap();
        assert_eq!(reloaded.ip_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(reloaded.status, ServerStatus::Offline);
        assert_eq!(reloaded.updates_available, 12);
    }

    #[tokio::test]
    async fn stale_listing_honours_cutoff() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();

        let mut server = seed(&mut conn, "gamma").await;
        server.last_seen = Some(Utc::now() - chrono::Duration::seconds(181));
        update(&mut conn, &server).await.unwrap();
        seed(&mut conn, "fresh").await;

        let cutoff = Utc::now() - chrono::Duration::seconds(180);
        let stale = list_online_stale(&mut conn, cutoff).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, "gamma");
    }

    #[tokio::test]
    async fn missing_server_is_not_found() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();
        let err = require(&mut conn, "ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
