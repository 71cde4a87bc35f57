//! Remediation-action repository.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use hlh_domain::action::{ActionStatus, RemediationAction};
use hlh_domain::{Error, Result};

pub struct CreateAction {
    pub server_id: String,
    pub action_type: String,
    pub command: String,
    pub service_name: Option<String>,
    pub status: ActionStatus,
    pub approved_by: Option<String>,
}

pub async fn create(conn: &mut SqliteConnection, params: CreateAction) -> Result<RemediationAction> {
    let now = Utc::now();
    let approved_at: Option<DateTime<Utc>> =
        (params.status == ActionStatus::Approved).then_some(now);
    let result = sqlx::query(
        r#"
        INSERT INTO remediation_actions
            (server_id, action_type, command, service_name, status,
             created_at, approved_at, approved_by)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&params.server_id)
    .bind(&params.action_type)
    .bind(&params.command)
    .bind(&params.service_name)
    .bind(params.status)
    .bind(now)
    .bind(approved_at)
    .bind(&params.approved_by)
    .execute(&mut *conn)
    .await?;

    require(conn, result.last_insert_rowid()).await
}

pub async fn get(conn: &mut SqliteConnection, id: i64) -> Result<Option<RemediationAction>> {
    Ok(
        sqlx::query_as::<_, RemediationAction>("SELECT * FROM remediation_actions WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

pub async fn require(conn: &mut SqliteConnection, id: i64) -> Result<RemediationAction> {
    get(conn, id)
        .await?
        .ok_or_else(|| Error::not_found("action", id.to_string()))
}

/// FIFO dispatch order: the oldest approved action for the server.
pub async fn oldest_approved(
    conn: &mut SqliteConnection,
    server_id: &str,
) -> Result<Option<RemediationAction>> {
    Ok(sqlx::query_as::<_, RemediationAction>(
        r#"
        SELECT * FROM remediation_actions
        WHERE server_id = ? AND status = 'approved'
        ORDER BY created_at ASC, id ASC
        LIMIT 1
        "#,
    )
    .bind(server_id)
    .fetch_optional(&mut *conn)
    .await?)
}

/// Persist every mutable column. Status transitions are validated by the
/// caller against the lifecycle DAG.
pub async fn update(conn: &mut SqliteConnection, action: &RemediationAction) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE remediation_actions SET
            status = ?, exit_code = ?, stdout = ?, stderr = ?,
            approved_at = ?, approved_by = ?, executed_at = ?, completed_at = ?
        WHERE id = ?
        "#,
    )
    .bind(action.status)
    .bind(action.exit_code)
    .bind(&action.stdout)
    .bind(&action.stderr)
    .bind(action.approved_at)
    .bind(&action.approved_by)
    .bind(action.executed_at)
    .bind(action.completed_at)
    .bind(action.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn list_for_server(
    conn: &mut SqliteConnection,
    server_id: &str,
    limit: u32,
) -> Result<Vec<RemediationAction>> {
    Ok(sqlx::query_as::<_, RemediationAction>(
        r#"
        SELECT * FROM remediation_actions
        WHERE server_id = ?
        ORDER BY created_at DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(server_id)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::seed_server;
    use crate::Store;

    async fn seed_action(
        conn: &mut SqliteConnection,
        server_id: &str,
        status: ActionStatus,
    ) -> RemediationAction {
        create(
            conn,
            CreateAction {
                server_id: server_id.into(),
                action_type: "restart_service".into(),
                command: "systemctl restart plex".into(),
                service_name: Some("plex".into()),
                status,
                approved_by: (status == ActionStatus::Approved).then(|| "auto".to_string()),
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn dispatch_order_is_fifo_by_creation() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();
        seed_server(&mut conn, "gamma").await;

        let first = seed_action(&mut conn, "gamma", ActionStatus::Approved).await;
        let _second = seed_action(&mut conn, "gamma", ActionStatus::Approved).await;
        seed_action(&mut conn, "gamma", ActionStatus::Pending).await;

        let next = oldest_approved(&mut conn, "gamma").await.unwrap().unwrap();
        assert_eq!(next.id, first.id);
    }

    #[tokio::test]
    async fn auto_approved_actions_carry_approver() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();
        seed_server(&mut conn, "gamma").await;

        let action = seed_action(&mut conn, "gamma", ActionStatus::Approved).await;
        assert_eq!(action.approved_by.as_deref(), Some("auto"));
        assert!(action.approved_at.is_some());
    }

    #[tokio::test]
    async fn update_persists_result_fields() {
        let store = Store::connect_in_memory().await.unwrap();
        let mut conn = store.acquire().await.unwrap();
        seed_server(&mut conn, "gamma").await;

        let mut action = seed_action(&mut conn, "gamma", ActionStatus::Approved).await;
        action.status = ActionStatus::Executing;
        action.executed_at = Some(Utc::now());
        update(&mut conn, &action).await.unwrap();

        action.status = ActionStatus::Completed;
        action.exit_code = Some(0);
        action.stdout = Some("ok".into());
        action.completed_at = Some(Utc::now());
        update(&mut conn, &action).await.unwrap();

        let reloaded = require(&mut conn, action.id).await.unwrap();
        assert_eq!(reloaded.status, ActionStatus::Completed);
        assert_eq!(reloaded.exit_code, Some(0));
        assert_eq!(reloaded.stdout.as_deref(), Some("ok"));
    }
}
