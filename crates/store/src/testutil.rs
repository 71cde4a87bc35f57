//! Shared fixtures for repository tests.

use chrono::Utc;
use sqlx::SqliteConnection;

use hlh_domain::server::{MachineType, Server, ServerStatus};

use crate::servers::{self, CreateServer};

pub async fn seed_server(conn: &mut SqliteConnection, id: &str) -> Server {
    servers::create(
        conn,
        CreateServer {
            id: id.into(),
            guid: Some(uuid::Uuid::new_v4().to_string()),
            hostname: format!("{id}.local"),
            display_name: None,
            status: ServerStatus::Online,
            last_seen: Some(Utc::now()),
            machine_type: MachineType::Server,
        },
    )
    .await
    .unwrap()
}
