//! Referential-integrity tests: cascade deletes from the server aggregate
//! root and GUID uniqueness.

use chrono::Utc;

use hlh_domain::alert::{AlertSeverity, AlertType};
use hlh_domain::heartbeat::{MetricsPayload, ServicePayload};
use hlh_domain::server::{MachineType, ServerStatus};
use hlh_domain::service::ServiceState;
use hlh_store::{actions, alerts, metrics, servers, services, Store};

async fn seed_server(store: &Store, id: &str, guid: &str) {
    let mut conn = store.acquire().await.unwrap();
    servers::create(
        &mut conn,
        servers::CreateServer {
            id: id.into(),
            guid: Some(guid.into()),
            hostname: format!("{id}.local"),
            display_name: None,
            status: ServerStatus::Online,
            last_seen: Some(Utc::now()),
            machine_type: MachineType::Server,
        },
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn deleting_a_server_cascades_to_owned_rows() {
    let store = Store::connect_in_memory().await.unwrap();
    seed_server(&store, "alpha", "11111111-1111-4111-8111-111111111111").await;

    let mut conn = store.acquire().await.unwrap();

    metrics::insert_sample(
        &mut conn,
        "alpha",
        Utc::now(),
        &MetricsPayload {
            cpu_percent: Some(10.0),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    alerts::insert(
        &mut conn,
        alerts::CreateAlert {
            server_id: "alpha".into(),
            alert_type: AlertType::Cpu,
            severity: AlertSeverity::High,
            title: "CPU usage high".into(),
            message: "CPU at 91%".into(),
            service_name: None,
            threshold_value: Some(85.0),
            actual_value: Some(91.0),
        },
    )
    .await
    .unwrap();

    services::upsert_expected(&mut conn, "alpha", "plex", None, true, true)
        .await
        .unwrap();
    services::insert_status_rows(
        &mut conn,
        "alpha",
        Utc::now(),
        &[ServicePayload {
            name: "plex".into(),
            status: ServiceState::Running,
            status_reason: None,
            pid: Some(1),
            memory_mb: None,
            cpu_percent: None,
        }],
    )
    .await
    .unwrap();

    actions::create(
        &mut conn,
        actions::CreateAction {
            server_id: "alpha".into(),
            action_type: "clear_logs".into(),
            command: "journalctl --vacuum-time=7d".into(),
            service_name: None,
            status: hlh_domain::action::ActionStatus::Pending,
            approved_by: None,
        },
    )
    .await
    .unwrap();

    assert!(servers::delete(&mut conn, "alpha").await.unwrap());

    // Everything owned by the server is gone.
    let since = Utc::now() - chrono::Duration::days(1);
    assert!(metrics::raw_since(&mut conn, "alpha", since).await.unwrap().is_empty());
    assert!(alerts::list(&mut conn, Some("alpha"), None, 10)
        .await
        .unwrap()
        .is_empty());
    assert!(services::list_expected(&mut conn, "alpha").await.unwrap().is_empty());
    assert!(services::latest_status(&mut conn, "alpha", "plex")
        .await
        .unwrap()
        .is_none());
    assert!(actions::list_for_server(&mut conn, "alpha", 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn guid_uniqueness_is_enforced() {
    let store = Store::connect_in_memory().await.unwrap();
    const GUID: &str = "11111111-1111-4111-8111-111111111111";
    seed_server(&store, "alpha", GUID).await;

    let mut conn = store.acquire().await.unwrap();
    let duplicate = servers::create(
        &mut conn,
        servers::CreateServer {
            id: "other".into(),
            guid: Some(GUID.into()),
            hostname: "other.local".into(),
            display_name: None,
            status: ServerStatus::Online,
            last_seen: None,
            machine_type: MachineType::Server,
        },
    )
    .await;
    assert!(duplicate.is_err());

    // Multiple NULL guids coexist (legacy servers).
    for id in ["legacy-one", "legacy-two"] {
        servers::create(
            &mut conn,
            servers::CreateServer {
                id: id.into(),
                guid: None,
                hostname: format!("{id}.local"),
                display_name: None,
                status: ServerStatus::Unknown,
                last_seen: None,
                machine_type: MachineType::Server,
            },
        )
        .await
        .unwrap();
    }
    assert_eq!(servers::list(&mut conn).await.unwrap().len(), 3);
}
