//! Database schema. Statements are idempotent and applied at startup.
//!
//! All timestamps are UTC, stored as TEXT. JSON columns hold opaque blobs
//! only (pack assignments, mismatches, apply results, config values).

pub const STATEMENTS: &[&str] = &[
    // ── servers: the aggregate root ─────────────────────────────────
    r#"
    CREATE TABLE IF NOT EXISTS servers (
        id TEXT PRIMARY KEY,
        guid TEXT UNIQUE,
        hostname TEXT NOT NULL,
        display_name TEXT,
        ip_address TEXT,
        tailscale_hostname TEXT,
        status TEXT NOT NULL DEFAULT 'unknown',
        last_seen TEXT,
        is_inactive INTEGER NOT NULL DEFAULT 0,
        inactive_since TEXT,
        machine_type TEXT NOT NULL DEFAULT 'server',
        machine_category TEXT,
        machine_category_source TEXT NOT NULL DEFAULT 'auto',
        idle_watts REAL,
        tdp_watts REAL,
        cpu_model TEXT,
        cpu_cores INTEGER,
        architecture TEXT,
        os_distribution TEXT,
        os_version TEXT,
        kernel_version TEXT,
        agent_version TEXT,
        agent_mode TEXT NOT NULL DEFAULT 'readonly',
        is_paused INTEGER NOT NULL DEFAULT 0,
        paused_at TEXT,
        ssh_username TEXT,
        sudo_mode TEXT NOT NULL DEFAULT 'passwordless',
        config_user TEXT,
        assigned_packs TEXT NOT NULL DEFAULT '["base"]',
        drift_detection_enabled INTEGER NOT NULL DEFAULT 0,
        updates_available INTEGER NOT NULL DEFAULT 0,
        security_updates INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )
    "#,
    // ── credentials ─────────────────────────────────────────────────
    r#"
    CREATE TABLE IF NOT EXISTS registration_tokens (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        token_hash TEXT NOT NULL UNIQUE,
        token_prefix TEXT NOT NULL,
        mode TEXT NOT NULL DEFAULT 'readonly',
        display_name TEXT,
        monitored_services TEXT,
        expires_at TEXT NOT NULL,
        claimed_at TEXT,
        claimed_by_server_id TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_registration_tokens_hash ON registration_tokens (token_hash)",
    r#"
    CREATE TABLE IF NOT EXISTS agent_credentials (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server_guid TEXT NOT NULL REFERENCES servers (guid) ON DELETE CASCADE,
        api_token_hash TEXT NOT NULL,
        api_token_prefix TEXT NOT NULL,
        is_legacy INTEGER NOT NULL DEFAULT 0,
        last_used_at TEXT,
        revoked_at TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_agent_credentials_guid ON agent_credentials (server_guid)",
    // ── telemetry tiers ─────────────────────────────────────────────
    r#"
    CREATE TABLE IF NOT EXISTS metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server_id TEXT NOT NULL REFERENCES servers (id) ON DELETE CASCADE,
        timestamp TEXT NOT NULL,
        cpu_percent REAL,
        memory_percent REAL,
        memory_total_mb INTEGER,
        memory_used_mb INTEGER,
        disk_percent REAL,
        disk_total_gb REAL,
        disk_used_gb REAL,
        network_rx_bytes INTEGER,
        network_tx_bytes INTEGER,
        load_1m REAL,
        load_5m REAL,
        load_15m REAL,
        uptime_seconds INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_metrics_server_ts ON metrics (server_id, timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS metrics_hourly (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server_id TEXT NOT NULL REFERENCES servers (id) ON DELETE CASCADE,
        bucket TEXT NOT NULL,
        sample_count INTEGER NOT NULL DEFAULT 0,
        cpu_avg REAL, cpu_min REAL, cpu_max REAL,
        memory_avg REAL, memory_min REAL, memory_max REAL,
        disk_avg REAL, disk_min REAL, disk_max REAL,
        UNIQUE (server_id, bucket)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_metrics_hourly_server_ts ON metrics_hourly (server_id, bucket)",
    r#"
    CREATE TABLE IF NOT EXISTS metrics_daily (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server_id TEXT NOT NULL REFERENCES servers (id) ON DELETE CASCADE,
        bucket TEXT NOT NULL,
        sample_count INTEGER NOT NULL DEFAULT 0,
        cpu_avg REAL, cpu_min REAL, cpu_max REAL,
        memory_avg REAL, memory_min REAL, memory_max REAL,
        disk_avg REAL, disk_min REAL, disk_max REAL,
        UNIQUE (server_id, bucket)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_metrics_daily_server_ts ON metrics_daily (server_id, bucket)",
    // ── alerts ──────────────────────────────────────────────────────
    r#"
    CREATE TABLE IF NOT EXISTS alerts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server_id TEXT NOT NULL REFERENCES servers (id) ON DELETE CASCADE,
        alert_type TEXT NOT NULL,
        severity TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'open',
        title TEXT NOT NULL,
        message TEXT NOT NULL,
        service_name TEXT,
        threshold_value REAL,
        actual_value REAL,
        auto_resolved INTEGER NOT NULL DEFAULT 0,
        acknowledged_at TEXT,
        resolved_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_alerts_server_status ON alerts (server_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_alerts_severity_status ON alerts (severity, status)",
    "CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts (created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS alert_state (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server_id TEXT NOT NULL REFERENCES servers (id) ON DELETE CASCADE,
        metric_key TEXT NOT NULL,
        breach_count INTEGER NOT NULL DEFAULT 0,
        breach_level TEXT,
        first_breach_at TEXT,
        last_alert_id INTEGER,
        last_notified_at TEXT,
        UNIQUE (server_id, metric_key)
    )
    "#,
    // ── services ────────────────────────────────────────────────────
    r#"
    CREATE TABLE IF NOT EXISTS expected_services (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server_id TEXT NOT NULL REFERENCES servers (id) ON DELETE CASCADE,
        service_name TEXT NOT NULL,
        display_name TEXT,
        is_critical INTEGER NOT NULL DEFAULT 0,
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        UNIQUE (server_id, service_name)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_expected_services_server ON expected_services (server_id)",
    r#"
    CREATE TABLE IF NOT EXISTS service_status (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server_id TEXT NOT NULL REFERENCES servers (id) ON DELETE CASCADE,
        service_name TEXT NOT NULL,
        status TEXT NOT NULL,
        pid INTEGER,
        memory_mb REAL,
        cpu_percent REAL,
        status_reason TEXT,
        timestamp TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_service_status_server_ts ON service_status (server_id, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_service_status_server_name_ts ON service_status (server_id, service_name, timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS pending_packages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server_id TEXT NOT NULL REFERENCES servers (id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        current_version TEXT NOT NULL,
        new_version TEXT NOT NULL,
        repository TEXT NOT NULL,
        is_security INTEGER NOT NULL DEFAULT 0,
        detected_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_pending_packages_server ON pending_packages (server_id)",
    // ── remediation ─────────────────────────────────────────────────
    r#"
    CREATE TABLE IF NOT EXISTS remediation_actions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server_id TEXT NOT NULL REFERENCES servers (id) ON DELETE CASCADE,
        action_type TEXT NOT NULL,
        command TEXT NOT NULL,
        service_name TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        exit_code INTEGER,
        stdout TEXT,
        stderr TEXT,
        created_at TEXT NOT NULL,
        approved_at TEXT,
        approved_by TEXT,
        executed_at TEXT,
        completed_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_actions_server_status ON remediation_actions (server_id, status, created_at)",
    // ── configuration management ────────────────────────────────────
    r#"
    CREATE TABLE IF NOT EXISTS config_checks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server_id TEXT NOT NULL REFERENCES servers (id) ON DELETE CASCADE,
        pack_name TEXT NOT NULL,
        is_compliant INTEGER NOT NULL,
        mismatches TEXT NOT NULL DEFAULT '[]',
        checked_at TEXT NOT NULL,
        check_duration_ms INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_config_checks_server ON config_checks (server_id, pack_name, checked_at)",
    r#"
    CREATE TABLE IF NOT EXISTS config_applies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server_id TEXT NOT NULL REFERENCES servers (id) ON DELETE CASCADE,
        pack_name TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        progress INTEGER NOT NULL DEFAULT 0,
        current_item TEXT,
        items_total INTEGER NOT NULL DEFAULT 0,
        items_completed INTEGER NOT NULL DEFAULT 0,
        items_failed INTEGER NOT NULL DEFAULT 0,
        results TEXT NOT NULL DEFAULT '[]',
        error TEXT,
        triggered_by TEXT NOT NULL DEFAULT 'user',
        started_at TEXT NOT NULL,
        completed_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_config_applies_server ON config_applies (server_id, status)",
    // ── settings + secrets ──────────────────────────────────────────
    r#"
    CREATE TABLE IF NOT EXISTS config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vault_secrets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        credential_type TEXT NOT NULL,
        scope TEXT NOT NULL,
        nonce TEXT NOT NULL,
        ciphertext TEXT NOT NULL,
        created_at TEXT NOT NULL,
        last_used_at TEXT,
        UNIQUE (credential_type, scope)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ssh_host_keys (
        host TEXT PRIMARY KEY,
        key_type TEXT NOT NULL,
        key_base64 TEXT NOT NULL,
        first_seen TEXT NOT NULL
    )
    "#,
];
