use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use hlh_domain::config::{Config, ConfigSeverity};
use hlh_gateway::api;
use hlh_gateway::cli::{Cli, Command, ConfigAction};
use hlh_gateway::runtime::scheduler::Scheduler;
use hlh_gateway::state::AppState;
use hlh_store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, _config_path) = hlh_gateway::cli::load_config(cli.config.as_ref())?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(config_command)) => {
            let (config, config_path) = hlh_gateway::cli::load_config(cli.config.as_ref())?;
            match config_command.action {
                ConfigAction::Validate => {
                    if !hlh_gateway::cli::validate(&config, &config_path) {
                        std::process::exit(1);
                    }
                }
                ConfigAction::Show => hlh_gateway::cli::show(&config),
            }
            Ok(())
        }
        Some(Command::Version) => {
            println!("homelab-hub {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON logs; `RUST_LOG` overrides the default filter.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hlh_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("Homelab Hub starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Database ─────────────────────────────────────────────────────
    if let Some(path) = config.database.url.strip_prefix("sqlite:") {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating data directory {}", parent.display()))?;
            }
        }
    }
    let store = Store::connect(&config.database.url)
        .await
        .with_context(|| format!("opening database {}", config.database.url))?;
    tracing::info!(url = %config.database.url, "database ready");

    // ── Secrets (read once from the environment) ─────────────────────
    let admin_key = match std::env::var(&config.auth.api_key_env) {
        Ok(key) if !key.is_empty() => {
            tracing::info!(env_var = %config.auth.api_key_env, "admin API key auth enabled");
            Some(key)
        }
        _ => {
            tracing::warn!(
                env_var = %config.auth.api_key_env,
                "admin API key NOT set — admin endpoints will reject all requests"
            );
            None
        }
    };
    let vault_key = match std::env::var(&config.vault.encryption_key_env) {
        Ok(key) if !key.is_empty() => key,
        _ => {
            tracing::warn!(
                env_var = %config.vault.encryption_key_env,
                "vault encryption key NOT set — stored secrets will not survive restarts"
            );
            let mut bytes = [0u8; 32];
            use rand::RngCore;
            rand::thread_rng().fill_bytes(&mut bytes);
            hex::encode(bytes)
        }
    };

    // ── Application state ────────────────────────────────────────────
    let state = AppState::build(config.clone(), store.clone(), admin_key, &vault_key)?;
    tracing::info!(
        packs_dir = %config.packs.dir.display(),
        ssh_pool_ttl = config.ssh.pool_idle_ttl_secs,
        "application state ready"
    );

    // ── Background scheduler ─────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(
        store,
        state.notifier.clone(),
        state.ssh_pool.clone(),
        state.rate_limiter.clone(),
    ));
    scheduler.spawn_all(&config.scheduler);
    tracing::info!(
        stale_interval = config.scheduler.stale_check_interval_secs,
        rollup_interval = config.scheduler.rollup_interval_secs,
        prune_interval = config.scheduler.prune_interval_secs,
        "scheduler started"
    );

    // ── Router + bind ────────────────────────────────────────────────
    let app = api::router(state.clone()).with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "Homelab Hub listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("axum server error")?;

    Ok(())
}
