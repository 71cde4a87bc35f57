//! Shared application state passed to all API handlers.

use std::sync::Arc;

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use hlh_domain::config::Config;
use hlh_domain::Result;
use hlh_packs::PackLoader;
use hlh_ssh::{PoolConfig, SshPool};
use hlh_store::Store;

use crate::host_keys::DbHostKeys;
use crate::notify::Notifier;
use crate::runtime::apply::ApplyEngine;
use crate::runtime::remediation::RateLimiter;
use crate::vault::Vault;
use crate::whitelist::CommandWhitelist;

/// Shared application state. Cheap to clone; everything mutable lives behind
/// its own lock or in the database.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub vault: Arc<Vault>,
    pub ssh_pool: Arc<SshPool>,
    pub packs: Arc<PackLoader>,
    pub whitelist: Arc<CommandWhitelist>,
    pub notifier: Arc<Notifier>,
    pub rate_limiter: Arc<RateLimiter>,
    pub apply_engine: ApplyEngine,
    /// SHA-256 of the shared admin key (read once at startup). `None` means
    /// the admin surface rejects every request.
    pub admin_key_hash: Option<Vec<u8>>,
}

impl AppState {
    /// Wire up every component. `admin_key`/`vault_key` come from the env
    /// vars named in the config.
    pub fn build(
        config: Arc<Config>,
        store: Store,
        admin_key: Option<String>,
        vault_key: &str,
    ) -> Result<Self> {
        let vault = Arc::new(Vault::new(store.clone(), vault_key)?);
        let ssh_pool = Arc::new(SshPool::new(
            PoolConfig {
                connect_timeout: std::time::Duration::from_secs(config.ssh.connect_timeout_secs),
                idle_ttl: std::time::Duration::from_secs(config.ssh.pool_idle_ttl_secs),
                max_connect_attempts: config.ssh.max_connect_attempts,
            },
            Arc::new(DbHostKeys::new(store.clone())),
        ));
        let packs = Arc::new(PackLoader::new(config.packs.dir.clone()));
        let apply_engine = ApplyEngine::new(
            store.clone(),
            vault.clone(),
            ssh_pool.clone(),
            packs.clone(),
        );

        let admin_key_hash = admin_key
            .filter(|key| !key.is_empty())
            .map(|key| Sha256::digest(key.as_bytes()).to_vec());

        Ok(Self {
            config,
            store,
            vault,
            ssh_pool,
            packs,
            whitelist: Arc::new(CommandWhitelist::standard()),
            notifier: Arc::new(Notifier::new()),
            rate_limiter: Arc::new(RateLimiter::new()),
            apply_engine,
            admin_key_hash,
        })
    }

    /// Hub base URL for install commands and agent configs: the configured
    /// `external_url` wins, otherwise derive from forwarded headers.
    pub fn hub_url(&self, headers: &HeaderMap) -> String {
        if let Some(url) = &self.config.server.external_url {
            return url.trim_end_matches('/').to_string();
        }

        let scheme = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("http");
        let host = headers
            .get("x-forwarded-host")
            .or_else(|| headers.get("host"))
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| {
                format!("{}:{}", self.config.server.host, self.config.server.port)
            });
        format!("{scheme}://{host}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    async fn state(external_url: Option<&str>) -> AppState {
        let mut config = Config::default();
        config.server.external_url = external_url.map(String::from);
        let store = Store::connect_in_memory().await.unwrap();
        AppState::build(
            Arc::new(config),
            store,
            Some("admin-key".into()),
            "vault-key",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn external_url_wins_and_is_trimmed() {
        let state = state(Some("https://hub.example.net/")).await;
        let url = state.hub_url(&HeaderMap::new());
        assert_eq!(url, "https://hub.example.net");
    }

    #[tokio::test]
    async fn forwarded_headers_derive_url() {
        let state = state(None).await;
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        headers.insert("x-forwarded-host", HeaderValue::from_static("hub.lan"));
        assert_eq!(state.hub_url(&headers), "https://hub.lan");

        let mut host_only = HeaderMap::new();
        host_only.insert("host", HeaderValue::from_static("10.0.0.2:8080"));
        assert_eq!(state.hub_url(&host_only), "http://10.0.0.2:8080");
    }

    #[tokio::test]
    async fn empty_admin_key_disables_admin_surface() {
        let store = Store::connect_in_memory().await.unwrap();
        let state = AppState::build(
            Arc::new(Config::default()),
            store,
            Some(String::new()),
            "k",
        )
        .unwrap();
        assert!(state.admin_key_hash.is_none());
    }
}
