//! Hub process configuration, loaded from a TOML file with env overrides.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub packs: PacksConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Public base URL used in install commands and agent configs. When
    /// unset, derived per-request from forwarded headers.
    #[serde(default)]
    pub external_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            external_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "d_db_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: d_db_url() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Environment variable holding the shared admin API key.
    /// If the env var is unset, admin endpoints reject every request.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key_env: d_api_key_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Environment variable holding the 32-byte (hex or raw) vault key.
    #[serde(default = "d_vault_key_env")]
    pub encryption_key_env: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            encryption_key_env: d_vault_key_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "d_10")]
    pub connect_timeout_secs: u64,
    #[serde(default = "d_30")]
    pub command_timeout_secs: u64,
    /// Idle pooled sessions are closed after this long.
    #[serde(default = "d_300")]
    pub pool_idle_ttl_secs: u64,
    #[serde(default = "d_3")]
    pub max_connect_attempts: u32,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: d_10(),
            command_timeout_secs: d_30(),
            pool_idle_ttl_secs: d_300(),
            max_connect_attempts: d_3(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacksConfig {
    #[serde(default = "d_packs_dir")]
    pub dir: PathBuf,
}

impl Default for PacksConfig {
    fn default() -> Self {
        Self { dir: d_packs_dir() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "d_60")]
    pub stale_check_interval_secs: u64,
    #[serde(default = "d_900")]
    pub rollup_interval_secs: u64,
    #[serde(default = "d_3600")]
    pub prune_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stale_check_interval_secs: d_60(),
            rollup_interval_secs: d_900(),
            prune_interval_secs: d_3600(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }

        if self.server.host.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }

        if let Some(url) = &self.server.external_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: "server.external_url".into(),
                    message: format!(
                        "external_url must start with http:// or https:// (got \"{url}\")"
                    ),
                });
            }
        }

        if self.database.url.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "database.url".into(),
                message: "url must not be empty".into(),
            });
        }

        if self.ssh.max_connect_attempts == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "ssh.max_connect_attempts".into(),
                message: "at least one connection attempt is required".into(),
            });
        }

        if self.scheduler.stale_check_interval_secs == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "scheduler.stale_check_interval_secs".into(),
                message: "interval must be greater than 0".into(),
            });
        }

        if self.server.external_url.is_none() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "server.external_url".into(),
                message: "not set — install commands will derive the hub URL from request headers"
                    .into(),
            });
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Serde default helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_host() -> String {
    "0.0.0.0".into()
}
fn d_port() -> u16 {
    8080
}
fn d_db_url() -> String {
    "sqlite:data/hub.db".into()
}
fn d_api_key_env() -> String {
    "HLH_API_KEY".into()
}
fn d_vault_key_env() -> String {
    "HLH_ENCRYPTION_KEY".into()
}
fn d_packs_dir() -> PathBuf {
    PathBuf::from("packs")
}
fn d_3() -> u32 {
    3
}
fn d_10() -> u64 {
    10
}
fn d_30() -> u64 {
    30
}
fn d_60() -> u64 {
    60
}
fn d_300() -> u64 {
    300
}
fn d_900() -> u64 {
    900
}
fn d_3600() -> u64 {
    3_600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.ssh.command_timeout_secs, 30);
        assert_eq!(cfg.ssh.pool_idle_ttl_secs, 300);
        assert_eq!(cfg.scheduler.stale_check_interval_secs, 60);
        // Only the missing-external-url warning.
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .all(|i| i.severity == ConfigSeverity::Warning));
    }

    #[test]
    fn empty_toml_parses_to_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.database.url, "sqlite:data/hub.db");
    }

    #[test]
    fn partial_toml_overrides() {
        let cfg: Config = toml::from_str(
            r#"
            [server]
            port = 9000
            external_url = "https://hub.example.net"

            [ssh]
            command_timeout_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.ssh.command_timeout_secs, 60);
        assert_eq!(cfg.ssh.connect_timeout_secs, 10);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn bad_external_url_is_an_error() {
        let cfg: Config = toml::from_str(
            r#"
            [server]
            external_url = "hub.example.net"
            "#,
        )
        .unwrap();
        assert!(cfg
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.field == "server.external_url"));
    }
}
