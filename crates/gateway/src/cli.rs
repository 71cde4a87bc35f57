//! Command-line interface for the hub binary.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use hlh_domain::config::Config;

#[derive(Parser)]
#[command(name = "homelab-hub", about = "Homelab fleet-management hub", version)]
pub struct Cli {
    /// Path to the hub config file (TOML).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the hub server (default when no subcommand is given).
    Serve,
    /// Configuration helpers.
    Config(ConfigCommand),
    /// Print the version and exit.
    Version,
}

#[derive(Parser)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the config file and report issues.
    Validate,
    /// Print the effective configuration.
    Show,
}

/// Load the config file. Resolution order: `--config`, `$HLH_CONFIG`,
/// `hub.toml` in the working directory. A missing file yields defaults.
pub fn load_config(cli_path: Option<&PathBuf>) -> anyhow::Result<(Config, PathBuf)> {
    let path = cli_path
        .cloned()
        .or_else(|| std::env::var("HLH_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("hub.toml"));

    if !path.exists() {
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        return Ok((Config::default(), path));
    }

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: Config =
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
    Ok((config, path))
}

/// `config validate`: print every issue; false when any is an error.
pub fn validate(config: &Config, path: &PathBuf) -> bool {
    let issues = config.validate();
    if issues.is_empty() {
        println!("{}: OK", path.display());
        return true;
    }
    for issue in &issues {
        println!("{issue}");
    }
    !issues
        .iter()
        .any(|i| i.severity == hlh_domain::config::ConfigSeverity::Error)
}

/// `config show`: effective config as TOML, after defaults.
pub fn show(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("failed to render config: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let path = PathBuf::from("/nonexistent/hub.toml");
        let (config, _) = load_config(Some(&path)).unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn config_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.toml");
        std::fs::write(&path, "[server]\nport = 9999\n").unwrap();
        let (config, loaded_path) = load_config(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(loaded_path, path);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.toml");
        std::fs::write(&path, "[server\nport = 9999\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }
}
