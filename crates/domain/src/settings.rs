//! Operator-tunable settings stored as JSON values in the config table.
//!
//! Each record deserializes leniently (missing fields take defaults) so
//! partial updates can deep-merge server-side.

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Alert thresholds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-metric breach thresholds. A breach is *sustained* after
/// `sustained_heartbeats` consecutive samples above the threshold, or once
/// `sustained_seconds` have elapsed since the first breaching sample —
/// whichever comes first. Zero means immediate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricThreshold {
    pub high_percent: f64,
    pub critical_percent: f64,
    #[serde(default)]
    pub sustained_heartbeats: u32,
    #[serde(default)]
    pub sustained_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdsConfig {
    #[serde(default = "d_cpu_threshold")]
    pub cpu: MetricThreshold,
    #[serde(default = "d_memory_threshold")]
    pub memory: MetricThreshold,
    #[serde(default = "d_disk_threshold")]
    pub disk: MetricThreshold,
    /// Seconds without a heartbeat before a server counts as offline.
    #[serde(default = "d_offline_seconds")]
    pub server_offline_seconds: u64,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            cpu: d_cpu_threshold(),
            memory: d_memory_threshold(),
            disk: d_disk_threshold(),
            server_offline_seconds: d_offline_seconds(),
        }
    }
}

impl ThresholdsConfig {
    /// Reject configs where a critical threshold does not exceed its high
    /// threshold.
    pub fn validate(&self) -> Result<(), String> {
        for (name, t) in [("cpu", &self.cpu), ("memory", &self.memory), ("disk", &self.disk)] {
            if t.critical_percent <= t.high_percent {
                return Err(format!(
                    "{name}: critical_percent ({}) must be greater than high_percent ({})",
                    t.critical_percent, t.high_percent
                ));
            }
        }
        Ok(())
    }
}

fn d_cpu_threshold() -> MetricThreshold {
    MetricThreshold {
        high_percent: 85.0,
        critical_percent: 95.0,
        sustained_heartbeats: 3,
        sustained_seconds: 600,
    }
}

fn d_memory_threshold() -> MetricThreshold {
    MetricThreshold {
        high_percent: 85.0,
        critical_percent: 95.0,
        sustained_heartbeats: 3,
        sustained_seconds: 600,
    }
}

fn d_disk_threshold() -> MetricThreshold {
    // Disk fills slowly; alert on the first breaching sample.
    MetricThreshold {
        high_percent: 80.0,
        critical_percent: 95.0,
        sustained_heartbeats: 0,
        sustained_seconds: 0,
    }
}

fn d_offline_seconds() -> u64 {
    180
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Notifications
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Minimum interval between repeat notifications for the same alert at the
/// same severity. Low/medium share the high cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownConfig {
    #[serde(default = "d_critical_minutes")]
    pub critical_minutes: u64,
    #[serde(default = "d_high_minutes")]
    pub high_minutes: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            critical_minutes: d_critical_minutes(),
            high_minutes: d_high_minutes(),
        }
    }
}

impl CooldownConfig {
    pub fn minutes_for(&self, severity: crate::alert::AlertSeverity) -> u64 {
        match severity {
            crate::alert::AlertSeverity::Critical => self.critical_minutes,
            _ => self.high_minutes,
        }
    }
}

fn d_critical_minutes() -> u64 {
    30
}

fn d_high_minutes() -> u64 {
    240
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Empty string disables all outbound notifications.
    #[serde(default)]
    pub slack_webhook_url: String,
    #[serde(default = "d_true")]
    pub notify_on_critical: bool,
    #[serde(default = "d_true")]
    pub notify_on_high: bool,
    #[serde(default = "d_true")]
    pub notify_on_remediation: bool,
    #[serde(default)]
    pub cooldowns: CooldownConfig,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            slack_webhook_url: String::new(),
            notify_on_critical: true,
            notify_on_high: true,
            notify_on_remediation: true,
            cooldowns: CooldownConfig::default(),
        }
    }
}

impl NotificationsConfig {
    pub fn enabled(&self) -> bool {
        !self.slack_webhook_url.is_empty()
    }

    pub fn notify_on(&self, severity: crate::alert::AlertSeverity) -> bool {
        match severity {
            crate::alert::AlertSeverity::Critical => self.notify_on_critical,
            _ => self.notify_on_high,
        }
    }
}

fn d_true() -> bool {
    true
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cost + SSH defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostConfig {
    /// Price per kWh in the operator's currency.
    #[serde(default = "d_rate")]
    pub electricity_rate: f64,
    #[serde(default = "d_currency")]
    pub currency_symbol: String,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            electricity_rate: d_rate(),
            currency_symbol: d_currency(),
        }
    }
}

fn d_rate() -> f64 {
    0.24
}

fn d_currency() -> String {
    "£".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "d_ssh_user")]
    pub default_username: String,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            default_username: d_ssh_user(),
        }
    }
}

fn d_ssh_user() -> String {
    "homelab".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertSeverity;

    #[test]
    fn default_thresholds_validate() {
        assert!(ThresholdsConfig::default().validate().is_ok());
    }

    #[test]
    fn critical_must_exceed_high() {
        let mut cfg = ThresholdsConfig::default();
        cfg.disk.critical_percent = cfg.disk.high_percent;
        let err = cfg.validate().unwrap_err();
        assert!(err.starts_with("disk:"));
    }

    #[test]
    fn cooldown_low_and_medium_share_high_window() {
        let cooldowns = CooldownConfig::default();
        assert_eq!(cooldowns.minutes_for(AlertSeverity::Critical), 30);
        assert_eq!(cooldowns.minutes_for(AlertSeverity::High), 240);
        assert_eq!(cooldowns.minutes_for(AlertSeverity::Medium), 240);
        assert_eq!(cooldowns.minutes_for(AlertSeverity::Low), 240);
    }

    #[test]
    fn empty_webhook_disables_notifications() {
        let cfg = NotificationsConfig::default();
        assert!(!cfg.enabled());
    }

    #[test]
    fn partial_json_takes_defaults() {
        let cfg: ThresholdsConfig =
            serde_json::from_str(r#"{"cpu": {"high_percent": 70, "critical_percent": 90}}"#)
                .unwrap();
        assert_eq!(cfg.cpu.high_percent, 70.0);
        assert_eq!(cfg.cpu.sustained_heartbeats, 0);
        assert_eq!(cfg.memory.high_percent, 85.0);
        assert_eq!(cfg.server_offline_seconds, 180);
    }
}
