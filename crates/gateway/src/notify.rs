//! Outbound webhook notifier (Slack-compatible attachment payloads).
//!
//! Delivery is best-effort: retries with backoff on 5xx/network errors,
//! terminal on 404/429, and a failure never propagates to the request that
//! triggered it.

use std::time::Duration;

use hlh_domain::alert::{AlertEvent, AlertSeverity};

/// Colour strip on the Slack attachment.
fn severity_colour(severity: AlertSeverity, resolved: bool) -> &'static str {
    if resolved {
        return "#22C55E"; // green
    }
    match severity {
        AlertSeverity::Critical => "#DC2626", // red
        AlertSeverity::High => "#F97316",     // orange
        AlertSeverity::Medium => "#EAB308",   // yellow
        AlertSeverity::Low => "#22C55E",      // green
    }
}

const INFO_COLOUR: &str = "#3B82F6"; // blue

/// Completed/failed remediation, reported after result acknowledgement.
#[derive(Debug, Clone)]
pub struct ActionEvent {
    pub action_id: i64,
    pub server_id: String,
    pub server_name: String,
    pub action_type: String,
    pub service_name: Option<String>,
    pub is_success: bool,
    pub exit_code: Option<i64>,
    pub stderr: Option<String>,
}

pub struct Notifier {
    client: reqwest::Client,
    /// Delays before retry attempts 2 and 3 (and the base unit for tests).
    retry_delays: [Duration; 3],
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builds"),
            retry_delays: [
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
        }
    }

    /// Alert notification. Logs and swallows delivery failures.
    pub async fn send_alert(&self, webhook_url: &str, event: &AlertEvent) {
        let payload = alert_payload(event);
        if let Err(reason) = self.post_with_retries(webhook_url, &payload).await {
            tracing::warn!(
                server_id = %event.server_id,
                title = %event.title,
                reason,
                "alert notification delivery failed"
            );
        }
    }

    /// Remediation completion/failure notification.
    pub async fn send_action(&self, webhook_url: &str, event: &ActionEvent) {
        let payload = action_payload(event);
        if let Err(reason) = self.post_with_retries(webhook_url, &payload).await {
            tracing::warn!(
                action_id = event.action_id,
                server_id = %event.server_id,
                reason,
                "action notification delivery failed"
            );
        }
    }

    /// One-shot test message for the config endpoint. Unlike the alert path
    /// this reports the outcome to the caller.
    pub async fn send_test(&self, webhook_url: &str) -> Result<(), String> {
        let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M UTC");
        let payload = serde_json::json!({
            "attachments": [{
                "color": INFO_COLOUR,
                "blocks": [
                    { "type": "header",
                      "text": { "type": "plain_text", "text": "Homelab Hub Test" } },
                    { "type": "section",
                      "text": { "type": "mrkdwn", "text": "Webhook configured successfully!" } },
                    { "type": "context",
                      "elements": [{ "type": "mrkdwn", "text": format!("Sent at {timestamp}") }] },
                ],
            }]
        });

        let response = self
            .client
            .post(webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    "Connection timed out".to_string()
                } else if e.is_connect() {
                    "Failed to connect to webhook URL".to_string()
                } else {
                    e.to_string()
                }
            })?;

        match response.status().as_u16() {
            200..=299 => Ok(()),
            404 => Err("Invalid webhook URL".into()),
            429 => Err("Too many requests, try again later".into()),
            status => Err(format!("webhook returned HTTP {status}")),
        }
    }

    async fn post_with_retries(
        &self,
        webhook_url: &str,
        payload: &serde_json::Value,
    ) -> Result<(), String> {
        let mut last_error = String::new();
        for (attempt, delay) in self.retry_delays.iter().enumerate() {
            if attempt > 0 {
                tokio::time::sleep(*delay).await;
            }
            match self.client.post(webhook_url).json(payload).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    // Bad URL or rate limit won't improve with retries.
                    if status.as_u16() == 404 || status.as_u16() == 429 {
                        return Err(format!("terminal HTTP {status}"));
                    }
                    last_error = format!("HTTP {status}");
                }
                Err(e) => last_error = e.to_string(),
            }
        }
        Err(last_error)
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload templates
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn alert_payload(event: &AlertEvent) -> serde_json::Value {
    let colour = severity_colour(event.severity, event.is_resolved);
    let header = if event.is_resolved {
        format!("Resolved: {}", event.title)
    } else if event.is_reminder {
        format!("Reminder: {}", event.title)
    } else {
        event.title.clone()
    };

    let mut fields = vec![format!("*Server:* {}", event.server_name)];
    if let (Some(threshold), Some(actual)) = (event.threshold_value, event.actual_value) {
        fields.push(format!(
            "*{}:* {actual:.1}% (threshold {threshold:.0}%)",
            event.alert_type.as_str()
        ));
    }
    fields.push(format!("*Severity:* {:?}", event.severity));

    serde_json::json!({
        "attachments": [{
            "color": colour,
            "blocks": [
                { "type": "header", "text": { "type": "plain_text", "text": header } },
                { "type": "section",
                  "text": { "type": "mrkdwn", "text": event.message } },
                { "type": "context",
                  "elements": [{ "type": "mrkdwn", "text": fields.join(" | ") }] },
            ],
        }]
    })
}

fn action_payload(event: &ActionEvent) -> serde_json::Value {
    let label = match event.service_name.as_deref() {
        Some(service) => format!("{} ({service})", event.action_type),
        None => event.action_type.clone(),
    };
    let (colour, headline) = if event.is_success {
        ("#22C55E", format!("Remediation completed: {label}"))
    } else {
        ("#DC2626", format!("Remediation failed: {label}"))
    };

    let mut body = format!(
        "*Server:* {} | *Exit code:* {}",
        event.server_name,
        event
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "?".into()),
    );
    if !event.is_success {
        if let Some(stderr) = event.stderr.as_deref().filter(|s| !s.is_empty()) {
            let mut end = stderr.len().min(500);
            while !stderr.is_char_boundary(end) {
                end -= 1;
            }
            body.push_str(&format!("\n```{}```", &stderr[..end]));
        }
    }

    serde_json::json!({
        "attachments": [{
            "color": colour,
            "blocks": [
                { "type": "header", "text": { "type": "plain_text", "text": headline } },
                { "type": "section", "text": { "type": "mrkdwn", "text": body } },
            ],
        }]
    })
}
