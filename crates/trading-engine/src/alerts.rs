use reqwest::Client;
use serde_json::json;

/// Outbound operator notifications. A webhook is optional; delivery
/// failures log and never propagate into the trading path.
pub struct Notifier {
    http: Client,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            http: Client::new(),
            webhook_url,
        }
    }

    pub async fn send_message(&self, content: &str) {
        let Some(url) = &self.webhook_url else {
            tracing::debug!("alert webhook not configured, skipping notification");
            return;
        };

        let payload = json!({
            "content": content,
            "username": "trading-engine",
        });
        if let Err(e) = self.http.post(url).json(&payload).send().await {
            tracing::warn!("alert webhook delivery failed: {}", e);
        }
    }

    /// Emergency-grade alert: a distinct CRITICAL record in the log plus the
    /// webhook message.
    pub async fn send_critical(&self, alert: &str, body: &str) {
        tracing::error!(alert, level = "CRITICAL", "{}", body);
        self.send_message(&format!("**CRITICAL {}**\n{}", alert, body))
            .await;
    }
}
