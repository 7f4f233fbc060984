//! Operator notifications.
//!
//! Failures inside a cycle are reported here instead of aborting it.

use crate::config::NotificationConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Sink for human-readable alerts.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, contents: &str) -> Result<()>;
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, title: &str, contents: &str) -> Result<()> {
        info!(%title, %contents, "Notification");
        Ok(())
    }
}

/// Posts notifications to a Slack incoming webhook.
pub struct SlackNotifier {
    http: Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            webhook_url: webhook_url.into(),
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, title: &str, contents: &str) -> Result<()> {
        let payload = json!({
            "text": title,
            "blocks": [
                {"type": "header", "text": {"type": "plain_text", "text": title}},
                {"type": "section", "text": {"type": "mrkdwn", "text": contents}}
            ]
        });

        self.http
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .context("Failed to post Slack notification")?
            .error_for_status()
            .context("Slack webhook rejected notification")?;

        Ok(())
    }
}

/// Notifier selected by configuration.
pub fn from_config(config: &NotificationConfig) -> Result<Arc<dyn Notifier>> {
    match &config.slack_webhook_url {
        Some(url) if !url.is_empty() => Ok(Arc::new(SlackNotifier::new(url.clone())?)),
        _ => Ok(Arc::new(LogNotifier)),
    }
}

/// Send a notification, logging instead of failing when delivery breaks.
pub async fn notify_best_effort(notifier: &dyn Notifier, title: &str, contents: &str) {
    if let Err(e) = notifier.notify(title, contents).await {
        warn!(%title, error = %e, "Failed to deliver notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_slack_notifier_posts_to_webhook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = SlackNotifier::new(format!("{}/hook", server.uri())).unwrap();
        notifier.notify("Rebalance done", "*long*: `3`").await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_delivery_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = SlackNotifier::new(format!("{}/hook", server.uri())).unwrap();
        assert!(notifier.notify("t", "c").await.is_err());
        notify_best_effort(&notifier, "t", "c").await;
    }

    #[test]
    fn test_missing_webhook_falls_back_to_log() {
        assert!(from_config(&NotificationConfig::default()).is_ok());
    }
}
