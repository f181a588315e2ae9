//! Best-effort push alerts.
//!
//! [`AlertSink::send`] never fails from the caller's point of view: delivery
//! problems are logged and swallowed so a broken notifier cannot stall a
//! cycle.

use crate::config::AlertConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const TELEGRAM_API: &str = "https://api.telegram.org";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Fire-and-forget notification.
    async fn send(&self, text: &str);
}

/// Alert sink that only writes to the log.
#[derive(Debug, Default, Clone)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, text: &str) {
        info!(alert = %text, "📣 Alert");
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

/// Telegram Bot API alert sink.
pub struct TelegramAlertSink {
    http: reqwest::Client,
    base_url: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramAlertSink {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Result<Self> {
        Self::with_base_url(TELEGRAM_API, bot_token, chat_id)
    }

    /// Point the sink at a different API host.
    pub fn with_base_url(
        base_url: impl Into<String>,
        bot_token: impl Into<String>,
        chat_id: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build alert HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        })
    }

    async fn deliver(&self, text: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.bot_token);
        self.http
            .post(&url)
            .json(&SendMessage {
                chat_id: &self.chat_id,
                text,
            })
            .send()
            .await
            .context("Telegram request failed")?
            .error_for_status()
            .context("Telegram rejected message")?;
        Ok(())
    }
}

#[async_trait]
impl AlertSink for TelegramAlertSink {
    async fn send(&self, text: &str) {
        match self.deliver(text).await {
            Ok(()) => debug!("Alert delivered"),
            Err(e) => warn!(error = %format!("{:#}", e), "Failed to deliver alert"),
        }
    }
}

/// Telegram when both credentials are configured, log-only otherwise.
pub fn from_config(config: &AlertConfig) -> Result<Arc<dyn AlertSink>> {
    match (&config.telegram_bot_token, &config.telegram_chat_id) {
        (Some(token), Some(chat)) if !token.is_empty() && !chat.is_empty() => {
            info!("Telegram alerts enabled");
            Ok(Arc::new(TelegramAlertSink::new(token.clone(), chat.clone())?))
        }
        _ => {
            info!("Telegram not configured, alerts go to the log only");
            Ok(Arc::new(LogAlertSink))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_telegram_posts_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .and(body_json(serde_json::json!({
                "chat_id": "123",
                "text": "cycle complete"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = TelegramAlertSink::with_base_url(server.uri(), "TOKEN", "123").unwrap();
        sink.send("cycle complete").await;
    }

    #[tokio::test]
    async fn test_telegram_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let sink = TelegramAlertSink::with_base_url(server.uri(), "TOKEN", "123").unwrap();
        // Must return normally
        sink.send("ignored").await;
    }

    #[test]
    fn test_from_config_falls_back_to_log() {
        assert!(from_config(&AlertConfig::default()).is_ok());

        let partial = AlertConfig {
            telegram_bot_token: Some("TOKEN".to_string()),
            telegram_chat_id: None,
        };
        assert!(from_config(&partial).is_ok());
    }
}
