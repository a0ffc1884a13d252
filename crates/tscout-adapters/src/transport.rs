//! Notification transports. Delivery is a single attempt; redelivery happens
//! on a later run from the ledger's `send_failed` state.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Error)]
pub enum NotifyError {
    /// Stored without its URL: the Bot API path carries the token.
    #[error("transport request failed: {0}")]
    Http(reqwest::Error),
    #[error("transport rejected message (status {status}): {description}")]
    Rejected { status: u16, description: String },
    #[error("transport misconfigured: {0}")]
    Config(String),
}

impl From<reqwest::Error> for NotifyError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.without_url())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deliver one rendered message. `Ok` means the remote side accepted it.
    async fn deliver(&self, message: &str) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub api_base: String,
    pub bot_token: String,
    pub chat_id: String,
    pub timeout: Duration,
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            api_base: TELEGRAM_API_BASE.to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            timeout: Duration::from_secs(20),
        }
    }

    fn send_message_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.bot_token
        )
    }
}

/// Bot API `sendMessage` with HTML parse mode.
#[derive(Debug)]
pub struct TelegramTransport {
    client: reqwest::Client,
    config: TelegramConfig,
}

#[derive(Debug, Deserialize)]
struct TelegramReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramTransport {
    pub fn new(config: TelegramConfig) -> Result<Self, NotifyError> {
        if config.bot_token.trim().is_empty() {
            return Err(NotifyError::Config("telegram bot token is empty".into()));
        }
        if config.chat_id.trim().is_empty() {
            return Err(NotifyError::Config("telegram chat id is empty".into()));
        }
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn deliver(&self, message: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(self.config.send_message_url())
            .json(&json!({
                "chat_id": self.config.chat_id,
                "text": message,
                "parse_mode": "HTML",
                "disable_web_page_preview": true,
            }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let reply: Option<TelegramReply> = serde_json::from_str(&body).ok();
        match reply {
            Some(TelegramReply { ok: true, .. }) if status.is_success() => {
                debug!(chat_id = %self.config.chat_id, "telegram accepted message");
                Ok(())
            }
            Some(TelegramReply { description, .. }) => Err(NotifyError::Rejected {
                status: status.as_u16(),
                description: description.unwrap_or_else(|| "no description".into()),
            }),
            None => Err(NotifyError::Rejected {
                status: status.as_u16(),
                description: body.chars().take(200).collect(),
            }),
        }
    }
}

/// Dry-run transport: logs the message and reports success.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, message: &str) -> Result<(), NotifyError> {
        info!(chars = message.chars().count(), "dry-run notification\n{message}");
        Ok(())
    }
}
