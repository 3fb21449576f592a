//! Telegram Bot API channel.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

use pricewatch_shared::{NotifyConfig, PriceWatchError, Result, resolve_telegram_credentials};

use crate::NotificationChannel;

/// Sends HTML-formatted messages to one chat through a bot.
pub struct TelegramChannel {
    client: Client,
    api_base: String,
    token: String,
    chat_id: String,
}

impl std::fmt::Debug for TelegramChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramChannel")
            .field("api_base", &self.api_base)
            .field("chat_id", &self.chat_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramChannel {
    pub fn new(
        api_base: impl Into<String>,
        token: impl Into<String>,
        chat_id: impl Into<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| PriceWatchError::Notification(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            chat_id: chat_id.into(),
        })
    }

    /// Build from `[notify]`, reading credentials from the named env vars.
    pub fn from_config(config: &NotifyConfig) -> Result<Self> {
        let (token, chat_id) = resolve_telegram_credentials(config)?;
        Self::new(&config.telegram_api_base, token, chat_id)
    }
}

impl NotificationChannel for TelegramChannel {
    #[instrument(skip_all, fields(chat_id = %self.chat_id))]
    async fn send(&self, message: &str) -> Result<()> {
        let endpoint = format!("{}/bot{}/sendMessage", self.api_base, self.token);
        let payload = serde_json::json!({
            "chat_id": self.chat_id,
            "text": message,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        // reqwest errors carry the request URL, which contains the token
        let response = self
            .client
            .post(&endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| PriceWatchError::Notification(format!("telegram request failed: {}", e.without_url())))?;

        let status = response.status();
        let body: Option<ApiResponse> = response.json().await.ok();

        match body {
            Some(ApiResponse { ok: true, .. }) if status.is_success() => {
                debug!("telegram message delivered");
                Ok(())
            }
            Some(ApiResponse { description, .. }) => Err(PriceWatchError::Notification(format!(
                "telegram rejected message (HTTP {status}): {}",
                description.unwrap_or_else(|| "no description".into())
            ))),
            None => Err(PriceWatchError::Notification(format!(
                "telegram returned HTTP {status}"
            ))),
        }
    }
}
