//! Outbound notification channels.
//!
//! This crate provides:
//! - [`NotificationChannel`]: the send-a-message capability
//! - [`TelegramChannel`]: Telegram bot `sendMessage`
//! - [`LogChannel`]: writes the message to the log instead of delivering it
//! - [`ConfiguredChannel`]: whichever of the above `[notify]` selects

pub mod telegram;

use tracing::info;

use pricewatch_shared::{NotifyChannelKind, NotifyConfig, Result};

pub use telegram::TelegramChannel;

/// Delivers one human-readable message. Implementations do not retry.
#[allow(async_fn_in_trait)]
pub trait NotificationChannel {
    async fn send(&self, message: &str) -> Result<()>;
}

/// Channel that only records messages as structured log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogChannel;

impl NotificationChannel for LogChannel {
    async fn send(&self, message: &str) -> Result<()> {
        info!(channel = "log", %message, "notification");
        Ok(())
    }
}

/// The channel chosen by configuration.
#[derive(Debug)]
pub enum ConfiguredChannel {
    Telegram(TelegramChannel),
    Log(LogChannel),
}

impl ConfiguredChannel {
    /// Build the configured channel. Telegram credentials are read from the
    /// environment here, so a missing token fails at startup.
    pub fn from_config(config: &NotifyConfig) -> Result<Self> {
        match config.channel {
            NotifyChannelKind::Telegram => Ok(Self::Telegram(TelegramChannel::from_config(config)?)),
            NotifyChannelKind::Log => Ok(Self::Log(LogChannel)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Telegram(_) => "telegram",
            Self::Log(_) => "log",
        }
    }
}

impl NotificationChannel for ConfiguredChannel {
    async fn send(&self, message: &str) -> Result<()> {
        match self {
            Self::Telegram(channel) => channel.send(message).await,
            Self::Log(channel) => channel.send(message).await,
        }
    }
}
