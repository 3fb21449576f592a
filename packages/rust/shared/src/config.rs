//! Application configuration for pricewatch.
//!
//! User config lives at `~/.pricewatch/pricewatch.toml` unless a path is given
//! explicitly. The file is read once at process start; runtime configs
//! ([`CrawlConfig`], [`DetectionConfig`]) are derived from it and handed to each
//! component at construction.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PriceWatchError, Result};
use crate::types::Target;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "pricewatch.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".pricewatch";

/// Default database file name inside the config directory.
const DATABASE_FILE_NAME: &str = "pricewatch.db";

// ---------------------------------------------------------------------------
// Config structs (matching pricewatch.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Database location.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Listing crawl behaviour.
    #[serde(default)]
    pub crawl: CrawlSettings,

    /// Anomaly detection thresholds.
    #[serde(default)]
    pub detection: DetectionSettings,

    /// Outbound notification channel.
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Periodic run schedule.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Catalog listings to crawl, in order.
    #[serde(default = "default_targets")]
    pub targets: Vec<Target>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            crawl: CrawlSettings::default(),
            detection: DetectionSettings::default(),
            notify: NotifyConfig::default(),
            schedule: ScheduleConfig::default(),
            targets: default_targets(),
        }
    }
}

fn default_targets() -> Vec<Target> {
    vec![
        Target {
            label: "Longines".into(),
            url: "https://www.konyalisaat.com.tr/isvicre-mekanizma/longines".into(),
        },
        Target {
            label: "Frederique Constant".into(),
            url: "https://www.konyalisaat.com.tr/isvicre-mekanizma/frederique-constant".into(),
        },
    ]
}

impl AppConfig {
    /// Resolve the database path: the configured one, or `~/.pricewatch/pricewatch.db`.
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database.path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(config_dir()?.join(DATABASE_FILE_NAME)),
        }
    }
}

/// `[database]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the local libSQL database file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// `[crawl]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSettings {
    /// CSS selector matching one listed item.
    #[serde(default = "default_item_selector")]
    pub item_selector: String,

    /// Visible text of the "load more" pagination control.
    #[serde(default = "default_load_more_label")]
    pub load_more_label: String,

    /// Currency marker trailing every rendered price.
    #[serde(default = "default_currency_marker")]
    pub currency_marker: String,

    /// Fixed wait after navigation before reading the listing.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Pause before each pagination attempt.
    #[serde(default = "default_page_delay")]
    pub page_delay_ms: u64,

    /// Upper bound on waiting for the item count to grow after "load more".
    #[serde(default = "default_growth_timeout")]
    pub growth_timeout_ms: u64,

    /// How often the rendered item count is re-checked while waiting.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// User-Agent header sent with listing requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Directory for diagnostic snapshots of empty listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_dir: Option<String>,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            item_selector: default_item_selector(),
            load_more_label: default_load_more_label(),
            currency_marker: default_currency_marker(),
            settle_delay_ms: default_settle_delay(),
            page_delay_ms: default_page_delay(),
            growth_timeout_ms: default_growth_timeout(),
            poll_interval_ms: default_poll_interval(),
            request_timeout_secs: default_request_timeout(),
            user_agent: default_user_agent(),
            snapshot_dir: None,
        }
    }
}

fn default_item_selector() -> String {
    "li[data-productid]".into()
}
fn default_load_more_label() -> String {
    "Daha Fazla".into()
}
fn default_currency_marker() -> String {
    "TL".into()
}
fn default_settle_delay() -> u64 {
    10_000
}
fn default_page_delay() -> u64 {
    2_000
}
fn default_growth_timeout() -> u64 {
    15_000
}
fn default_poll_interval() -> u64 {
    250
}
fn default_request_timeout() -> u64 {
    30
}
fn default_user_agent() -> String {
    concat!("pricewatch/", env!("CARGO_PKG_VERSION")).into()
}

/// `[detection]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionSettings {
    /// Absolute z-score beyond which a price is a strong buy / overpriced.
    #[serde(default = "default_z_threshold")]
    pub z_threshold: f64,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            z_threshold: default_z_threshold(),
        }
    }
}

fn default_z_threshold() -> f64 {
    1.2
}

/// Which channel delivers notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyChannelKind {
    /// Telegram bot `sendMessage`.
    Telegram,
    /// Structured log record only.
    #[default]
    Log,
}

/// `[notify]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub channel: NotifyChannelKind,

    /// Name of the env var holding the bot token (never store the token itself).
    #[serde(default = "default_token_env")]
    pub telegram_bot_token_env: String,

    /// Name of the env var holding the destination chat id.
    #[serde(default = "default_chat_id_env")]
    pub telegram_chat_id_env: String,

    /// Bot API base URL.
    #[serde(default = "default_telegram_api_base")]
    pub telegram_api_base: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            channel: NotifyChannelKind::default(),
            telegram_bot_token_env: default_token_env(),
            telegram_chat_id_env: default_chat_id_env(),
            telegram_api_base: default_telegram_api_base(),
        }
    }
}

fn default_token_env() -> String {
    "PRICEWATCH_TELEGRAM_TOKEN".into()
}
fn default_chat_id_env() -> String {
    "PRICEWATCH_TELEGRAM_CHAT_ID".into()
}
fn default_telegram_api_base() -> String {
    "https://api.telegram.org".into()
}

/// `[schedule]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds between the start of two scheduled runs.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
        }
    }
}

fn default_interval() -> u64 {
    6 * 60 * 60
}

// ---------------------------------------------------------------------------
// Runtime configs (derived once from AppConfig)
// ---------------------------------------------------------------------------

/// Runtime crawl configuration.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub item_selector: String,
    pub load_more_label: String,
    pub currency_marker: String,
    pub settle_delay: Duration,
    pub page_delay: Duration,
    pub growth_timeout: Duration,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
    pub snapshot_dir: Option<PathBuf>,
}

impl From<&AppConfig> for CrawlConfig {
    fn from(config: &AppConfig) -> Self {
        let crawl = &config.crawl;
        Self {
            item_selector: crawl.item_selector.clone(),
            load_more_label: crawl.load_more_label.clone(),
            currency_marker: crawl.currency_marker.clone(),
            settle_delay: Duration::from_millis(crawl.settle_delay_ms),
            page_delay: Duration::from_millis(crawl.page_delay_ms),
            growth_timeout: Duration::from_millis(crawl.growth_timeout_ms),
            poll_interval: Duration::from_millis(crawl.poll_interval_ms.max(1)),
            request_timeout: Duration::from_secs(crawl.request_timeout_secs),
            user_agent: crawl.user_agent.clone(),
            snapshot_dir: crawl.snapshot_dir.as_ref().map(PathBuf::from),
        }
    }
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// Runtime detection configuration.
#[derive(Debug, Clone, Copy)]
pub struct DetectionConfig {
    pub z_threshold: f64,
}

impl From<&AppConfig> for DetectionConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            z_threshold: config.detection.z_threshold,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            z_threshold: default_z_threshold(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.pricewatch/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PriceWatchError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.pricewatch/pricewatch.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PriceWatchError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        PriceWatchError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_detection(&config.detection)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PriceWatchError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PriceWatchError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PriceWatchError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Reject target lists the crawler cannot work with.
pub fn validate_targets(config: &AppConfig) -> Result<()> {
    if config.targets.is_empty() {
        return Err(PriceWatchError::validation("no [[targets]] configured"));
    }

    let mut labels = HashSet::new();
    for target in &config.targets {
        if target.label.trim().is_empty() {
            return Err(PriceWatchError::validation(format!(
                "target with url '{}' has an empty label",
                target.url
            )));
        }
        url::Url::parse(&target.url).map_err(|e| {
            PriceWatchError::validation(format!(
                "target '{}' has an invalid url '{}': {e}",
                target.label, target.url
            ))
        })?;
        if !labels.insert(target.label.as_str()) {
            return Err(PriceWatchError::validation(format!(
                "target label '{}' is configured twice",
                target.label
            )));
        }
    }
    Ok(())
}

/// Reject z-score thresholds that would make classification meaningless.
pub fn validate_detection(detection: &DetectionSettings) -> Result<()> {
    let threshold = detection.z_threshold;
    if !threshold.is_finite() || threshold <= 0.0 {
        return Err(PriceWatchError::validation(format!(
            "[detection] z_threshold must be a positive number, got {threshold}"
        )));
    }
    Ok(())
}

/// Read the Telegram bot token and chat id from the env vars named in the config.
pub fn resolve_telegram_credentials(config: &NotifyConfig) -> Result<(String, String)> {
    let read = |var_name: &str| match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(PriceWatchError::config(format!(
            "Telegram credentials not found. Set the {var_name} environment variable."
        ))),
    };
    let token = read(&config.telegram_bot_token_env)?;
    let chat_id = read(&config.telegram_chat_id_env)?;
    Ok((token, chat_id))
}
