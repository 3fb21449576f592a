//! Shared types, error model, and configuration for pricewatch.
//!
//! This crate is the foundation depended on by all other pricewatch crates.
//! It provides:
//! - [`PriceWatchError`]: the unified error type
//! - Domain types ([`Target`], [`RawItemRecord`], [`TrackedItem`], [`RunId`])
//! - Configuration ([`AppConfig`], [`CrawlConfig`], [`DetectionConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CrawlConfig, CrawlSettings, DatabaseConfig, DetectionConfig, DetectionSettings,
    NotifyChannelKind, NotifyConfig, ScheduleConfig, config_dir, config_file_path, init_config,
    load_config, load_config_from, resolve_telegram_credentials, validate_detection,
    validate_targets,
};
pub use error::{PriceWatchError, Result};
pub use types::{ObservationRow, RawItemRecord, RunId, Target, TrackedItem};
