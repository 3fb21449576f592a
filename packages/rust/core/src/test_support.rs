//! Shared fixtures for pipeline tests.

use std::sync::Mutex;

use pricewatch_notify::NotificationChannel;
use pricewatch_shared::{PriceWatchError, Result};
use pricewatch_shared::TrackedItem;
use pricewatch_storage::{PriceStore, Storage};
use uuid::Uuid;

pub async fn temp_storage() -> Storage {
    let path = std::env::temp_dir().join(format!("pricewatch-core-{}.db", Uuid::now_v7()));
    Storage::open(&path).await.expect("open temp storage")
}

/// Channel that keeps every message it is asked to send.
#[derive(Default)]
pub struct RecordingChannel {
    pub sent: Mutex<Vec<String>>,
}

impl RecordingChannel {
    pub fn messages(&self) -> Vec<String> {
        self.sent.lock().expect("lock").clone()
    }
}

impl NotificationChannel for RecordingChannel {
    async fn send(&self, message: &str) -> Result<()> {
        self.sent.lock().expect("lock").push(message.to_string());
        Ok(())
    }
}

/// Channel whose every delivery fails.
pub struct FailingChannel;

impl NotificationChannel for FailingChannel {
    async fn send(&self, _message: &str) -> Result<()> {
        Err(PriceWatchError::Notification("channel unavailable".into()))
    }
}

/// Store that delegates to a temp [`Storage`] but fails chosen operations.
pub struct FaultyStore {
    pub inner: Storage,
    /// Item writes whose URL contains this fragment fail.
    pub fail_items_matching: Option<String>,
    /// Every `price_history` read fails.
    pub fail_history: bool,
}

impl FaultyStore {
    pub async fn new() -> Self {
        Self {
            inner: temp_storage().await,
            fail_items_matching: None,
            fail_history: false,
        }
    }
}

fn store_down() -> PriceWatchError {
    PriceWatchError::Storage("disk I/O error".into())
}

impl PriceStore for FaultyStore {
    async fn get_or_create_brand(&self, name: &str) -> Result<i64> {
        self.inner.get_or_create_brand(name).await
    }

    async fn get_or_create_item(&self, brand_id: i64, name: &str, url: &str) -> Result<(i64, bool)> {
        match &self.fail_items_matching {
            Some(fragment) if url.contains(fragment.as_str()) => Err(store_down()),
            _ => self.inner.get_or_create_item(brand_id, name, url).await,
        }
    }

    async fn append_price_observation(&self, item_id: i64, amount: f64) -> Result<()> {
        self.inner.append_price_observation(item_id, amount).await
    }

    async fn list_tracked_items(&self) -> Result<Vec<TrackedItem>> {
        self.inner.list_tracked_items().await
    }

    async fn price_history(&self, item_id: i64) -> Result<Vec<f64>> {
        if self.fail_history {
            return Err(store_down());
        }
        self.inner.price_history(item_id).await
    }

    async fn reset_all_observations(&self) -> Result<u64> {
        self.inner.reset_all_observations().await
    }

    async fn start_crawl_run(&self, target_label: &str) -> Result<String> {
        self.inner.start_crawl_run(target_label).await
    }

    async fn finish_crawl_run(&self, run_id: &str, stats_json: &str) -> Result<()> {
        self.inner.finish_crawl_run(run_id, stats_json).await
    }
}
