//! Core domain types shared between the crawler, storage, and pipeline crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one orchestrator run (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// One configured catalog listing to crawl. Static configuration, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Brand label attached to every item found on this listing.
    pub label: String,
    /// Listing page URL.
    pub url: String,
}

// ---------------------------------------------------------------------------
// RawItemRecord
// ---------------------------------------------------------------------------

/// An item as extracted from a listing, before identity reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawItemRecord {
    pub brand_label: String,
    pub display_name: String,
    /// Absolute detail URL; the identity key of the item.
    pub detail_url: String,
    /// Price text exactly as rendered (e.g. `12.500,50 TL`).
    pub raw_price_text: String,
}

// ---------------------------------------------------------------------------
// Stored views
// ---------------------------------------------------------------------------

/// A tracked item joined with its brand, as read by the detection pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedItem {
    pub item_id: i64,
    pub name: String,
    pub brand_name: String,
    pub url: String,
}

/// One row of the observation report (brand, item, price, time), newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRow {
    pub brand_name: String,
    pub item_name: String,
    pub amount: f64,
    pub observed_at: DateTime<Utc>,
}
