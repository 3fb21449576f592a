//! Statistical price anomaly detection.
//!
//! The current price is compared against the item's whole history with a
//! z-score (sample standard deviation). Notification is decided by the two
//! most recent observations only; the classification rides along as context.

use tracing::debug;

use pricewatch_shared::{DetectionConfig, Result, TrackedItem};
use pricewatch_storage::PriceStore;

/// Standard deviations below this are treated as zero.
const STDEV_EPSILON: f64 = 1e-9;

/// Where the current price sits relative to the item's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Fewer than three observations; no z-score.
    InsufficientHistory,
    /// Every observation is the same price.
    Stable,
    StrongBuy,
    GoodDeal,
    FairValue,
    Overpriced,
}

impl Classification {
    /// Classify a z-score: `z < -t` strong buy, `-t <= z < 0` good deal,
    /// `0 <= z <= t` fair value, `z > t` overpriced.
    pub fn from_z(z: f64, threshold: f64) -> Self {
        if z < -threshold {
            Self::StrongBuy
        } else if z < 0.0 {
            Self::GoodDeal
        } else if z <= threshold {
            Self::FairValue
        } else {
            Self::Overpriced
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::InsufficientHistory => "Insufficient history",
            Self::Stable => "Stable price",
            Self::StrongBuy => "Strong buy (deep discount)",
            Self::GoodDeal => "Good deal",
            Self::FairValue => "Fair market value",
            Self::Overpriced => "Overpriced (wait)",
        }
    }
}

/// Classification plus the z-score it came from, when one exists.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Insight {
    pub classification: Classification,
    pub z_score: Option<f64>,
}

/// Classify `history` (newest first). `history[0]` is the current price.
pub fn classify(history: &[f64], threshold: f64) -> Insight {
    let n = history.len();
    if n < 3 {
        return Insight {
            classification: Classification::InsufficientHistory,
            z_score: None,
        };
    }

    let mean = history.iter().sum::<f64>() / n as f64;
    let variance = history.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    let stdev = variance.sqrt();

    if stdev < STDEV_EPSILON {
        return Insight {
            classification: Classification::Stable,
            z_score: Some(0.0),
        };
    }

    let z = (history[0] - mean) / stdev;
    Insight {
        classification: Classification::from_z(z, threshold),
        z_score: Some(z),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Down,
    Up,
}

/// A change between the two most recent observations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceMovement {
    pub current: f64,
    pub previous: f64,
    /// `|current - previous| / previous * 100`; `None` when `previous` is zero.
    pub percent_change: Option<f64>,
    pub direction: Direction,
    pub insight: Insight,
}

/// Outcome of evaluating one item.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Fewer than two observations; nothing to compare.
    Skip,
    /// Comparable but the price did not change.
    Quiet(Insight),
    Notify(PriceMovement),
}

impl Decision {
    pub fn should_notify(&self) -> bool {
        matches!(self, Self::Notify(_))
    }
}

/// Decides, per item, whether a price change is worth a notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnomalyDetector {
    config: DetectionConfig,
}

impl AnomalyDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    /// Evaluate a newest-first price history.
    pub fn evaluate(&self, history: &[f64]) -> Decision {
        let [current, previous, ..] = *history else {
            return Decision::Skip;
        };

        let insight = classify(history, self.config.z_threshold);
        if current == previous {
            return Decision::Quiet(insight);
        }

        let percent_change =
            (previous != 0.0).then(|| ((current - previous) / previous).abs() * 100.0);
        let direction = if current < previous {
            Direction::Down
        } else {
            Direction::Up
        };

        Decision::Notify(PriceMovement {
            current,
            previous,
            percent_change,
            direction,
            insight,
        })
    }

    /// Load the item's history from `store` and evaluate it.
    pub async fn evaluate_item<S: PriceStore>(&self, store: &S, item: &TrackedItem) -> Result<Decision> {
        let history = store.price_history(item.item_id).await?;
        let decision = self.evaluate(&history);
        debug!(
            item_id = item.item_id,
            observations = history.len(),
            notify = decision.should_notify(),
            "item evaluated"
        );
        Ok(decision)
    }
}
