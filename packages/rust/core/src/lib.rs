//! Price tracking pipeline for PriceWatch.
//!
//! This crate ties the crawler, the store, and the notification channel
//! together into the two-phase run:
//! - [`ingest`]: reconcile crawled records against stored brands and items
//! - [`detector`]: z-score classification and the notify decision
//! - [`dispatcher`]: format and send price movement messages
//! - [`orchestrator`]: crawl every target, then (only if that succeeded)
//!   evaluate every tracked item

pub mod detector;
pub mod dispatcher;
pub mod ingest;
pub mod orchestrator;

#[cfg(test)]
mod test_support;

pub use detector::{AnomalyDetector, Classification, Decision, Direction, Insight, PriceMovement};
pub use dispatcher::{NotificationDispatcher, format_amount, format_message};
pub use ingest::{IngestOutcome, IngestionPipeline};
pub use orchestrator::{
    CrawlPhaseReport, DetectionReport, ProgressReporter, RunOrchestrator, RunReport,
    SilentProgress, TargetOutcome,
};
