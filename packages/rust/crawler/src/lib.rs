//! Listing crawler, price parsing, and the page-source capability.
//!
//! This crate provides:
//! - [`price`]: locale-aware price text parsing
//! - [`source`]: the [`PageSource`] capability and its HTTP implementation
//! - [`engine`]: the paginating, de-duplicating [`CatalogCrawler`]

pub mod engine;
pub mod price;
pub mod source;

pub use engine::{CatalogCrawler, CrawlEnd, CrawlSession, CrawlStats};
pub use price::PriceParser;
pub use source::{HttpPageSource, PageSource};
