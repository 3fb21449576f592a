//! Paginating, de-duplicating listing crawler.
//!
//! [`CatalogCrawler::crawl`] returns a [`CrawlSession`] that drives a
//! [`PageSource`] lazily: records are read one listing rendering at a time and
//! handed out through [`CrawlSession::next_record`]. A session covers one
//! target from its first page and cannot be restarted.

use std::collections::{HashSet, VecDeque};

use serde::Serialize;
use tracing::{debug, info, warn};

use pricewatch_shared::{CrawlConfig, PriceWatchError, RawItemRecord, Result, Target};

use crate::price::PriceParser;
use crate::source::PageSource;

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Why a crawl session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlEnd {
    /// No pagination control left.
    Exhausted,
    /// The control was triggered but the listing did not grow in time.
    Stalled,
    /// The listing rendered zero items.
    Empty,
    /// Locating, clicking, or waiting on the control failed.
    ControlFailed,
}

impl CrawlEnd {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::Stalled => "stalled",
            Self::Empty => "empty",
            Self::ControlFailed => "control_failed",
        }
    }
}

impl std::fmt::Display for CrawlEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters for one crawl session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrawlStats {
    pub items_emitted: usize,
    pub duplicates_skipped: usize,
    pub extraction_failures: usize,
    /// Listing renderings read: the first page plus every successful "load more".
    pub pages_loaded: usize,
    pub end: Option<CrawlEnd>,
}

// ---------------------------------------------------------------------------
// CatalogCrawler
// ---------------------------------------------------------------------------

/// Walks a paginated listing and extracts raw item records.
#[derive(Debug, Clone)]
pub struct CatalogCrawler {
    config: CrawlConfig,
    parser: PriceParser,
}

impl CatalogCrawler {
    pub fn new(config: CrawlConfig) -> Self {
        let parser = PriceParser::new(config.currency_marker.clone());
        Self { config, parser }
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    /// The parser matching this crawler's currency marker.
    pub fn parser(&self) -> &PriceParser {
        &self.parser
    }

    /// Start a fresh crawl of `target` on `source`. Nothing is fetched until
    /// the first call to [`CrawlSession::next_record`].
    pub fn crawl<'a, P: PageSource>(
        &'a self,
        source: &'a mut P,
        target: &'a Target,
    ) -> CrawlSession<'a, P> {
        CrawlSession {
            crawler: self,
            source,
            target,
            phase: Phase::NotStarted,
            seen: HashSet::new(),
            pending: VecDeque::new(),
            rendered: 0,
            stats: CrawlStats::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// CrawlSession
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    ReadItems,
    Paginate,
    Done,
}

/// One in-progress crawl of one target.
pub struct CrawlSession<'a, P: PageSource> {
    crawler: &'a CatalogCrawler,
    source: &'a mut P,
    target: &'a Target,
    phase: Phase,
    seen: HashSet<String>,
    pending: VecDeque<RawItemRecord>,
    /// Item elements rendered at the last read.
    rendered: usize,
    stats: CrawlStats,
}

enum Extracted {
    Record(RawItemRecord),
    Duplicate,
}

impl<P: PageSource> CrawlSession<'_, P> {
    /// The next record, or `None` once the listing is finished.
    ///
    /// Errors are hard failures (navigation or listing read). After an error
    /// the session is finished.
    pub async fn next_record(&mut self) -> Result<Option<RawItemRecord>> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                self.stats.items_emitted += 1;
                return Ok(Some(record));
            }

            let step = match self.phase {
                Phase::NotStarted => self.open().await,
                Phase::ReadItems => self.read_items().await,
                Phase::Paginate => {
                    self.paginate().await;
                    Ok(())
                }
                Phase::Done => return Ok(None),
            };

            if let Err(e) = step {
                self.phase = Phase::Done;
                return Err(e);
            }
        }
    }

    pub fn stats(&self) -> &CrawlStats {
        &self.stats
    }

    pub fn into_stats(self) -> CrawlStats {
        self.stats
    }

    async fn open(&mut self) -> Result<()> {
        info!(label = %self.target.label, url = %self.target.url, "crawl started");
        self.source.navigate(&self.target.url).await?;

        let settle = self.crawler.config.settle_delay;
        if !settle.is_zero() {
            debug!(delay_ms = settle.as_millis() as u64, "waiting for the listing to settle");
            tokio::time::sleep(settle).await;
        }

        self.stats.pages_loaded = 1;
        self.phase = Phase::ReadItems;
        Ok(())
    }

    async fn read_items(&mut self) -> Result<()> {
        let handles = self
            .source
            .find_all(&self.crawler.config.item_selector)
            .await?;

        if handles.is_empty() {
            warn!(label = %self.target.label, "listing rendered zero items");
            match self.source.snapshot(&self.target.label).await {
                Ok(Some(path)) => info!(path = %path.display(), "diagnostic snapshot written"),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "diagnostic snapshot failed"),
            }
            self.finish(CrawlEnd::Empty);
            return Ok(());
        }

        let mut found = 0;
        for (index, handle) in handles.iter().enumerate() {
            let fresh = index >= self.rendered;
            match self.extract(handle).await {
                Ok(Extracted::Record(record)) => {
                    self.seen.insert(record.detail_url.clone());
                    self.pending.push_back(record);
                    found += 1;
                }
                Ok(Extracted::Duplicate) => {
                    if fresh {
                        self.stats.duplicates_skipped += 1;
                    }
                }
                Err(e) => {
                    if fresh {
                        debug!(index, error = %e, "skipping unreadable item element");
                        self.stats.extraction_failures += 1;
                    }
                }
            }
        }
        self.rendered = handles.len();

        info!(
            label = %self.target.label,
            rendered = handles.len(),
            new_items = found,
            total_items = self.seen.len(),
            "listing read"
        );
        self.phase = Phase::Paginate;
        Ok(())
    }

    async fn extract(&mut self, handle: &P::Handle) -> Result<Extracted> {
        let detail_url = self.source.element_link_href(handle).await?;
        if self.seen.contains(&detail_url) {
            return Ok(Extracted::Duplicate);
        }

        let text = self.source.element_text(handle).await?;
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        let Some(name) = lines.first() else {
            return Err(PriceWatchError::source("item element has no visible name"));
        };

        let crawler = self.crawler;
        let parser = &crawler.parser;
        let raw_price_text = parser
            .find_price_line(&lines)
            .map(str::to_string)
            .unwrap_or_else(|| format!("0,00{}", parser.currency_marker()));

        Ok(Extracted::Record(RawItemRecord {
            brand_label: self.target.label.clone(),
            display_name: (*name).to_string(),
            detail_url,
            raw_price_text,
        }))
    }

    /// Trigger "load more" and wait for the listing to grow. Never fails: every
    /// problem here ends the crawl for this target.
    async fn paginate(&mut self) {
        let crawler = self.crawler;
        let config = &crawler.config;
        if !config.page_delay.is_zero() {
            tokio::time::sleep(config.page_delay).await;
        }

        let control = match self.source.find_control(&config.load_more_label).await {
            Ok(Some(control)) => control,
            Ok(None) => {
                debug!(label = %self.target.label, "no load-more control");
                self.finish(CrawlEnd::Exhausted);
                return;
            }
            Err(e) => {
                warn!(label = %self.target.label, error = %e, "load-more lookup failed");
                self.finish(CrawlEnd::ControlFailed);
                return;
            }
        };

        if let Err(e) = self.source.click(&control).await {
            warn!(label = %self.target.label, error = %e, "load-more click failed");
            self.finish(CrawlEnd::ControlFailed);
            return;
        }

        let before = self.rendered;
        let grew = self
            .source
            .wait_until(
                &config.item_selector,
                &move |count| count > before,
                config.growth_timeout,
            )
            .await;

        match grew {
            Ok(true) => {
                self.stats.pages_loaded += 1;
                self.phase = Phase::ReadItems;
            }
            Ok(false) => {
                info!(label = %self.target.label, before, "listing stopped growing");
                self.finish(CrawlEnd::Stalled);
            }
            Err(e) => {
                warn!(label = %self.target.label, error = %e, "waiting for listing growth failed");
                self.finish(CrawlEnd::ControlFailed);
            }
        }
    }

    fn finish(&mut self, end: CrawlEnd) {
        self.stats.end = Some(end);
        self.phase = Phase::Done;
        info!(
            label = %self.target.label,
            end = %end,
            items = self.seen.len(),
            pages = self.stats.pages_loaded,
            "crawl finished"
        );
    }
}
