//! Identity reconciliation and observation append for crawled records.

use tracing::{debug, warn};

use pricewatch_crawler::PriceParser;
use pricewatch_shared::{RawItemRecord, Result};
use pricewatch_storage::PriceStore;

/// What one `ingest` call did.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub item_id: i64,
    /// `true` when this record introduced a new item.
    pub created: bool,
    pub amount: f64,
    /// `false` when the price text could not be parsed and `0.0` was stored.
    pub price_parsed: bool,
}

/// Writes crawled records into a [`PriceStore`], one record at a time.
pub struct IngestionPipeline<'a, S: PriceStore> {
    store: &'a S,
    parser: PriceParser,
}

impl<'a, S: PriceStore> IngestionPipeline<'a, S> {
    pub fn new(store: &'a S, parser: PriceParser) -> Self {
        Self { store, parser }
    }

    /// Resolve brand and item (by URL), then append the parsed price.
    ///
    /// An item that already exists keeps its stored name even if the listing
    /// now shows a different one.
    pub async fn ingest(&self, record: &RawItemRecord) -> Result<IngestOutcome> {
        let brand_id = self.store.get_or_create_brand(&record.brand_label).await?;
        let (item_id, created) = self
            .store
            .get_or_create_item(brand_id, &record.display_name, &record.detail_url)
            .await?;

        let parsed = self.parser.parse_checked(&record.raw_price_text);
        if parsed.is_none() {
            warn!(
                url = %record.detail_url,
                raw = %record.raw_price_text,
                "unparsable price recorded as 0"
            );
        }
        let amount = parsed.unwrap_or(0.0);

        self.store.append_price_observation(item_id, amount).await?;
        debug!(item_id, created, amount, "observation appended");

        Ok(IngestOutcome {
            item_id,
            created,
            amount,
            price_parsed: parsed.is_some(),
        })
    }
}
