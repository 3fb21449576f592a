//! libSQL storage layer for brands, items, and price history.
//!
//! [`PriceStore`] is the persistence capability the pipeline is written
//! against; [`Storage`] implements it over a local libSQL database.
//!
//! **Access rules:**
//! - One ingestion process writes at a time. Get-or-create is still safe
//!   against concurrent writers because creation is an
//!   `INSERT … ON CONFLICT DO NOTHING` followed by a lookup.
//! - Price observations are append-only; the only deletion is
//!   [`PriceStore::reset_all_observations`].

mod migrations;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use pricewatch_shared::{ObservationRow, PriceWatchError, Result, TrackedItem};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// Persistence operations consumed by ingestion, detection, and orchestration.
#[allow(async_fn_in_trait)]
pub trait PriceStore {
    /// Return the id of the brand called `name`, creating it on first sighting.
    async fn get_or_create_brand(&self, name: &str) -> Result<i64>;

    /// Return `(item_id, created)` for the item identified by `url`.
    ///
    /// An existing item keeps its stored display name.
    async fn get_or_create_item(&self, brand_id: i64, name: &str, url: &str)
    -> Result<(i64, bool)>;

    /// Append one observation stamped with the current time.
    async fn append_price_observation(&self, item_id: i64, amount: f64) -> Result<()>;

    /// All items joined with their brand, in id order.
    async fn list_tracked_items(&self) -> Result<Vec<TrackedItem>>;

    /// Every observed amount for an item, newest first.
    async fn price_history(&self, item_id: i64) -> Result<Vec<f64>>;

    /// Delete the whole price history. Returns the number of rows removed.
    async fn reset_all_observations(&self) -> Result<u64>;

    /// Open a crawl-run journal entry for a target. Returns the run id.
    async fn start_crawl_run(&self, target_label: &str) -> Result<String>;

    /// Close a crawl-run journal entry with its JSON stats.
    async fn finish_crawl_run(&self, run_id: &str, stats_json: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

/// One crawl journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlRunRow {
    pub id: String,
    pub target_label: String,
    pub started_at: String,
    /// `None` while the crawl is still running (or was interrupted).
    pub finished_at: Option<String>,
    pub stats_json: Option<String>,
}

/// Row counts per table, for status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreCounts {
    pub brands: u64,
    pub items: u64,
    pub observations: u64,
}

fn storage_err(e: impl std::fmt::Display) -> PriceWatchError {
    PriceWatchError::Storage(e.to_string())
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Storage {
    /// Open or create a database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| PriceWatchError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        PriceWatchError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    pub async fn schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    async fn brand_id(&self, name: &str) -> Result<Option<i64>> {
        let mut rows = self
            .conn
            .query("SELECT id FROM brands WHERE name = ?1", params![name])
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get::<i64>(0).map_err(storage_err)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Look up an item by its detail URL. Returns `(item_id, display_name)`.
    pub async fn item_by_url(&self, url: &str) -> Result<Option<(i64, String)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, display_name FROM items WHERE detail_url = ?1",
                params![url],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some((
                row.get::<i64>(0).map_err(storage_err)?,
                row.get::<String>(1).map_err(storage_err)?,
            ))),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// The lowest-id item, if any.
    pub async fn first_item(&self) -> Result<Option<(i64, String)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, display_name FROM items ORDER BY id LIMIT 1",
                params![],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some((
                row.get::<i64>(0).map_err(storage_err)?,
                row.get::<String>(1).map_err(storage_err)?,
            ))),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Row counts for brands, items, and observations.
    pub async fn counts(&self) -> Result<StoreCounts> {
        let mut rows = self
            .conn
            .query(
                "SELECT
                   (SELECT COUNT(*) FROM brands),
                   (SELECT COUNT(*) FROM items),
                   (SELECT COUNT(*) FROM price_observations)",
                params![],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(StoreCounts {
                brands: row.get::<i64>(0).map_err(storage_err)? as u64,
                items: row.get::<i64>(1).map_err(storage_err)? as u64,
                observations: row.get::<i64>(2).map_err(storage_err)? as u64,
            }),
            Ok(None) => Ok(StoreCounts::default()),
            Err(e) => Err(storage_err(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Administrative operations
    // -----------------------------------------------------------------------

    /// Append an observation with an explicit timestamp (backfills and drills).
    pub async fn append_price_observation_at(
        &self,
        item_id: i64,
        amount: f64,
        observed_at: DateTime<Utc>,
    ) -> Result<()> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(PriceWatchError::validation(format!(
                "price amount must be a non-negative number, got {amount}"
            )));
        }
        self.conn
            .execute(
                "INSERT INTO price_observations (item_id, amount, observed_at)
                 VALUES (?1, ?2, ?3)",
                params![item_id, amount, timestamp(observed_at)],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Every observation joined with item and brand, newest first.
    pub async fn observation_report(&self, limit: Option<u32>) -> Result<Vec<ObservationRow>> {
        let limit = limit.map(i64::from).unwrap_or(-1);
        let mut rows = self
            .conn
            .query(
                "SELECT b.name, i.display_name, o.amount, o.observed_at
                 FROM price_observations o
                 JOIN items i ON o.item_id = i.id
                 JOIN brands b ON i.brand_id = b.id
                 ORDER BY o.observed_at DESC, o.id DESC
                 LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let observed_at: String = row.get(3).map_err(storage_err)?;
            results.push(ObservationRow {
                brand_name: row.get::<String>(0).map_err(storage_err)?,
                item_name: row.get::<String>(1).map_err(storage_err)?,
                amount: row.get::<f64>(2).map_err(storage_err)?,
                observed_at: DateTime::parse_from_rfc3339(&observed_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| PriceWatchError::Storage(format!("invalid date: {e}")))?,
            });
        }
        Ok(results)
    }

    /// Most recent journal entry for `target_label`.
    pub async fn last_crawl_run(&self, target_label: &str) -> Result<Option<CrawlRunRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, target_label, started_at, finished_at, stats_json
                 FROM crawl_runs WHERE target_label = ?1
                 ORDER BY started_at DESC, id DESC LIMIT 1",
                params![target_label],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(CrawlRunRow {
                id: row.get::<String>(0).map_err(storage_err)?,
                target_label: row.get::<String>(1).map_err(storage_err)?,
                started_at: row.get::<String>(2).map_err(storage_err)?,
                finished_at: row.get::<Option<String>>(3).map_err(storage_err)?,
                stats_json: row.get::<Option<String>>(4).map_err(storage_err)?,
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Stats JSON recorded for a crawl run, if it has finished.
    pub async fn crawl_run_stats(&self, run_id: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT stats_json FROM crawl_runs WHERE id = ?1",
                params![run_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<Option<String>>(0).map_err(storage_err)?),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }
}

impl PriceStore for Storage {
    async fn get_or_create_brand(&self, name: &str) -> Result<i64> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO brands (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
                params![name],
            )
            .await
            .map_err(storage_err)?;

        let id = self.brand_id(name).await?.ok_or_else(|| {
            PriceWatchError::Storage(format!("brand '{name}' missing after insert"))
        })?;

        if inserted > 0 {
            tracing::info!(brand = name, brand_id = id, "new brand");
        }
        Ok(id)
    }

    async fn get_or_create_item(
        &self,
        brand_id: i64,
        name: &str,
        url: &str,
    ) -> Result<(i64, bool)> {
        let now = timestamp(Utc::now());
        let inserted = self
            .conn
            .execute(
                "INSERT INTO items (brand_id, display_name, detail_url, first_seen_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(detail_url) DO NOTHING",
                params![brand_id, name, url, now],
            )
            .await
            .map_err(storage_err)?;

        let (id, _) = self.item_by_url(url).await?.ok_or_else(|| {
            PriceWatchError::Storage(format!("item '{url}' missing after insert"))
        })?;
        Ok((id, inserted > 0))
    }

    async fn append_price_observation(&self, item_id: i64, amount: f64) -> Result<()> {
        self.append_price_observation_at(item_id, amount, Utc::now())
            .await
    }

    async fn list_tracked_items(&self) -> Result<Vec<TrackedItem>> {
        let mut rows = self
            .conn
            .query(
                "SELECT i.id, i.display_name, b.name, i.detail_url
                 FROM items i
                 JOIN brands b ON i.brand_id = b.id
                 ORDER BY i.id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(TrackedItem {
                item_id: row.get::<i64>(0).map_err(storage_err)?,
                name: row.get::<String>(1).map_err(storage_err)?,
                brand_name: row.get::<String>(2).map_err(storage_err)?,
                url: row.get::<String>(3).map_err(storage_err)?,
            });
        }
        Ok(results)
    }

    async fn price_history(&self, item_id: i64) -> Result<Vec<f64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT amount FROM price_observations
                 WHERE item_id = ?1
                 ORDER BY observed_at DESC, id DESC",
                params![item_id],
            )
            .await
            .map_err(storage_err)?;

        let mut amounts = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            amounts.push(row.get::<f64>(0).map_err(storage_err)?);
        }
        Ok(amounts)
    }

    async fn reset_all_observations(&self) -> Result<u64> {
        let removed = self
            .conn
            .execute("DELETE FROM price_observations", params![])
            .await
            .map_err(storage_err)?;

        // Restart ids so a reset history looks like a fresh one
        self.conn
            .execute(
                "DELETE FROM sqlite_sequence WHERE name = 'price_observations'",
                params![],
            )
            .await
            .map_err(storage_err)?;

        tracing::warn!(removed, "price history reset");
        Ok(removed)
    }

    async fn start_crawl_run(&self, target_label: &str) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        self.conn
            .execute(
                "INSERT INTO crawl_runs (id, target_label, started_at) VALUES (?1, ?2, ?3)",
                params![id.as_str(), target_label, timestamp(Utc::now())],
            )
            .await
            .map_err(storage_err)?;
        Ok(id)
    }

    async fn finish_crawl_run(&self, run_id: &str, stats_json: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE crawl_runs SET finished_at = ?1, stats_json = ?2 WHERE id = ?3",
                params![timestamp(Utc::now()), stats_json, run_id],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("pw_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.schema_version().await, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("pw_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.schema_version().await, 2);
    }

    #[tokio::test]
    async fn brand_get_or_create() {
        let storage = test_storage().await;
        let first = storage.get_or_create_brand("Longines").await.unwrap();
        let again = storage.get_or_create_brand("Longines").await.unwrap();
        assert_eq!(first, again);

        // Names are case-sensitive
        let lower = storage.get_or_create_brand("longines").await.unwrap();
        assert_ne!(first, lower);
        assert_eq!(storage.counts().await.unwrap().brands, 2);
    }

    #[tokio::test]
    async fn item_identity_is_the_url() {
        let storage = test_storage().await;
        let brand = storage.get_or_create_brand("Longines").await.unwrap();
        let url = "https://shop.example.com/p/master-collection";

        let (id, created) = storage
            .get_or_create_item(brand, "Master Collection", url)
            .await
            .unwrap();
        assert!(created);

        let (again, created) = storage
            .get_or_create_item(brand, "Master Collection 40mm", url)
            .await
            .unwrap();
        assert_eq!(id, again);
        assert!(!created);

        let (_, name) = storage.item_by_url(url).await.unwrap().unwrap();
        assert_eq!(name, "Master Collection");
        assert_eq!(storage.counts().await.unwrap().items, 1);
    }

    #[tokio::test]
    async fn history_is_newest_first() {
        let storage = test_storage().await;
        let brand = storage.get_or_create_brand("Tissot").await.unwrap();
        let (item, _) = storage
            .get_or_create_item(brand, "PRX", "https://shop.example.com/p/prx")
            .await
            .unwrap();

        for amount in [100.0, 110.0, 95.5] {
            storage.append_price_observation(item, amount).await.unwrap();
        }

        let history = storage.price_history(item).await.unwrap();
        assert_eq!(history, vec![95.5, 110.0, 100.0]);
    }

    #[tokio::test]
    async fn backdated_observation_sorts_by_time() {
        let storage = test_storage().await;
        let brand = storage.get_or_create_brand("Tissot").await.unwrap();
        let (item, _) = storage
            .get_or_create_item(brand, "PRX", "https://shop.example.com/p/prx")
            .await
            .unwrap();

        storage.append_price_observation(item, 120.0).await.unwrap();
        storage
            .append_price_observation_at(item, 500_000.0, Utc::now() - Duration::days(1))
            .await
            .unwrap();

        let history = storage.price_history(item).await.unwrap();
        assert_eq!(history, vec![120.0, 500_000.0]);

        let negative = storage
            .append_price_observation_at(item, -1.0, Utc::now())
            .await;
        assert!(negative.is_err());
    }

    #[tokio::test]
    async fn tracked_items_join_brands() {
        let storage = test_storage().await;
        let longines = storage.get_or_create_brand("Longines").await.unwrap();
        let tissot = storage.get_or_create_brand("Tissot").await.unwrap();
        storage
            .get_or_create_item(longines, "Spirit", "https://shop.example.com/p/spirit")
            .await
            .unwrap();
        storage
            .get_or_create_item(tissot, "PRX", "https://shop.example.com/p/prx")
            .await
            .unwrap();

        let items = storage.list_tracked_items().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].brand_name, "Longines");
        assert_eq!(items[0].name, "Spirit");
        assert_eq!(items[1].brand_name, "Tissot");
        assert_eq!(items[1].url, "https://shop.example.com/p/prx");
    }

    #[tokio::test]
    async fn reset_clears_history_and_restarts_ids() {
        let storage = test_storage().await;
        let brand = storage.get_or_create_brand("Tissot").await.unwrap();
        let (item, _) = storage
            .get_or_create_item(brand, "PRX", "https://shop.example.com/p/prx")
            .await
            .unwrap();
        storage.append_price_observation(item, 10.0).await.unwrap();
        storage.append_price_observation(item, 12.0).await.unwrap();

        let removed = storage.reset_all_observations().await.unwrap();
        assert_eq!(removed, 2);
        assert!(storage.price_history(item).await.unwrap().is_empty());

        // Items and brands survive a reset
        let counts = storage.counts().await.unwrap();
        assert_eq!(counts.items, 1);
        assert_eq!(counts.brands, 1);
        assert_eq!(counts.observations, 0);
    }

    #[tokio::test]
    async fn observation_report_rows() {
        let storage = test_storage().await;
        let brand = storage.get_or_create_brand("Longines").await.unwrap();
        let (item, _) = storage
            .get_or_create_item(brand, "Spirit", "https://shop.example.com/p/spirit")
            .await
            .unwrap();
        storage.append_price_observation(item, 1_000.0).await.unwrap();
        storage.append_price_observation(item, 1_250.0).await.unwrap();

        let rows = storage.observation_report(None).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].amount, 1_250.0);
        assert_eq!(rows[0].brand_name, "Longines");
        assert_eq!(rows[0].item_name, "Spirit");

        let limited = storage.observation_report(Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn crawl_run_lifecycle() {
        let storage = test_storage().await;
        let run_id = storage.start_crawl_run("Longines").await.unwrap();
        assert!(!run_id.is_empty());
        assert_eq!(storage.crawl_run_stats(&run_id).await.unwrap(), None);

        storage
            .finish_crawl_run(&run_id, r#"{"emitted": 12}"#)
            .await
            .unwrap();
        let stats = storage.crawl_run_stats(&run_id).await.unwrap().unwrap();
        assert!(stats.contains("emitted"));

        let last = storage.last_crawl_run("Longines").await.unwrap().unwrap();
        assert_eq!(last.id, run_id);
        assert!(last.finished_at.is_some());
        assert!(storage.last_crawl_run("Omega").await.unwrap().is_none());
    }
}
