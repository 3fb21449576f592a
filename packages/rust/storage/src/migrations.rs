//! SQL migration definitions for the pricewatch database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: brands, items, price_observations",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Brands, created on first sighting of a target label
CREATE TABLE IF NOT EXISTS brands (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

-- Catalog items; the detail URL is the identity key
CREATE TABLE IF NOT EXISTS items (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    brand_id      INTEGER NOT NULL REFERENCES brands(id),
    display_name  TEXT NOT NULL,
    detail_url    TEXT NOT NULL UNIQUE,
    first_seen_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_items_brand_id ON items(brand_id);

-- Append-only price history
CREATE TABLE IF NOT EXISTS price_observations (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id     INTEGER NOT NULL REFERENCES items(id),
    amount      REAL NOT NULL CHECK(amount >= 0),
    observed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_price_observations_item
    ON price_observations(item_id, observed_at DESC, id DESC);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Crawl run journal",
            sql: r#"
CREATE TABLE IF NOT EXISTS crawl_runs (
    id           TEXT PRIMARY KEY,
    target_label TEXT NOT NULL,
    started_at   TEXT NOT NULL,
    finished_at  TEXT,
    stats_json   TEXT
);

CREATE INDEX IF NOT EXISTS idx_crawl_runs_target ON crawl_runs(target_label);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
