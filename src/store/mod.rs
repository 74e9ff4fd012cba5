//! Analytical store DAO over SQLite.
//!
//! Fact tables (snapshots, candlesticks, orderbook snapshots/events,
//! features) are append-only; duplicate deliveries are tolerated and deduped
//! on read. Dimension tables (series, events, tags) use replacement
//! semantics: latest write wins by `last_update`, with a soft-delete flag
//! instead of physical deletes.
//!
//! WAL mode keeps reads concurrent with the writers; a single connection
//! behind a parking_lot mutex handles our own locking.

mod dimensions;
mod facts;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
PRAGMA busy_timeout = 5000;

-- Append-only point-in-time pricing facts.
CREATE TABLE IF NOT EXISTS market_snapshots (
    snapshot_id TEXT NOT NULL UNIQUE,
    ticker TEXT NOT NULL,
    event_ticker TEXT,
    series_key TEXT NOT NULL,
    market_type TEXT NOT NULL,
    title TEXT NOT NULL,
    generate_date INTEGER NOT NULL,
    yes_bid INTEGER NOT NULL,
    yes_ask INTEGER NOT NULL,
    no_bid INTEGER NOT NULL,
    no_ask INTEGER NOT NULL,
    last_price INTEGER NOT NULL,
    previous_yes_bid INTEGER NOT NULL,
    previous_yes_ask INTEGER NOT NULL,
    previous_price INTEGER NOT NULL,
    volume INTEGER NOT NULL,
    volume_24h INTEGER NOT NULL,
    open_interest INTEGER NOT NULL,
    liquidity INTEGER NOT NULL,
    notional_value INTEGER NOT NULL,
    yes_bid_dollars TEXT NOT NULL,
    yes_ask_dollars TEXT NOT NULL,
    last_price_dollars TEXT NOT NULL,
    close_time INTEGER,
    expiration_time INTEGER,
    status TEXT NOT NULL,
    settlement_value INTEGER,
    result TEXT,
    rules_primary TEXT
);

CREATE INDEX IF NOT EXISTS idx_market_snapshots_ticker_ts
    ON market_snapshots(ticker, generate_date DESC);

CREATE INDEX IF NOT EXISTS idx_market_snapshots_status_ts
    ON market_snapshots(status, generate_date DESC);

-- OHLC facts keyed by (ticker, interval, period end); duplicates ignored.
CREATE TABLE IF NOT EXISTS candlesticks (
    ticker TEXT NOT NULL,
    period_interval INTEGER NOT NULL,
    end_period_ts INTEGER NOT NULL,
    yes_bid_open INTEGER NOT NULL,
    yes_bid_low INTEGER NOT NULL,
    yes_bid_high INTEGER NOT NULL,
    yes_bid_close INTEGER NOT NULL,
    yes_ask_open INTEGER NOT NULL,
    yes_ask_low INTEGER NOT NULL,
    yes_ask_high INTEGER NOT NULL,
    yes_ask_close INTEGER NOT NULL,
    price_open INTEGER,
    price_low INTEGER,
    price_high INTEGER,
    price_close INTEGER,
    volume INTEGER NOT NULL,
    open_interest INTEGER NOT NULL,
    PRIMARY KEY (ticker, period_interval, end_period_ts)
) WITHOUT ROWID;

-- Depth ladders, one row per capture; ladders stored as JSON arrays.
CREATE TABLE IF NOT EXISTS orderbook_snapshots (
    market_id TEXT NOT NULL,
    captured_at INTEGER NOT NULL,
    yes_levels TEXT NOT NULL,
    no_levels TEXT NOT NULL,
    total_liquidity_yes INTEGER NOT NULL,
    total_liquidity_no INTEGER NOT NULL,
    best_yes INTEGER,
    best_no INTEGER,
    spread INTEGER,
    PRIMARY KEY (market_id, captured_at)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS orderbook_events (
    event_id TEXT PRIMARY KEY,
    market_id TEXT NOT NULL,
    event_time INTEGER NOT NULL,
    side TEXT NOT NULL,
    price INTEGER NOT NULL,
    size INTEGER NOT NULL,
    kind TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_orderbook_events_market_ts
    ON orderbook_events(market_id, event_time DESC);

-- Computed analytics rows; append-only per (ticker, feature_time).
CREATE TABLE IF NOT EXISTS market_features (
    ticker TEXT NOT NULL,
    feature_time INTEGER NOT NULL,
    time_to_close_seconds INTEGER NOT NULL,
    time_to_expiration_seconds INTEGER NOT NULL,
    yes_bid_prob REAL NOT NULL,
    yes_ask_prob REAL NOT NULL,
    no_bid_prob REAL NOT NULL,
    no_ask_prob REAL NOT NULL,
    mid_prob REAL NOT NULL,
    bid_ask_spread REAL NOT NULL,
    volume_24h INTEGER NOT NULL,
    open_interest INTEGER NOT NULL,
    market_type TEXT NOT NULL,
    status TEXT NOT NULL,
    category TEXT NOT NULL,
    return_1h REAL NOT NULL,
    return_24h REAL NOT NULL,
    volatility_1h REAL NOT NULL,
    volatility_24h REAL NOT NULL,
    volume_1h INTEGER NOT NULL,
    notional_1h REAL NOT NULL,
    notional_24h REAL NOT NULL,
    top_book_liquidity_yes INTEGER NOT NULL,
    top_book_liquidity_no INTEGER NOT NULL,
    total_liquidity_yes INTEGER NOT NULL,
    total_liquidity_no INTEGER NOT NULL,
    orderbook_imbalance REAL NOT NULL,
    external_prob REAL,
    misprice_score REAL NOT NULL,
    PRIMARY KEY (ticker, feature_time)
) WITHOUT ROWID;

-- Dimensions: latest-wins by last_update, soft-deletable.
CREATE TABLE IF NOT EXISTS series (
    ticker TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    category TEXT NOT NULL,
    tags TEXT NOT NULL,
    frequency TEXT NOT NULL,
    metadata TEXT NOT NULL,
    last_update INTEGER NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS events (
    event_ticker TEXT PRIMARY KEY,
    series_ticker TEXT NOT NULL,
    title TEXT NOT NULL,
    category TEXT NOT NULL,
    strike_date INTEGER,
    strike_period TEXT,
    mutually_exclusive INTEGER NOT NULL DEFAULT 0,
    last_update INTEGER NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS tags_categories (
    category TEXT NOT NULL,
    tag TEXT NOT NULL,
    last_update INTEGER NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (category, tag)
) WITHOUT ROWID;

-- Watchlist of high-priority markets; admin-only writes.
CREATE TABLE IF NOT EXISTS market_high_priority (
    ticker_id TEXT PRIMARY KEY,
    priority INTEGER NOT NULL DEFAULT 0,
    enable_l1 INTEGER NOT NULL DEFAULT 1,
    enable_l2 INTEGER NOT NULL DEFAULT 1,
    enable_l3 INTEGER NOT NULL DEFAULT 1,
    fetch_candlesticks INTEGER NOT NULL DEFAULT 1,
    fetch_orderbook INTEGER NOT NULL DEFAULT 1
) WITHOUT ROWID;

-- What was enqueued, when.
CREATE TABLE IF NOT EXISTS sync_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    family TEXT NOT NULL,
    detail TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_log_family_ts
    ON sync_log(family, enqueued_at DESC);
"#;

/// Handle to the analytical store. Cheap to clone.
#[derive(Clone)]
pub struct MarketStore {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl MarketStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize store schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" && db_path != ":memory:" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!("Market store initialized at: {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Record an enqueue in the operational log.
    pub fn log_enqueue(&self, family: &str, detail: &str, now: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_log (family, detail, enqueued_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![family, detail, now],
        )?;
        Ok(())
    }

    pub fn recent_sync_log(&self, family: &str, limit: usize) -> Result<Vec<crate::models::SyncLogRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, family, detail, enqueued_at FROM sync_log
             WHERE family = ?1 ORDER BY enqueued_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![family, limit as i64], |row| {
                Ok(crate::models::SyncLogRow {
                    id: row.get(0)?,
                    family: row.get(1)?,
                    detail: row.get(2)?,
                    enqueued_at: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
