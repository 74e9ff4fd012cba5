//! Core domain entities for the market data pipeline.
//!
//! Prices are integer cents in [0, 100]. The formatted dollar strings stored
//! alongside them are always re-derived from the cents at ingest so the two
//! representations cannot drift.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a market as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Unopened,
    Open,
    Paused,
    Closed,
    Finalized,
    Settled,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Unopened => "unopened",
            MarketStatus::Open => "open",
            MarketStatus::Paused => "paused",
            MarketStatus::Closed => "closed",
            MarketStatus::Finalized => "finalized",
            MarketStatus::Settled => "settled",
        }
    }

    pub fn parse(s: &str) -> MarketStatus {
        match s.to_ascii_lowercase().as_str() {
            "unopened" => MarketStatus::Unopened,
            "paused" => MarketStatus::Paused,
            "closed" => MarketStatus::Closed,
            "finalized" => MarketStatus::Finalized,
            "settled" => MarketStatus::Settled,
            _ => MarketStatus::Open,
        }
    }

    /// Settled-enough for the cleanup scan.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MarketStatus::Closed | MarketStatus::Finalized | MarketStatus::Settled
        )
    }
}

/// Format integer cents as a dollar string, e.g. 45 -> "$0.45".
pub fn cents_to_dollars(cents: i64) -> String {
    format!("${}.{:02}", cents / 100, (cents % 100).abs())
}

/// Immutable point-in-time pricing state of one market.
///
/// Append-only; keyed by `(ticker, generate_date)` with a globally unique
/// `snapshot_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub snapshot_id: String,
    pub ticker: String,
    pub event_ticker: Option<String>,
    /// `event_ticker` when present, else the market's own ticker.
    pub series_key: String,
    pub market_type: String,
    pub title: String,
    /// Capture time, epoch seconds.
    pub generate_date: i64,

    pub yes_bid: i64,
    pub yes_ask: i64,
    pub no_bid: i64,
    pub no_ask: i64,
    pub last_price: i64,
    pub previous_yes_bid: i64,
    pub previous_yes_ask: i64,
    pub previous_price: i64,

    pub volume: i64,
    pub volume_24h: i64,
    pub open_interest: i64,
    pub liquidity: i64,
    pub notional_value: i64,

    pub close_time: Option<i64>,
    pub expiration_time: Option<i64>,
    pub status: MarketStatus,
    /// Null until the market settles.
    pub settlement_value: Option<i64>,
    pub result: Option<String>,
    pub rules_primary: Option<String>,
}

impl MarketSnapshot {
    /// Ingest-time invariant: `yes_bid <= yes_ask` and every price in [0, 100].
    pub fn validate(&self) -> Result<(), String> {
        if self.yes_bid > self.yes_ask {
            return Err(format!(
                "{}: yes_bid {} > yes_ask {}",
                self.ticker, self.yes_bid, self.yes_ask
            ));
        }
        for (name, v) in [
            ("yes_bid", self.yes_bid),
            ("yes_ask", self.yes_ask),
            ("no_bid", self.no_bid),
            ("no_ask", self.no_ask),
            ("last_price", self.last_price),
        ] {
            if !(0..=100).contains(&v) {
                return Err(format!("{}: {} {} outside [0, 100]", self.ticker, name, v));
            }
        }
        Ok(())
    }

    pub fn yes_bid_dollars(&self) -> String {
        cents_to_dollars(self.yes_bid)
    }

    pub fn yes_ask_dollars(&self) -> String {
        cents_to_dollars(self.yes_ask)
    }

    pub fn last_price_dollars(&self) -> String {
        cents_to_dollars(self.last_price)
    }
}

/// OHLC aggregate over one interval for one market.
///
/// Keyed by `(ticker, period_interval, end_period_ts)`. The last-trade family
/// is nullable for intervals with no prints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candlestick {
    pub ticker: String,
    /// Interval width in minutes (1440 for daily).
    pub period_interval: i64,
    /// Period boundary, epoch seconds.
    pub end_period_ts: i64,

    pub yes_bid_open: i64,
    pub yes_bid_low: i64,
    pub yes_bid_high: i64,
    pub yes_bid_close: i64,

    pub yes_ask_open: i64,
    pub yes_ask_low: i64,
    pub yes_ask_high: i64,
    pub yes_ask_close: i64,

    pub price_open: Option<i64>,
    pub price_low: Option<i64>,
    pub price_high: Option<i64>,
    pub price_close: Option<i64>,

    pub volume: i64,
    pub open_interest: i64,
}

impl Candlestick {
    /// `low <= open, close <= high` for every populated OHLC family.
    pub fn validate(&self) -> Result<(), String> {
        let check = |name: &str, o: i64, l: i64, h: i64, c: i64| -> Result<(), String> {
            if l <= o && o <= h && l <= c && c <= h {
                Ok(())
            } else {
                Err(format!(
                    "{} {} ohlc out of order: o={} l={} h={} c={}",
                    self.ticker, name, o, l, h, c
                ))
            }
        };
        check(
            "yes_bid",
            self.yes_bid_open,
            self.yes_bid_low,
            self.yes_bid_high,
            self.yes_bid_close,
        )?;
        check(
            "yes_ask",
            self.yes_ask_open,
            self.yes_ask_low,
            self.yes_ask_high,
            self.yes_ask_close,
        )?;
        if let (Some(o), Some(l), Some(h), Some(c)) = (
            self.price_open,
            self.price_low,
            self.price_high,
            self.price_close,
        ) {
            check("price", o, l, h, c)?;
        }
        Ok(())
    }

    /// Chart projection: last-trade close when the interval printed, else the
    /// YES-bid close.
    pub fn chart_close(&self) -> i64 {
        self.price_close.unwrap_or(self.yes_bid_close)
    }
}

/// Thematic group of markets. Dimension row, latest-wins by `last_update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub ticker: String,
    pub title: String,
    pub category: String,
    /// Unordered, deduped.
    pub tags: Vec<String>,
    pub frequency: String,
    pub metadata: serde_json::Value,
    pub last_update: i64,
    pub deleted: bool,
}

/// A specific occurrence under a series. Dimension row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_ticker: String,
    pub series_ticker: String,
    pub title: String,
    pub category: String,
    pub strike_date: Option<i64>,
    pub strike_period: Option<String>,
    pub mutually_exclusive: bool,
    pub last_update: i64,
    pub deleted: bool,
}

/// One (category, tag) pair from the tags-by-categories sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagsCategoryRow {
    pub category: String,
    pub tag: String,
    pub last_update: i64,
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BookSide {
    Yes,
    No,
}

impl BookSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookSide::Yes => "YES",
            BookSide::No => "NO",
        }
    }
}

/// One price level of a depth ladder: integer-cent price, contract count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: i64,
    pub size: i64,
}

/// Full depth ladder for one market at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookSnapshot {
    pub market_id: String,
    pub captured_at: i64,
    pub yes_levels: Vec<BookLevel>,
    pub no_levels: Vec<BookLevel>,
    pub total_liquidity_yes: i64,
    pub total_liquidity_no: i64,
    pub best_yes: Option<i64>,
    pub best_no: Option<i64>,
    pub spread: Option<i64>,
}

impl OrderbookSnapshot {
    /// Build a snapshot from raw ladders, computing the per-side totals and
    /// best-of-book. Best bid is the highest-priced resting level per side.
    pub fn from_ladders(
        market_id: &str,
        captured_at: i64,
        yes_levels: Vec<BookLevel>,
        no_levels: Vec<BookLevel>,
    ) -> Self {
        let total_yes: i64 = yes_levels.iter().map(|l| l.size).sum();
        let total_no: i64 = no_levels.iter().map(|l| l.size).sum();
        let best_yes = yes_levels.iter().map(|l| l.price).max();
        let best_no = no_levels.iter().map(|l| l.price).max();
        // A NO bid at price p is a YES offer at 100 - p.
        let spread = match (best_yes, best_no) {
            (Some(y), Some(n)) => Some((100 - n) - y),
            _ => None,
        };
        Self {
            market_id: market_id.to_string(),
            captured_at,
            yes_levels,
            no_levels,
            total_liquidity_yes: total_yes,
            total_liquidity_no: total_no,
            best_yes,
            best_no,
            spread,
        }
    }

    /// Size resting at the best price level for a side, 0 when empty.
    pub fn top_of_book_size(&self, side: BookSide) -> i64 {
        let (levels, best) = match side {
            BookSide::Yes => (&self.yes_levels, self.best_yes),
            BookSide::No => (&self.no_levels, self.best_no),
        };
        let Some(best) = best else { return 0 };
        levels
            .iter()
            .find(|l| l.price == best)
            .map(|l| l.size)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BookEventType {
    Add,
    Update,
    Remove,
}

impl BookEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookEventType::Add => "ADD",
            BookEventType::Update => "UPDATE",
            BookEventType::Remove => "REMOVE",
        }
    }
}

/// Diff between two consecutive book snapshots of the same market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookEvent {
    pub event_id: String,
    pub market_id: String,
    pub event_time: i64,
    pub side: BookSide,
    pub price: i64,
    /// New size at the level; 0 for REMOVE.
    pub size: i64,
    pub kind: BookEventType,
}

impl OrderbookEvent {
    pub fn new(
        market_id: &str,
        event_time: i64,
        side: BookSide,
        price: i64,
        size: i64,
        kind: BookEventType,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            market_id: market_id.to_string(),
            event_time,
            side,
            price,
            size,
            kind,
        }
    }
}

/// Watchlist entry controlling enhanced collection for one market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighPriorityMarket {
    pub ticker_id: String,
    pub priority: i64,
    pub enable_l1: bool,
    pub enable_l2: bool,
    pub enable_l3: bool,
    pub fetch_candlesticks: bool,
    pub fetch_orderbook: bool,
}

/// One computed analytics row for one market at one instant.
///
/// Missing inputs produce zeroed fields rather than a missing row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketFeature {
    pub ticker: String,
    pub feature_time: i64,

    // L1 - point-in-time
    pub time_to_close_seconds: i64,
    pub time_to_expiration_seconds: i64,
    pub yes_bid_prob: f64,
    pub yes_ask_prob: f64,
    pub no_bid_prob: f64,
    pub no_ask_prob: f64,
    pub mid_prob: f64,
    pub bid_ask_spread: f64,
    pub volume_24h: i64,
    pub open_interest: i64,
    pub market_type: String,
    pub status: String,
    pub category: String,

    // L2 - historical window
    pub return_1h: f64,
    pub return_24h: f64,
    pub volatility_1h: f64,
    pub volatility_24h: f64,
    pub volume_1h: i64,
    pub notional_1h: f64,
    pub notional_24h: f64,

    // L3 - orderbook derived
    pub top_book_liquidity_yes: i64,
    pub top_book_liquidity_no: i64,
    pub total_liquidity_yes: i64,
    pub total_liquidity_no: i64,
    /// (Y - N) / (Y + N); 0 when total liquidity is zero.
    pub orderbook_imbalance: f64,

    pub external_prob: Option<f64>,
    pub misprice_score: f64,
}

/// Operational record of an enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogRow {
    pub id: i64,
    pub family: String,
    pub detail: String,
    pub enqueued_at: i64,
}

pub fn epoch_to_rfc3339(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt: DateTime<Utc>| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn snapshot_validation_rejects_crossed_book() {
        let mut snap = sample_snapshot();
        snap.yes_bid = 60;
        snap.yes_ask = 55;
        assert!(snap.validate().is_err());
    }

    #[test]
    fn snapshot_validation_rejects_out_of_range_price() {
        let mut snap = sample_snapshot();
        snap.no_ask = 101;
        assert!(snap.validate().is_err());
    }

    #[test]
    fn dollars_derived_from_cents() {
        assert_eq!(cents_to_dollars(45), "$0.45");
        assert_eq!(cents_to_dollars(100), "$1.00");
        assert_eq!(cents_to_dollars(7), "$0.07");
    }

    #[test]
    fn candle_ohlc_ordering_enforced() {
        let mut candle = sample_candle();
        candle.yes_bid_low = 50;
        candle.yes_bid_open = 45;
        assert!(candle.validate().is_err());
    }

    #[test]
    fn chart_close_prefers_trade_price() {
        let mut candle = sample_candle();
        candle.price_close = Some(48);
        assert_eq!(candle.chart_close(), 48);
        candle.price_close = None;
        assert_eq!(candle.chart_close(), candle.yes_bid_close);
    }

    #[test]
    fn top_of_book_size_reads_best_level() {
        let snap = OrderbookSnapshot::from_ladders(
            "MKT-A",
            1_700_000_000,
            vec![
                BookLevel { price: 40, size: 10 },
                BookLevel { price: 41, size: 5 },
            ],
            vec![BookLevel { price: 55, size: 7 }],
        );
        assert_eq!(snap.best_yes, Some(41));
        assert_eq!(snap.top_of_book_size(BookSide::Yes), 5);
        assert_eq!(snap.top_of_book_size(BookSide::No), 7);
        assert_eq!(snap.total_liquidity_yes, 15);
        // YES 41 bid vs NO 55 bid -> implied YES ask 45, spread 4.
        assert_eq!(snap.spread, Some(4));
    }

    pub(crate) fn sample_snapshot() -> MarketSnapshot {
        MarketSnapshot {
            snapshot_id: "s-1".into(),
            ticker: "MKT-A".into(),
            event_ticker: Some("EVT-A".into()),
            series_key: "EVT-A".into(),
            market_type: "binary".into(),
            title: "Sample market".into(),
            generate_date: 1_700_000_000,
            yes_bid: 45,
            yes_ask: 47,
            no_bid: 53,
            no_ask: 55,
            last_price: 46,
            previous_yes_bid: 44,
            previous_yes_ask: 46,
            previous_price: 45,
            volume: 5_000,
            volume_24h: 1_000,
            open_interest: 200,
            liquidity: 10_000,
            notional_value: 100,
            close_time: Some(1_700_003_600),
            expiration_time: Some(1_700_007_200),
            status: MarketStatus::Open,
            settlement_value: None,
            result: None,
            rules_primary: None,
        }
    }

    pub(crate) fn sample_candle() -> Candlestick {
        Candlestick {
            ticker: "MKT-A".into(),
            period_interval: 1440,
            end_period_ts: 1_700_000_000,
            yes_bid_open: 44,
            yes_bid_low: 43,
            yes_bid_high: 46,
            yes_bid_close: 45,
            yes_ask_open: 46,
            yes_ask_low: 45,
            yes_ask_high: 48,
            yes_ask_close: 47,
            price_open: None,
            price_low: None,
            price_high: None,
            price_close: None,
            volume: 120,
            open_interest: 300,
        }
    }
}
