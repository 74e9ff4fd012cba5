//! Append paths and indexed reads for the fact tables.

use anyhow::Result;
use rusqlite::{params, Row};
use tracing::warn;

use crate::models::{
    BookEventType, BookLevel, BookSide, Candlestick, MarketFeature, MarketSnapshot, MarketStatus,
    OrderbookEvent, OrderbookSnapshot,
};

use super::MarketStore;

fn snapshot_from_row(row: &Row) -> rusqlite::Result<MarketSnapshot> {
    Ok(MarketSnapshot {
        snapshot_id: row.get("snapshot_id")?,
        ticker: row.get("ticker")?,
        event_ticker: row.get("event_ticker")?,
        series_key: row.get("series_key")?,
        market_type: row.get("market_type")?,
        title: row.get("title")?,
        generate_date: row.get("generate_date")?,
        yes_bid: row.get("yes_bid")?,
        yes_ask: row.get("yes_ask")?,
        no_bid: row.get("no_bid")?,
        no_ask: row.get("no_ask")?,
        last_price: row.get("last_price")?,
        previous_yes_bid: row.get("previous_yes_bid")?,
        previous_yes_ask: row.get("previous_yes_ask")?,
        previous_price: row.get("previous_price")?,
        volume: row.get("volume")?,
        volume_24h: row.get("volume_24h")?,
        open_interest: row.get("open_interest")?,
        liquidity: row.get("liquidity")?,
        notional_value: row.get("notional_value")?,
        close_time: row.get("close_time")?,
        expiration_time: row.get("expiration_time")?,
        status: MarketStatus::parse(&row.get::<_, String>("status")?),
        settlement_value: row.get("settlement_value")?,
        result: row.get("result")?,
        rules_primary: row.get("rules_primary")?,
    })
}

fn candle_from_row(row: &Row) -> rusqlite::Result<Candlestick> {
    Ok(Candlestick {
        ticker: row.get("ticker")?,
        period_interval: row.get("period_interval")?,
        end_period_ts: row.get("end_period_ts")?,
        yes_bid_open: row.get("yes_bid_open")?,
        yes_bid_low: row.get("yes_bid_low")?,
        yes_bid_high: row.get("yes_bid_high")?,
        yes_bid_close: row.get("yes_bid_close")?,
        yes_ask_open: row.get("yes_ask_open")?,
        yes_ask_low: row.get("yes_ask_low")?,
        yes_ask_high: row.get("yes_ask_high")?,
        yes_ask_close: row.get("yes_ask_close")?,
        price_open: row.get("price_open")?,
        price_low: row.get("price_low")?,
        price_high: row.get("price_high")?,
        price_close: row.get("price_close")?,
        volume: row.get("volume")?,
        open_interest: row.get("open_interest")?,
    })
}

const SNAPSHOT_COLS: &str = "snapshot_id, ticker, event_ticker, series_key, market_type, title, \
     generate_date, yes_bid, yes_ask, no_bid, no_ask, last_price, previous_yes_bid, \
     previous_yes_ask, previous_price, volume, volume_24h, open_interest, liquidity, \
     notional_value, close_time, expiration_time, status, settlement_value, result, rules_primary";

const CANDLE_COLS: &str = "ticker, period_interval, end_period_ts, yes_bid_open, yes_bid_low, \
     yes_bid_high, yes_bid_close, yes_ask_open, yes_ask_low, yes_ask_high, yes_ask_close, \
     price_open, price_low, price_high, price_close, volume, open_interest";

impl MarketStore {
    /// Bulk-append snapshots inside one transaction. Rows violating the price
    /// invariants are skipped with a warning; the rest land. Returns the
    /// number of rows written.
    pub fn insert_snapshots(&self, snapshots: &[MarketSnapshot]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut written = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO market_snapshots (
                    snapshot_id, ticker, event_ticker, series_key, market_type, title,
                    generate_date, yes_bid, yes_ask, no_bid, no_ask, last_price,
                    previous_yes_bid, previous_yes_ask, previous_price,
                    volume, volume_24h, open_interest, liquidity, notional_value,
                    yes_bid_dollars, yes_ask_dollars, last_price_dollars,
                    close_time, expiration_time, status, settlement_value, result, rules_primary
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25,?26,?27,?28,?29)",
            )?;
            for snap in snapshots {
                if let Err(reason) = snap.validate() {
                    warn!(reason, "rejecting snapshot with invalid prices");
                    continue;
                }
                written += stmt.execute(params![
                    snap.snapshot_id,
                    snap.ticker,
                    snap.event_ticker,
                    snap.series_key,
                    snap.market_type,
                    snap.title,
                    snap.generate_date,
                    snap.yes_bid,
                    snap.yes_ask,
                    snap.no_bid,
                    snap.no_ask,
                    snap.last_price,
                    snap.previous_yes_bid,
                    snap.previous_yes_ask,
                    snap.previous_price,
                    snap.volume,
                    snap.volume_24h,
                    snap.open_interest,
                    snap.liquidity,
                    snap.notional_value,
                    snap.yes_bid_dollars(),
                    snap.yes_ask_dollars(),
                    snap.last_price_dollars(),
                    snap.close_time,
                    snap.expiration_time,
                    snap.status.as_str(),
                    snap.settlement_value,
                    snap.result,
                    snap.rules_primary,
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Latest snapshot for a ticker. Ties on `generate_date` resolve to the
    /// most recently inserted row.
    pub fn latest_snapshot(&self, ticker: &str) -> Result<Option<MarketSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SNAPSHOT_COLS} FROM market_snapshots
             WHERE ticker = ?1 ORDER BY generate_date DESC, rowid DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query_map(params![ticker], snapshot_from_row)?;
        Ok(rows.next().transpose()?)
    }

    /// Newest snapshot at or before `ts` for a ticker.
    pub fn snapshot_at_or_before(
        &self,
        ticker: &str,
        ts: i64,
    ) -> Result<Option<MarketSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SNAPSHOT_COLS} FROM market_snapshots
             WHERE ticker = ?1 AND generate_date <= ?2
             ORDER BY generate_date DESC, rowid DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query_map(params![ticker, ts], snapshot_from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn snapshot_count(&self, ticker: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM market_snapshots WHERE ticker = ?1",
            params![ticker],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Tickers whose latest snapshot is terminal and older than `cutoff`.
    pub fn settled_tickers_older_than(&self, cutoff: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT ticker FROM (
                 SELECT ticker, status, generate_date,
                        ROW_NUMBER() OVER (PARTITION BY ticker ORDER BY generate_date DESC, rowid DESC) AS rn
                 FROM market_snapshots
             ) WHERE rn = 1 AND status IN ('closed','finalized','settled') AND generate_date < ?1",
        )?;
        let rows = stmt
            .query_map(params![cutoff], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Insert candles, ignoring rows already present for the same
    /// `(ticker, period_interval, end_period_ts)`. Returns inserted count.
    pub fn insert_candles(&self, candles: &[Candlestick]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut written = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO candlesticks (
                    ticker, period_interval, end_period_ts,
                    yes_bid_open, yes_bid_low, yes_bid_high, yes_bid_close,
                    yes_ask_open, yes_ask_low, yes_ask_high, yes_ask_close,
                    price_open, price_low, price_high, price_close,
                    volume, open_interest
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            )?;
            for candle in candles {
                if let Err(reason) = candle.validate() {
                    warn!(reason, "rejecting candle with inconsistent ohlc");
                    continue;
                }
                written += stmt.execute(params![
                    candle.ticker,
                    candle.period_interval,
                    candle.end_period_ts,
                    candle.yes_bid_open,
                    candle.yes_bid_low,
                    candle.yes_bid_high,
                    candle.yes_bid_close,
                    candle.yes_ask_open,
                    candle.yes_ask_low,
                    candle.yes_ask_high,
                    candle.yes_ask_close,
                    candle.price_open,
                    candle.price_low,
                    candle.price_high,
                    candle.price_close,
                    candle.volume,
                    candle.open_interest,
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn candles(&self, ticker: &str, period_interval: i64) -> Result<Vec<Candlestick>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {CANDLE_COLS} FROM candlesticks
             WHERE ticker = ?1 AND period_interval = ?2 ORDER BY end_period_ts ASC"
        ))?;
        let rows = stmt
            .query_map(params![ticker, period_interval], candle_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn candles_in_window(
        &self,
        ticker: &str,
        period_interval: i64,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<Vec<Candlestick>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {CANDLE_COLS} FROM candlesticks
             WHERE ticker = ?1 AND period_interval = ?2
               AND end_period_ts >= ?3 AND end_period_ts <= ?4
             ORDER BY end_period_ts ASC"
        ))?;
        let rows = stmt
            .query_map(
                params![ticker, period_interval, start_ts, end_ts],
                candle_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn max_candle_ts(&self, ticker: &str, period_interval: i64) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let ts: Option<i64> = conn.query_row(
            "SELECT MAX(end_period_ts) FROM candlesticks
             WHERE ticker = ?1 AND period_interval = ?2",
            params![ticker, period_interval],
            |row| row.get(0),
        )?;
        Ok(ts)
    }

    pub fn insert_orderbook_snapshot(&self, snap: &OrderbookSnapshot) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO orderbook_snapshots (
                market_id, captured_at, yes_levels, no_levels,
                total_liquidity_yes, total_liquidity_no, best_yes, best_no, spread
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                snap.market_id,
                snap.captured_at,
                serde_json::to_string(&snap.yes_levels)?,
                serde_json::to_string(&snap.no_levels)?,
                snap.total_liquidity_yes,
                snap.total_liquidity_no,
                snap.best_yes,
                snap.best_no,
                snap.spread,
            ],
        )?;
        Ok(())
    }

    /// Latest book snapshot for a market, optionally excluding captures at or
    /// after `before` (used to fetch the predecessor while diffing).
    pub fn latest_orderbook_snapshot(
        &self,
        market_id: &str,
        before: Option<i64>,
    ) -> Result<Option<OrderbookSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT market_id, captured_at, yes_levels, no_levels,
                    total_liquidity_yes, total_liquidity_no, best_yes, best_no, spread
             FROM orderbook_snapshots
             WHERE market_id = ?1 AND (?2 IS NULL OR captured_at < ?2)
             ORDER BY captured_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![market_id, before], |row| {
            let yes_levels: String = row.get("yes_levels")?;
            let no_levels: String = row.get("no_levels")?;
            Ok((
                OrderbookSnapshot {
                    market_id: row.get("market_id")?,
                    captured_at: row.get("captured_at")?,
                    yes_levels: Vec::new(),
                    no_levels: Vec::new(),
                    total_liquidity_yes: row.get("total_liquidity_yes")?,
                    total_liquidity_no: row.get("total_liquidity_no")?,
                    best_yes: row.get("best_yes")?,
                    best_no: row.get("best_no")?,
                    spread: row.get("spread")?,
                },
                yes_levels,
                no_levels,
            ))
        })?;

        match rows.next().transpose()? {
            None => Ok(None),
            Some((mut snap, yes_json, no_json)) => {
                snap.yes_levels = serde_json::from_str::<Vec<BookLevel>>(&yes_json)?;
                snap.no_levels = serde_json::from_str::<Vec<BookLevel>>(&no_json)?;
                Ok(Some(snap))
            }
        }
    }

    pub fn insert_orderbook_events(&self, events: &[OrderbookEvent]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut written = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO orderbook_events
                 (event_id, market_id, event_time, side, price, size, kind)
                 VALUES (?1,?2,?3,?4,?5,?6,?7)",
            )?;
            for event in events {
                written += stmt.execute(params![
                    event.event_id,
                    event.market_id,
                    event.event_time,
                    event.side.as_str(),
                    event.price,
                    event.size,
                    event.kind.as_str(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn orderbook_events_for_market(&self, market_id: &str) -> Result<Vec<OrderbookEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT event_id, market_id, event_time, side, price, size, kind
             FROM orderbook_events WHERE market_id = ?1
             ORDER BY event_time ASC, price ASC",
        )?;
        let rows = stmt
            .query_map(params![market_id], |row| {
                let side: String = row.get("side")?;
                let kind: String = row.get("kind")?;
                Ok(OrderbookEvent {
                    event_id: row.get("event_id")?,
                    market_id: row.get("market_id")?,
                    event_time: row.get("event_time")?,
                    side: if side == "NO" { BookSide::No } else { BookSide::Yes },
                    price: row.get("price")?,
                    size: row.get("size")?,
                    kind: match kind.as_str() {
                        "ADD" => BookEventType::Add,
                        "REMOVE" => BookEventType::Remove,
                        _ => BookEventType::Update,
                    },
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Append one feature row; duplicates on `(ticker, feature_time)` are
    /// ignored.
    pub fn insert_feature(&self, feature: &MarketFeature) -> Result<bool> {
        let conn = self.conn.lock();
        let written = conn.execute(
            "INSERT OR IGNORE INTO market_features (
                ticker, feature_time, time_to_close_seconds, time_to_expiration_seconds,
                yes_bid_prob, yes_ask_prob, no_bid_prob, no_ask_prob, mid_prob, bid_ask_spread,
                volume_24h, open_interest, market_type, status, category,
                return_1h, return_24h, volatility_1h, volatility_24h,
                volume_1h, notional_1h, notional_24h,
                top_book_liquidity_yes, top_book_liquidity_no,
                total_liquidity_yes, total_liquidity_no, orderbook_imbalance,
                external_prob, misprice_score
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25,?26,?27,?28,?29)",
            params![
                feature.ticker,
                feature.feature_time,
                feature.time_to_close_seconds,
                feature.time_to_expiration_seconds,
                feature.yes_bid_prob,
                feature.yes_ask_prob,
                feature.no_bid_prob,
                feature.no_ask_prob,
                feature.mid_prob,
                feature.bid_ask_spread,
                feature.volume_24h,
                feature.open_interest,
                feature.market_type,
                feature.status,
                feature.category,
                feature.return_1h,
                feature.return_24h,
                feature.volatility_1h,
                feature.volatility_24h,
                feature.volume_1h,
                feature.notional_1h,
                feature.notional_24h,
                feature.top_book_liquidity_yes,
                feature.top_book_liquidity_no,
                feature.total_liquidity_yes,
                feature.total_liquidity_no,
                feature.orderbook_imbalance,
                feature.external_prob,
                feature.misprice_score,
            ],
        )?;
        Ok(written > 0)
    }

    pub fn latest_feature(&self, ticker: &str) -> Result<Option<MarketFeature>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM market_features WHERE ticker = ?1
             ORDER BY feature_time DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![ticker], |row| {
            Ok(MarketFeature {
                ticker: row.get("ticker")?,
                feature_time: row.get("feature_time")?,
                time_to_close_seconds: row.get("time_to_close_seconds")?,
                time_to_expiration_seconds: row.get("time_to_expiration_seconds")?,
                yes_bid_prob: row.get("yes_bid_prob")?,
                yes_ask_prob: row.get("yes_ask_prob")?,
                no_bid_prob: row.get("no_bid_prob")?,
                no_ask_prob: row.get("no_ask_prob")?,
                mid_prob: row.get("mid_prob")?,
                bid_ask_spread: row.get("bid_ask_spread")?,
                volume_24h: row.get("volume_24h")?,
                open_interest: row.get("open_interest")?,
                market_type: row.get("market_type")?,
                status: row.get("status")?,
                category: row.get("category")?,
                return_1h: row.get("return_1h")?,
                return_24h: row.get("return_24h")?,
                volatility_1h: row.get("volatility_1h")?,
                volatility_24h: row.get("volatility_24h")?,
                volume_1h: row.get("volume_1h")?,
                notional_1h: row.get("notional_1h")?,
                notional_24h: row.get("notional_24h")?,
                top_book_liquidity_yes: row.get("top_book_liquidity_yes")?,
                top_book_liquidity_no: row.get("top_book_liquidity_no")?,
                total_liquidity_yes: row.get("total_liquidity_yes")?,
                total_liquidity_no: row.get("total_liquidity_no")?,
                orderbook_imbalance: row.get("orderbook_imbalance")?,
                external_prob: row.get("external_prob")?,
                misprice_score: row.get("misprice_score")?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::temp_store;
    use crate::models::{
        BookLevel, Candlestick, MarketSnapshot, MarketStatus, OrderbookSnapshot,
    };

    fn snap(ticker: &str, ts: i64, yes_bid: i64, yes_ask: i64) -> MarketSnapshot {
        MarketSnapshot {
            snapshot_id: format!("{}-{}", ticker, ts),
            ticker: ticker.into(),
            event_ticker: None,
            series_key: ticker.into(),
            market_type: "binary".into(),
            title: "t".into(),
            generate_date: ts,
            yes_bid,
            yes_ask,
            no_bid: 100 - yes_ask,
            no_ask: 100 - yes_bid,
            last_price: yes_bid,
            previous_yes_bid: yes_bid,
            previous_yes_ask: yes_ask,
            previous_price: yes_bid,
            volume: 0,
            volume_24h: 0,
            open_interest: 0,
            liquidity: 0,
            notional_value: 100,
            close_time: None,
            expiration_time: None,
            status: MarketStatus::Open,
            settlement_value: None,
            result: None,
            rules_primary: None,
        }
    }

    #[test]
    fn invalid_snapshots_are_skipped_not_stored() {
        let (store, _dir) = temp_store();
        let good = snap("A", 100, 45, 47);
        let crossed = snap("A", 101, 60, 50);
        let written = store.insert_snapshots(&[good, crossed]).unwrap();
        assert_eq!(written, 1);
        assert_eq!(store.snapshot_count("A").unwrap(), 1);
    }

    #[test]
    fn latest_snapshot_ties_break_by_insert_order() {
        let (store, _dir) = temp_store();
        let mut first = snap("A", 100, 40, 42);
        first.snapshot_id = "first".into();
        let mut second = snap("A", 100, 45, 47);
        second.snapshot_id = "second".into();
        store.insert_snapshots(&[first, second]).unwrap();

        let latest = store.latest_snapshot("A").unwrap().unwrap();
        assert_eq!(latest.snapshot_id, "second");
    }

    #[test]
    fn duplicate_snapshot_ids_are_idempotent() {
        let (store, _dir) = temp_store();
        let s = snap("A", 100, 45, 47);
        store.insert_snapshots(&[s.clone()]).unwrap();
        let written = store.insert_snapshots(&[s]).unwrap();
        assert_eq!(written, 0);
        assert_eq!(store.snapshot_count("A").unwrap(), 1);
    }

    #[test]
    fn candle_dedupe_by_period_key() {
        let (store, _dir) = temp_store();
        let candle = Candlestick {
            ticker: "A".into(),
            period_interval: 1440,
            end_period_ts: 1000,
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
            price_close: Some(45),
            volume: 10,
            open_interest: 5,
        };
        assert_eq!(store.insert_candles(&[candle.clone()]).unwrap(), 1);
        assert_eq!(store.insert_candles(&[candle]).unwrap(), 0);
        assert_eq!(store.max_candle_ts("A", 1440).unwrap(), Some(1000));
    }

    #[test]
    fn orderbook_snapshot_round_trips_ladders() {
        let (store, _dir) = temp_store();
        let snap = OrderbookSnapshot::from_ladders(
            "A",
            500,
            vec![BookLevel { price: 40, size: 10 }],
            vec![BookLevel { price: 55, size: 7 }],
        );
        store.insert_orderbook_snapshot(&snap).unwrap();
        let loaded = store.latest_orderbook_snapshot("A", None).unwrap().unwrap();
        assert_eq!(loaded.yes_levels, snap.yes_levels);
        assert_eq!(loaded.no_levels, snap.no_levels);

        // Predecessor lookup excludes the newest capture.
        assert!(store.latest_orderbook_snapshot("A", Some(500)).unwrap().is_none());
    }

    #[test]
    fn settled_scan_sees_only_terminal_latest() {
        let (store, _dir) = temp_store();
        let mut done = snap("DONE", 100, 45, 47);
        done.status = MarketStatus::Finalized;
        let live = snap("LIVE", 100, 45, 47);
        // DONE later reopened is not terminal anymore.
        let mut reopened = snap("FLIP", 100, 45, 47);
        reopened.status = MarketStatus::Closed;
        let mut flip_latest = snap("FLIP", 200, 45, 47);
        flip_latest.status = MarketStatus::Open;

        store
            .insert_snapshots(&[done, live, reopened, flip_latest])
            .unwrap();

        let settled = store.settled_tickers_older_than(1_000).unwrap();
        assert_eq!(settled, vec!["DONE".to_string()]);
    }
}
