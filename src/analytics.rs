//! Tiered feature computation for watchlisted markets.
//!
//! L1 reads the latest snapshot, L2 looks back over 1h/24h windows of
//! snapshots and candlesticks, L3 derives depth metrics from the latest
//! orderbook snapshot. A row is appended even when inputs are missing;
//! absent fields stay zero.

use tracing::debug;

use crate::error::ServiceError;
use crate::models::{BookSide, Candlestick, MarketFeature, MarketSnapshot};
use crate::store::MarketStore;

const HOUR_SECS: i64 = 3_600;
const DAY_SECS: i64 = 86_400;

/// Candle intervals consulted for window stats, finest first.
const WINDOW_INTERVALS: [i64; 2] = [60, 1440];

pub struct FeatureEngine {
    store: MarketStore,
}

fn mid_prob(snap: &MarketSnapshot) -> f64 {
    (snap.yes_bid as f64 / 100.0 + snap.yes_ask as f64 / 100.0) / 2.0
}

/// Sample standard deviation of successive period-to-period returns. Fewer
/// than two usable candles yields 0.
pub fn realized_volatility(candles: &[Candlestick]) -> f64 {
    let closes: Vec<f64> = candles
        .iter()
        .map(|c| c.chart_close() as f64)
        .filter(|&c| c > 0.0)
        .collect();
    if closes.len() < 2 {
        return 0.0;
    }

    let returns: Vec<f64> = closes
        .windows(2)
        .map(|pair| (pair[1] - pair[0]) / pair[0])
        .collect();
    if returns.len() < 2 {
        // One return has no dispersion to measure.
        return 0.0;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns
        .iter()
        .map(|r| (r - mean).powi(2))
        .sum::<f64>()
        / (returns.len() - 1) as f64;
    variance.sqrt()
}

impl FeatureEngine {
    pub fn new(store: MarketStore) -> Self {
        Self { store }
    }

    /// Compute and append one feature row for `ticker` at the latest
    /// snapshot's capture time. Returns None when the ticker has no
    /// snapshots at all. Re-running for the same feature time is a no-op.
    pub fn compute_and_store(
        &self,
        ticker: &str,
        enable_l2: bool,
        enable_l3: bool,
    ) -> Result<Option<MarketFeature>, ServiceError> {
        let Some(snap) = self.store.latest_snapshot(ticker).map_err(ServiceError::store)? else {
            debug!(ticker, "no snapshots, skipping feature row");
            return Ok(None);
        };
        let feature_time = snap.generate_date;

        let mut feature = MarketFeature {
            ticker: ticker.to_string(),
            feature_time,
            ..Default::default()
        };

        self.fill_l1(&mut feature, &snap);
        if enable_l2 {
            self.fill_l2(&mut feature, &snap)?;
        }
        if enable_l3 {
            self.fill_l3(&mut feature)?;
        }

        if let Some(category) = self
            .store
            .category_for_market(ticker)
            .map_err(ServiceError::store)?
        {
            feature.category = category;
        }

        if let Some(external) = feature.external_prob {
            feature.misprice_score = (feature.mid_prob - external).abs();
        }

        self.store
            .insert_feature(&feature)
            .map_err(ServiceError::store)?;
        Ok(Some(feature))
    }

    fn fill_l1(&self, feature: &mut MarketFeature, snap: &MarketSnapshot) {
        feature.time_to_close_seconds = snap
            .close_time
            .map(|t| t - feature.feature_time)
            .unwrap_or(0);
        feature.time_to_expiration_seconds = snap
            .expiration_time
            .map(|t| t - feature.feature_time)
            .unwrap_or(0);

        feature.yes_bid_prob = snap.yes_bid as f64 / 100.0;
        feature.yes_ask_prob = snap.yes_ask as f64 / 100.0;
        feature.no_bid_prob = snap.no_bid as f64 / 100.0;
        feature.no_ask_prob = snap.no_ask as f64 / 100.0;
        feature.mid_prob = mid_prob(snap);
        feature.bid_ask_spread = feature.yes_ask_prob - feature.yes_bid_prob;

        feature.volume_24h = snap.volume_24h;
        feature.open_interest = snap.open_interest;
        feature.market_type = snap.market_type.clone();
        feature.status = snap.status.as_str().to_string();
    }

    fn fill_l2(
        &self,
        feature: &mut MarketFeature,
        snap: &MarketSnapshot,
    ) -> Result<(), ServiceError> {
        let t = feature.feature_time;
        let mid_now = feature.mid_prob;

        feature.return_1h = self.window_return(&snap.ticker, t - HOUR_SECS, mid_now)?;
        feature.return_24h = self.window_return(&snap.ticker, t - DAY_SECS, mid_now)?;

        let hour_candles = self.window_candles(&snap.ticker, t - HOUR_SECS, t)?;
        let day_candles = self.window_candles(&snap.ticker, t - DAY_SECS, t)?;

        feature.volatility_1h = realized_volatility(&hour_candles);
        feature.volatility_24h = realized_volatility(&day_candles);

        feature.volume_1h = hour_candles.iter().map(|c| c.volume).sum();
        feature.notional_1h = hour_candles
            .iter()
            .map(|c| c.volume as f64 * c.chart_close() as f64 / 100.0)
            .sum();
        feature.notional_24h = day_candles
            .iter()
            .map(|c| c.volume as f64 * c.chart_close() as f64 / 100.0)
            .sum();
        Ok(())
    }

    fn fill_l3(&self, feature: &mut MarketFeature) -> Result<(), ServiceError> {
        let Some(book) = self
            .store
            .latest_orderbook_snapshot(&feature.ticker, None)
            .map_err(ServiceError::store)?
        else {
            return Ok(());
        };

        feature.total_liquidity_yes = book.total_liquidity_yes;
        feature.total_liquidity_no = book.total_liquidity_no;
        feature.top_book_liquidity_yes = book.top_of_book_size(BookSide::Yes);
        feature.top_book_liquidity_no = book.top_of_book_size(BookSide::No);

        let total = book.total_liquidity_yes + book.total_liquidity_no;
        feature.orderbook_imbalance = if total > 0 {
            (book.total_liquidity_yes - book.total_liquidity_no) as f64 / total as f64
        } else {
            0.0
        };
        Ok(())
    }

    fn window_return(
        &self,
        ticker: &str,
        past_ts: i64,
        mid_now: f64,
    ) -> Result<f64, ServiceError> {
        let past = self
            .store
            .snapshot_at_or_before(ticker, past_ts)
            .map_err(ServiceError::store)?;
        Ok(match past {
            Some(past_snap) => {
                let mid_past = mid_prob(&past_snap);
                if mid_past > 0.0 {
                    (mid_now - mid_past) / mid_past
                } else {
                    0.0
                }
            }
            None => 0.0,
        })
    }

    /// Candles inside `[start, end]`, from the finest interval that has any.
    fn window_candles(
        &self,
        ticker: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<Candlestick>, ServiceError> {
        for interval in WINDOW_INTERVALS {
            let candles = self
                .store
                .candles_in_window(ticker, interval, start, end)
                .map_err(ServiceError::store)?;
            if !candles.is_empty() {
                return Ok(candles);
            }
        }
        Ok(Vec::new())
    }
}
