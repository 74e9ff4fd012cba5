//! Differential candlestick fetch.
//!
//! Chart reads are served from the store; upstream is only hit for the
//! window the store does not cover yet. Inbound rows are deduped against the
//! stored set by period end before insert.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::ServiceError;
use crate::models::Candlestick;
use crate::store::MarketStore;
use crate::upstream::{ApiCandle, ExchangeApi};

/// Daily interval in minutes.
pub const DAILY_INTERVAL: i64 = 1440;

/// One chart point: period end and the projected close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ChartPoint {
    pub ts: i64,
    pub close: i64,
}

/// Map one wire candle into a stored row.
pub fn candle_from_wire(ticker: &str, period_interval: i64, wire: &ApiCandle) -> Candlestick {
    Candlestick {
        ticker: ticker.to_string(),
        period_interval,
        end_period_ts: wire.end_period_ts,
        yes_bid_open: wire.yes_bid.open,
        yes_bid_low: wire.yes_bid.low,
        yes_bid_high: wire.yes_bid.high,
        yes_bid_close: wire.yes_bid.close,
        yes_ask_open: wire.yes_ask.open,
        yes_ask_low: wire.yes_ask.low,
        yes_ask_high: wire.yes_ask.high,
        yes_ask_close: wire.yes_ask.close,
        price_open: wire.price.open,
        price_low: wire.price.low,
        price_high: wire.price.high,
        price_close: wire.price.close,
        volume: wire.volume,
        open_interest: wire.open_interest,
    }
}

pub struct ChartService {
    store: MarketStore,
    api: Arc<dyn ExchangeApi>,
    /// Stored history younger than this is served without refetching.
    freshness_secs: i64,
    /// Backfill window when a ticker has no stored candles.
    bootstrap_days: i64,
}

impl ChartService {
    pub fn new(
        store: MarketStore,
        api: Arc<dyn ExchangeApi>,
        freshness_secs: i64,
        bootstrap_days: i64,
    ) -> Self {
        Self {
            store,
            api,
            freshness_secs,
            bootstrap_days,
        }
    }

    /// Refresh the daily history for a ticker, fetching only the missing
    /// tail, and return the full chart sorted by time. Returns the number of
    /// rows inserted alongside the points.
    pub async fn daily_chart(&self, ticker: &str) -> Result<(Vec<ChartPoint>, usize), ServiceError> {
        let now = Utc::now().timestamp();
        let stored = self
            .store
            .candles(ticker, DAILY_INTERVAL)
            .map_err(ServiceError::store)?;
        let latest_ts = stored.last().map(|c| c.end_period_ts);

        // Fresh enough: serve the store, skip upstream entirely.
        if let Some(latest) = latest_ts {
            if now - latest < self.freshness_secs {
                debug!(ticker, latest, "stored candles fresh, skipping fetch");
                return Ok((project(&stored), 0));
            }
        }

        let start_ts = match latest_ts {
            Some(latest) => latest + 1,
            None => now - self.bootstrap_days * 86_400,
        };

        let series_ticker = self
            .store
            .series_ticker_for_market(ticker)
            .map_err(ServiceError::store)?
            .unwrap_or_else(|| ticker.to_string());

        let response = self
            .api
            .get_candlesticks(&series_ticker, ticker, start_ts, now, DAILY_INTERVAL)
            .await?;

        // Dedupe inbound rows against the stored period ends.
        let known: std::collections::HashSet<i64> =
            stored.iter().map(|c| c.end_period_ts).collect();
        let fresh: Vec<Candlestick> = response
            .candlesticks
            .iter()
            .filter(|c| !known.contains(&c.end_period_ts))
            .map(|c| candle_from_wire(ticker, DAILY_INTERVAL, c))
            .collect();

        let inserted = self
            .store
            .insert_candles(&fresh)
            .map_err(ServiceError::store)?;
        if inserted > 0 {
            info!(ticker, inserted, "candle history extended");
        }

        let merged = self
            .store
            .candles(ticker, DAILY_INTERVAL)
            .map_err(ServiceError::store)?;
        Ok((project(&merged), inserted))
    }
}

fn project(candles: &[Candlestick]) -> Vec<ChartPoint> {
    candles
        .iter()
        .map(|c| ChartPoint {
            ts: c.end_period_ts,
            close: c.chart_close(),
        })
        .collect()
}
