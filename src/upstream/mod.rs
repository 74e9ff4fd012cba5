//! Typed contract for the exchange REST API.
//!
//! The pipeline only ever talks to the exchange through [`ExchangeApi`], so
//! consumers can be driven by a scripted mock in tests. The production
//! implementation lives in [`client`].

pub mod client;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ServiceError;

pub use client::ExchangeRestClient;

/// Filters for the paginated list-markets pull.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketsFilter {
    pub min_created_ts: Option<i64>,
    pub max_created_ts: Option<i64>,
    /// Defaults to "open" when unset.
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OhlcWire {
    pub open: i64,
    pub low: i64,
    pub high: i64,
    pub close: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OhlcNullableWire {
    pub open: Option<i64>,
    pub low: Option<i64>,
    pub high: Option<i64>,
    pub close: Option<i64>,
}

/// One market as returned by list-markets / get-market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiMarket {
    pub ticker: String,
    #[serde(default)]
    pub event_ticker: Option<String>,
    #[serde(default)]
    pub market_type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub yes_bid: i64,
    #[serde(default)]
    pub yes_ask: i64,
    #[serde(default)]
    pub no_bid: i64,
    #[serde(default)]
    pub no_ask: i64,
    #[serde(default)]
    pub last_price: i64,
    #[serde(default)]
    pub previous_yes_bid: i64,
    #[serde(default)]
    pub previous_yes_ask: i64,
    #[serde(default)]
    pub previous_price: i64,

    #[serde(default)]
    pub volume: i64,
    #[serde(default)]
    pub volume_24h: i64,
    #[serde(default)]
    pub open_interest: i64,
    #[serde(default)]
    pub liquidity: i64,
    #[serde(default)]
    pub notional_value: i64,

    #[serde(default)]
    pub close_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expiration_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub settlement_value: Option<i64>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub rules_primary: Option<String>,
    /// Formatted dollar string as sent by upstream; verified against the
    /// integer cents at ingest, never persisted as-is.
    #[serde(default)]
    pub yes_bid_dollars: Option<String>,
    #[serde(default)]
    pub yes_ask_dollars: Option<String>,
}

/// One page of markets plus the continuation cursor. An empty or absent
/// cursor terminates pagination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketsPage {
    #[serde(default)]
    pub markets: Vec<ApiMarket>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEvent {
    pub event_ticker: String,
    #[serde(default)]
    pub series_ticker: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub strike_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub strike_period: Option<String>,
    #[serde(default)]
    pub mutually_exclusive: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventsPage {
    #[serde(default)]
    pub events: Vec<ApiEvent>,
    #[serde(default)]
    pub cursor: Option<String>,
}

/// Event detail: the event plus its nested markets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDetail {
    pub event: ApiEvent,
    #[serde(default)]
    pub markets: Vec<ApiMarket>,
}

/// Free-form event metadata blob (image urls, settlement sources, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub settlement_sources: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSeries {
    pub ticker: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub frequency: Option<String>,
    /// Whatever else upstream sends; carried as the metadata blob.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeriesList {
    #[serde(default)]
    pub series: Vec<ApiSeries>,
    #[serde(default)]
    pub cursor: Option<String>,
}

/// Depth ladders in wire form: `[price_cents, contracts]` pairs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiOrderbook {
    #[serde(default)]
    pub yes: Vec<[i64; 2]>,
    #[serde(default)]
    pub no: Vec<[i64; 2]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCandle {
    pub end_period_ts: i64,
    pub yes_bid: OhlcWire,
    pub yes_ask: OhlcWire,
    #[serde(default)]
    pub price: OhlcNullableWire,
    #[serde(default)]
    pub volume: i64,
    #[serde(default)]
    pub open_interest: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandlesticksResponse {
    #[serde(default)]
    pub candlesticks: Vec<ApiCandle>,
}

/// category -> tag list.
pub type TagsByCategories = HashMap<String, Vec<String>>;

/// Calls the ingestion pipeline makes against the exchange.
///
/// Every method carries the caller's deadline via the client configuration
/// and classifies failures into [`ServiceError`] kinds.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn list_markets(
        &self,
        filter: &MarketsFilter,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<MarketsPage, ServiceError>;

    async fn get_market(&self, ticker: &str) -> Result<ApiMarket, ServiceError>;

    async fn list_events(
        &self,
        cursor: Option<&str>,
        with_nested_markets: bool,
    ) -> Result<EventsPage, ServiceError>;

    async fn get_event(&self, event_ticker: &str) -> Result<EventDetail, ServiceError>;

    async fn get_event_metadata(&self, event_ticker: &str)
        -> Result<EventMetadata, ServiceError>;

    async fn list_multivariate_events(
        &self,
        cursor: Option<&str>,
    ) -> Result<EventsPage, ServiceError>;

    async fn get_orderbook(&self, ticker: &str, depth: u32)
        -> Result<ApiOrderbook, ServiceError>;

    #[allow(clippy::too_many_arguments)]
    async fn get_candlesticks(
        &self,
        series_ticker: &str,
        ticker: &str,
        start_ts: i64,
        end_ts: i64,
        period_interval: i64,
    ) -> Result<CandlesticksResponse, ServiceError>;

    async fn list_series(
        &self,
        category: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<SeriesList, ServiceError>;

    async fn tags_by_categories(&self) -> Result<TagsByCategories, ServiceError>;
}

/// Pull a continuation cursor out of a response, tolerating cursors that only
/// exist in the raw body. Empty strings mean "done".
pub fn effective_cursor(typed: Option<&str>, raw_body: &serde_json::Value) -> Option<String> {
    let candidate = match typed {
        Some(c) => Some(c.to_string()),
        None => raw_body
            .get("cursor")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    };
    candidate.filter(|c| !c.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cursor_prefers_typed_field() {
        let raw = json!({"cursor": "raw-c"});
        assert_eq!(
            effective_cursor(Some("typed-c"), &raw),
            Some("typed-c".to_string())
        );
    }

    #[test]
    fn cursor_recovered_from_raw_body() {
        let raw = json!({"markets": [], "cursor": "c1"});
        assert_eq!(effective_cursor(None, &raw), Some("c1".to_string()));
    }

    #[test]
    fn empty_cursor_terminates() {
        let raw = json!({"cursor": ""});
        assert_eq!(effective_cursor(None, &raw), None);
        assert_eq!(effective_cursor(Some(""), &raw), None);
        assert_eq!(effective_cursor(None, &json!({})), None);
    }
}
