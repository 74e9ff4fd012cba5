//! Scripted exchange mock for driving consumers in tests.
//!
//! Responses are queued per endpoint and popped in order; an exhausted queue
//! falls back to an empty (or not-found) response. Calls are recorded so
//! tests can assert on cursors and windows.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use crate::error::ServiceError;
use crate::upstream::{
    ApiMarket, ApiOrderbook, CandlesticksResponse, EventDetail, EventMetadata, EventsPage,
    ExchangeApi, MarketsFilter, MarketsPage, SeriesList, TagsByCategories,
};

#[derive(Default)]
pub struct MockExchange {
    markets_pages: Mutex<VecDeque<Result<MarketsPage, ServiceError>>>,
    events_pages: Mutex<VecDeque<Result<EventsPage, ServiceError>>>,
    event_details: Mutex<HashMap<String, VecDeque<Result<EventDetail, ServiceError>>>>,
    orderbooks: Mutex<HashMap<String, VecDeque<Result<ApiOrderbook, ServiceError>>>>,
    candles: Mutex<VecDeque<Result<CandlesticksResponse, ServiceError>>>,
    series_pages: Mutex<VecDeque<Result<SeriesList, ServiceError>>>,
    tags: Mutex<Option<TagsByCategories>>,

    markets_calls: Mutex<Vec<Option<String>>>,
    series_calls: Mutex<Vec<Option<String>>>,
    candle_calls: Mutex<Vec<(String, String, i64, i64, i64)>>,
    event_detail_calls: Mutex<Vec<String>>,
}

impl MockExchange {
    pub fn push_markets_page(&self, page: Result<MarketsPage, ServiceError>) {
        self.markets_pages.lock().push_back(page);
    }

    pub fn push_events_page(&self, page: Result<EventsPage, ServiceError>) {
        self.events_pages.lock().push_back(page);
    }

    pub fn push_event_detail(&self, ticker: &str, detail: Result<EventDetail, ServiceError>) {
        self.event_details
            .lock()
            .entry(ticker.to_string())
            .or_default()
            .push_back(detail);
    }

    pub fn push_orderbook(&self, ticker: &str, book: Result<ApiOrderbook, ServiceError>) {
        self.orderbooks
            .lock()
            .entry(ticker.to_string())
            .or_default()
            .push_back(book);
    }

    pub fn push_candles(&self, resp: Result<CandlesticksResponse, ServiceError>) {
        self.candles.lock().push_back(resp);
    }

    pub fn push_series_page(&self, page: Result<SeriesList, ServiceError>) {
        self.series_pages.lock().push_back(page);
    }

    pub fn set_tags(&self, tags: TagsByCategories) {
        *self.tags.lock() = Some(tags);
    }

    /// Cursors passed to list_markets, in call order.
    pub fn markets_calls(&self) -> Vec<Option<String>> {
        self.markets_calls.lock().clone()
    }

    /// Cursors passed to list_series, in call order.
    pub fn series_calls(&self) -> Vec<Option<String>> {
        self.series_calls.lock().clone()
    }

    /// (series_ticker, ticker, start_ts, end_ts, period_interval) per call.
    pub fn candle_calls(&self) -> Vec<(String, String, i64, i64, i64)> {
        self.candle_calls.lock().clone()
    }

    pub fn event_detail_calls(&self) -> Vec<String> {
        self.event_detail_calls.lock().clone()
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn list_markets(
        &self,
        _filter: &MarketsFilter,
        cursor: Option<&str>,
        _limit: u32,
    ) -> Result<MarketsPage, ServiceError> {
        self.markets_calls.lock().push(cursor.map(|c| c.to_string()));
        self.markets_pages
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(MarketsPage::default()))
    }

    async fn get_market(&self, ticker: &str) -> Result<ApiMarket, ServiceError> {
        Err(ServiceError::NotFound(format!("market {ticker}")))
    }

    async fn list_events(
        &self,
        _cursor: Option<&str>,
        _with_nested_markets: bool,
    ) -> Result<EventsPage, ServiceError> {
        self.events_pages
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(EventsPage::default()))
    }

    async fn get_event(&self, event_ticker: &str) -> Result<EventDetail, ServiceError> {
        self.event_detail_calls.lock().push(event_ticker.to_string());
        self.event_details
            .lock()
            .get_mut(event_ticker)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Err(ServiceError::NotFound(format!("event {event_ticker}"))))
    }

    async fn get_event_metadata(
        &self,
        _event_ticker: &str,
    ) -> Result<EventMetadata, ServiceError> {
        Ok(EventMetadata::default())
    }

    async fn list_multivariate_events(
        &self,
        _cursor: Option<&str>,
    ) -> Result<EventsPage, ServiceError> {
        Ok(EventsPage::default())
    }

    async fn get_orderbook(
        &self,
        ticker: &str,
        _depth: u32,
    ) -> Result<ApiOrderbook, ServiceError> {
        self.orderbooks
            .lock()
            .get_mut(ticker)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Err(ServiceError::NotFound(format!("orderbook {ticker}"))))
    }

    async fn get_candlesticks(
        &self,
        series_ticker: &str,
        ticker: &str,
        start_ts: i64,
        end_ts: i64,
        period_interval: i64,
    ) -> Result<CandlesticksResponse, ServiceError> {
        self.candle_calls.lock().push((
            series_ticker.to_string(),
            ticker.to_string(),
            start_ts,
            end_ts,
            period_interval,
        ));
        self.candles
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(CandlesticksResponse::default()))
    }

    async fn list_series(
        &self,
        _category: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<SeriesList, ServiceError> {
        self.series_calls.lock().push(cursor.map(|c| c.to_string()));
        self.series_pages
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(SeriesList::default()))
    }

    async fn tags_by_categories(&self) -> Result<TagsByCategories, ServiceError> {
        Ok(self.tags.lock().clone().unwrap_or_default())
    }
}
