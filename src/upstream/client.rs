//! Production exchange client over reqwest.
//!
//! Responses are classified into the closed error kinds: 429 is
//! `RateLimitExceeded`, 404 `NotFound`, 401/403 `Unauthorized`, 5xx and
//! transport failures `TransientUpstream`, any other 4xx `Api`. Bodies are
//! parsed through a raw `serde_json::Value` first so pagination cursors that
//! live outside the typed schema are still recovered.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use crate::config::Config;
use crate::error::ServiceError;

use super::{
    effective_cursor, ApiMarket, ApiOrderbook, CandlesticksResponse, EventDetail, EventMetadata,
    EventsPage, ExchangeApi, MarketsFilter, MarketsPage, SeriesList, TagsByCategories,
};

pub struct ExchangeRestClient {
    client: Client,
    base_url: String,
}

impl ExchangeRestClient {
    pub fn new(cfg: &Config) -> Result<Self, ServiceError> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = &cfg.upstream_api_key {
            headers.insert(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", key)
                    .parse()
                    .map_err(|_| ServiceError::InvalidRequest("invalid api key".into()))?,
            );
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.upstream_timeout_secs))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .default_headers(headers)
            .build()
            .map_err(|e| ServiceError::Internal(format!("http client build: {e}")))?;

        Ok(Self {
            client,
            base_url: cfg.upstream_base_url.trim_end_matches('/').to_string(),
        })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET, classify, and parse. Returns the typed value together with the
    /// raw body for cursor recovery.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<(T, serde_json::Value), ServiceError> {
        let url = self.url(path);
        debug!(url = %url, "upstream GET");

        let resp = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    ServiceError::TransientUpstream(format!("GET {path}: {e}"))
                } else {
                    ServiceError::TransientUpstream(format!("GET {path} failed: {e}"))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, path, body));
        }

        let raw: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ServiceError::TransientUpstream(format!("GET {path} body: {e}")))?;
        let typed: T = serde_json::from_value(raw.clone()).map_err(|e| ServiceError::Api {
            status: status.as_u16(),
            body: format!("unparseable response from {path}: {e}"),
        })?;
        Ok((typed, raw))
    }
}

fn classify_status(status: StatusCode, path: &str, body: String) -> ServiceError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            ServiceError::RateLimitExceeded(format!("GET {path}: 429"))
        }
        StatusCode::NOT_FOUND => ServiceError::NotFound(format!("GET {path}: 404")),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ServiceError::Unauthorized(format!("GET {path}: {status}"))
        }
        s if s.is_server_error() => {
            ServiceError::TransientUpstream(format!("GET {path}: {status} {body}"))
        }
        s => ServiceError::Api {
            status: s.as_u16(),
            body,
        },
    }
}

#[async_trait]
impl ExchangeApi for ExchangeRestClient {
    async fn list_markets(
        &self,
        filter: &MarketsFilter,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<MarketsPage, ServiceError> {
        let mut qp: Vec<(String, String)> = Vec::with_capacity(6);
        qp.push(("limit".into(), limit.to_string()));
        qp.push(("with_nested_markets".into(), "true".into()));
        qp.push((
            "status".into(),
            filter.status.clone().unwrap_or_else(|| "open".into()),
        ));
        if let Some(ts) = filter.min_created_ts {
            qp.push(("min_created_ts".into(), ts.to_string()));
        }
        if let Some(ts) = filter.max_created_ts {
            qp.push(("max_created_ts".into(), ts.to_string()));
        }
        if let Some(c) = cursor {
            qp.push(("cursor".into(), c.to_string()));
        }

        let (mut page, raw): (MarketsPage, _) = self.get_json("/markets", &qp).await?;
        page.cursor = effective_cursor(page.cursor.as_deref(), &raw);
        Ok(page)
    }

    async fn get_market(&self, ticker: &str) -> Result<ApiMarket, ServiceError> {
        #[derive(serde::Deserialize)]
        struct Wrapper {
            market: ApiMarket,
        }
        let (w, _): (Wrapper, _) = self.get_json(&format!("/markets/{ticker}"), &[]).await?;
        Ok(w.market)
    }

    async fn list_events(
        &self,
        cursor: Option<&str>,
        with_nested_markets: bool,
    ) -> Result<EventsPage, ServiceError> {
        let mut qp: Vec<(String, String)> = vec![(
            "with_nested_markets".into(),
            with_nested_markets.to_string(),
        )];
        if let Some(c) = cursor {
            qp.push(("cursor".into(), c.to_string()));
        }
        let (mut page, raw): (EventsPage, _) = self.get_json("/events", &qp).await?;
        page.cursor = effective_cursor(page.cursor.as_deref(), &raw);
        Ok(page)
    }

    async fn get_event(&self, event_ticker: &str) -> Result<EventDetail, ServiceError> {
        let (detail, _): (EventDetail, _) =
            self.get_json(&format!("/events/{event_ticker}"), &[]).await?;
        Ok(detail)
    }

    async fn get_event_metadata(
        &self,
        event_ticker: &str,
    ) -> Result<EventMetadata, ServiceError> {
        let (meta, _): (EventMetadata, _) = self
            .get_json(&format!("/events/{event_ticker}/metadata"), &[])
            .await?;
        Ok(meta)
    }

    async fn list_multivariate_events(
        &self,
        cursor: Option<&str>,
    ) -> Result<EventsPage, ServiceError> {
        let mut qp: Vec<(String, String)> = Vec::new();
        if let Some(c) = cursor {
            qp.push(("cursor".into(), c.to_string()));
        }
        let (mut page, raw): (EventsPage, _) =
            self.get_json("/multivariate_event_collections", &qp).await?;
        page.cursor = effective_cursor(page.cursor.as_deref(), &raw);
        Ok(page)
    }

    async fn get_orderbook(
        &self,
        ticker: &str,
        depth: u32,
    ) -> Result<ApiOrderbook, ServiceError> {
        #[derive(serde::Deserialize)]
        struct Wrapper {
            orderbook: ApiOrderbook,
        }
        let qp = [("depth".to_string(), depth.to_string())];
        let (w, _): (Wrapper, _) = self
            .get_json(&format!("/markets/{ticker}/orderbook"), &qp)
            .await?;
        Ok(w.orderbook)
    }

    async fn get_candlesticks(
        &self,
        series_ticker: &str,
        ticker: &str,
        start_ts: i64,
        end_ts: i64,
        period_interval: i64,
    ) -> Result<CandlesticksResponse, ServiceError> {
        let qp = [
            ("start_ts".to_string(), start_ts.to_string()),
            ("end_ts".to_string(), end_ts.to_string()),
            ("period_interval".to_string(), period_interval.to_string()),
        ];
        let (resp, _): (CandlesticksResponse, _) = self
            .get_json(
                &format!("/series/{series_ticker}/markets/{ticker}/candlesticks"),
                &qp,
            )
            .await?;
        Ok(resp)
    }

    async fn list_series(
        &self,
        category: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<SeriesList, ServiceError> {
        let mut qp: Vec<(String, String)> = Vec::new();
        if let Some(c) = category {
            qp.push(("category".into(), c.to_string()));
        }
        if let Some(c) = cursor {
            qp.push(("cursor".into(), c.to_string()));
        }
        let (mut list, raw): (SeriesList, _) = self.get_json("/series", &qp).await?;
        list.cursor = effective_cursor(list.cursor.as_deref(), &raw);
        Ok(list)
    }

    async fn tags_by_categories(&self) -> Result<TagsByCategories, ServiceError> {
        #[derive(serde::Deserialize)]
        struct Wrapper {
            #[serde(default)]
            tags_by_categories: TagsByCategories,
        }
        let (w, _): (Wrapper, _) = self
            .get_json("/series/tags_for_series_categories", &[])
            .await?;
        Ok(w.tags_by_categories)
    }
}
