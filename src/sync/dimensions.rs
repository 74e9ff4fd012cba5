//! Series and events dimension sync.
//!
//! Both families iterate pages by cursor, with the continuation published as
//! a fresh message so redeliveries stay cheap.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use crate::bus::{JobHandler, JobKind, SqliteBus};
use crate::dispatcher::CursorJob;
use crate::error::ServiceError;
use crate::models::{EventRecord, Series};
use crate::store::MarketStore;
use crate::upstream::{ApiEvent, ApiSeries, ExchangeApi};

pub fn series_from_wire(wire: &ApiSeries, now: i64) -> Series {
    Series {
        ticker: wire.ticker.clone(),
        title: wire.title.clone().unwrap_or_default(),
        category: wire.category.clone().unwrap_or_default(),
        tags: wire.tags.clone().unwrap_or_default(),
        frequency: wire.frequency.clone().unwrap_or_default(),
        metadata: serde_json::Value::Object(wire.extra.clone()),
        last_update: now,
        deleted: false,
    }
}

pub fn event_from_wire(wire: &ApiEvent, now: i64) -> EventRecord {
    EventRecord {
        event_ticker: wire.event_ticker.clone(),
        series_ticker: wire.series_ticker.clone().unwrap_or_default(),
        title: wire.title.clone().unwrap_or_default(),
        category: wire.category.clone().unwrap_or_default(),
        strike_date: wire.strike_date.map(|t| t.timestamp()),
        strike_period: wire.strike_period.clone(),
        mutually_exclusive: wire.mutually_exclusive.unwrap_or(false),
        last_update: now,
        deleted: false,
    }
}

pub struct SeriesSyncHandler {
    store: MarketStore,
    bus: SqliteBus,
    api: Arc<dyn ExchangeApi>,
}

impl SeriesSyncHandler {
    pub fn new(store: MarketStore, bus: SqliteBus, api: Arc<dyn ExchangeApi>) -> Self {
        Self { store, bus, api }
    }
}

#[async_trait]
impl JobHandler for SeriesSyncHandler {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), ServiceError> {
        let job: CursorJob = serde_json::from_value(payload)
            .map_err(|e| ServiceError::InvalidRequest(format!("series payload: {e}")))?;

        let now = Utc::now().timestamp();
        let page = self.api.list_series(None, job.cursor.as_deref()).await?;
        for wire in &page.series {
            self.store
                .upsert_series(&series_from_wire(wire, now))
                .map_err(ServiceError::store)?;
        }
        info!(
            count = page.series.len(),
            cursor = job.cursor.as_deref().unwrap_or(""),
            "series page synced"
        );

        if let Some(cursor) = page.cursor.filter(|c| !c.is_empty()) {
            let payload = serde_json::to_value(CursorJob {
                cursor: Some(cursor),
            })
            .map_err(ServiceError::internal)?;
            self.bus.publish(JobKind::SyncSeries, &payload)?;
        }
        Ok(())
    }
}

pub struct EventsSyncHandler {
    store: MarketStore,
    bus: SqliteBus,
    api: Arc<dyn ExchangeApi>,
}

impl EventsSyncHandler {
    pub fn new(store: MarketStore, bus: SqliteBus, api: Arc<dyn ExchangeApi>) -> Self {
        Self { store, bus, api }
    }
}

#[async_trait]
impl JobHandler for EventsSyncHandler {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), ServiceError> {
        let job: CursorJob = serde_json::from_value(payload)
            .map_err(|e| ServiceError::InvalidRequest(format!("events payload: {e}")))?;

        let now = Utc::now().timestamp();
        let page = self.api.list_events(job.cursor.as_deref(), false).await?;
        for wire in &page.events {
            self.store
                .upsert_event(&event_from_wire(wire, now))
                .map_err(ServiceError::store)?;
        }
        info!(
            count = page.events.len(),
            cursor = job.cursor.as_deref().unwrap_or(""),
            "events page synced"
        );

        if let Some(cursor) = page.cursor.filter(|c| !c.is_empty()) {
            let payload = serde_json::to_value(CursorJob {
                cursor: Some(cursor),
            })
            .map_err(ServiceError::internal)?;
            self.bus.publish(JobKind::SyncEvents, &payload)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::test_util::temp_bus;
    use crate::store::test_util::temp_store;
    use crate::testing::MockExchange;
    use crate::upstream::{EventsPage, SeriesList};
    use serde_json::json;

    fn wire_series(ticker: &str) -> ApiSeries {
        ApiSeries {
            ticker: ticker.into(),
            title: Some("Series".into()),
            category: Some("Economics".into()),
            tags: Some(vec!["cpi".into()]),
            frequency: Some("monthly".into()),
            extra: serde_json::Map::new(),
        }
    }

    fn wire_event(ticker: &str) -> ApiEvent {
        ApiEvent {
            event_ticker: ticker.into(),
            series_ticker: Some("SER-A".into()),
            title: Some("Event".into()),
            category: Some("Economics".into()),
            strike_date: None,
            strike_period: Some("Aug 2026".into()),
            mutually_exclusive: Some(true),
        }
    }

    #[tokio::test]
    async fn series_listing_upserts_dimension() {
        let (store, _sdir) = temp_store();
        let (bus, _bdir) = temp_bus();
        let mock = Arc::new(MockExchange::default());
        mock.push_series_page(Ok(SeriesList {
            series: vec![wire_series("SER-A"), wire_series("SER-B")],
            cursor: None,
        }));
        mock.push_series_page(Ok(SeriesList {
            series: vec![wire_series("SER-A"), wire_series("SER-B")],
            cursor: None,
        }));

        let handler = SeriesSyncHandler::new(store.clone(), bus.clone(), mock);
        handler.handle(json!({})).await.unwrap();
        handler.handle(json!({})).await.unwrap();

        assert!(store.get_series("SER-A").unwrap().is_some());
        assert!(store.get_series("SER-B").unwrap().is_some());
        assert!(bus.reserve("sync-series", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn series_pages_chain_through_cursor() {
        let (store, _sdir) = temp_store();
        let (bus, _bdir) = temp_bus();
        let mock = Arc::new(MockExchange::default());
        mock.push_series_page(Ok(SeriesList {
            series: vec![wire_series("SER-A")],
            cursor: Some("next".into()),
        }));
        mock.push_series_page(Ok(SeriesList {
            series: vec![wire_series("SER-B")],
            cursor: Some("".into()),
        }));

        let handler = SeriesSyncHandler::new(store.clone(), bus.clone(), mock.clone());
        handler.handle(json!({})).await.unwrap();

        let pending = bus.reserve("sync-series", 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["cursor"], "next");

        // Empty cursor on page two terminates the chain.
        handler.handle(pending[0].payload.clone()).await.unwrap();
        assert!(bus.reserve("sync-series", 10).unwrap().is_empty());

        assert!(store.get_series("SER-A").unwrap().is_some());
        assert!(store.get_series("SER-B").unwrap().is_some());
        assert_eq!(
            mock.series_calls(),
            vec![None, Some("next".to_string())]
        );
    }

    #[tokio::test]
    async fn events_pages_chain_through_cursor() {
        let (store, _sdir) = temp_store();
        let (bus, _bdir) = temp_bus();
        let mock = Arc::new(MockExchange::default());
        mock.push_events_page(Ok(EventsPage {
            events: vec![wire_event("EVT-1")],
            cursor: Some("next".into()),
        }));
        mock.push_events_page(Ok(EventsPage {
            events: vec![wire_event("EVT-2")],
            cursor: None,
        }));

        let handler = EventsSyncHandler::new(store.clone(), bus.clone(), mock);
        handler.handle(json!({})).await.unwrap();

        let pending = bus.reserve("sync-events", 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["cursor"], "next");

        handler.handle(pending[0].payload.clone()).await.unwrap();
        assert!(bus.reserve("sync-events", 10).unwrap().is_empty());

        let event = store.get_event("EVT-1").unwrap().unwrap();
        assert_eq!(event.series_ticker, "SER-A");
        assert!(event.mutually_exclusive);
        assert!(store.get_event("EVT-2").unwrap().is_some());
    }
}
