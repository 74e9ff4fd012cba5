//! Event-detail sync: one event ticker per message, consumed in batches.
//!
//! The batch concurrency lives in the worker runtime; this handler only
//! deals with a single event. A rate-limited fetch terminates this message
//! gracefully without touching its batch siblings.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use crate::bus::JobHandler;
use crate::dispatcher::EventDetailJob;
use crate::error::ServiceError;
use crate::store::MarketStore;
use crate::upstream::ExchangeApi;

use super::dimensions::event_from_wire;
use super::snapshots::snapshot_from_market;

pub struct EventDetailHandler {
    store: MarketStore,
    api: Arc<dyn ExchangeApi>,
}

impl EventDetailHandler {
    pub fn new(store: MarketStore, api: Arc<dyn ExchangeApi>) -> Self {
        Self { store, api }
    }
}

#[async_trait]
impl JobHandler for EventDetailHandler {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), ServiceError> {
        let job: EventDetailJob = serde_json::from_value(payload)
            .map_err(|e| ServiceError::InvalidRequest(format!("event-detail payload: {e}")))?;

        let fetched_at = Utc::now().timestamp();
        let detail = self.api.get_event(&job.event_ticker).await?;

        self.store
            .upsert_event(&event_from_wire(&detail.event, fetched_at))
            .map_err(ServiceError::store)?;

        let snapshots: Vec<_> = detail
            .markets
            .iter()
            .map(|m| snapshot_from_market(m, fetched_at))
            .collect();
        let written = self
            .store
            .insert_snapshots(&snapshots)
            .map_err(ServiceError::store)?;

        info!(
            event_ticker = job.event_ticker,
            markets = detail.markets.len(),
            written,
            "event detail synced"
        );
        Ok(())
    }
}
