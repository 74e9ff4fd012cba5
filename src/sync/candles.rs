//! Candlestick sync: run the differential chart fetch for every watchlisted
//! market with candle fetching enabled.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::bus::JobHandler;
use crate::charts::ChartService;
use crate::error::ServiceError;
use crate::store::MarketStore;

pub struct CandlesSyncHandler {
    store: MarketStore,
    charts: Arc<ChartService>,
}

impl CandlesSyncHandler {
    pub fn new(store: MarketStore, charts: Arc<ChartService>) -> Self {
        Self { store, charts }
    }
}

#[async_trait]
impl JobHandler for CandlesSyncHandler {
    async fn handle(&self, _payload: serde_json::Value) -> Result<(), ServiceError> {
        let watchlist = self.store.watchlist().map_err(ServiceError::store)?;
        let mut refreshed = 0usize;
        let mut inserted_total = 0usize;

        for entry in watchlist.iter().filter(|e| e.fetch_candlesticks) {
            match self.charts.daily_chart(&entry.ticker_id).await {
                Ok((_, inserted)) => {
                    refreshed += 1;
                    inserted_total += inserted;
                }
                Err(ServiceError::NotFound(_)) => {
                    debug!(ticker = entry.ticker_id, "no candle history upstream");
                }
                Err(e) => return Err(e),
            }
        }

        info!(refreshed, inserted = inserted_total, "candle sweep complete");
        Ok(())
    }
}
