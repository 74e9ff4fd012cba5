//! Cleanup consumer: cascade delete of everything derived from one market.
//!
//! The enqueue-side scan lives in the dispatcher; this handler only executes
//! a single ticker's delete. Redelivering for an already-clean ticker removes
//! nothing.

use async_trait::async_trait;
use tracing::info;

use crate::bus::JobHandler;
use crate::dispatcher::TickerJob;
use crate::error::ServiceError;
use crate::store::MarketStore;

pub struct CleanupHandler {
    store: MarketStore,
}

impl CleanupHandler {
    pub fn new(store: MarketStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobHandler for CleanupHandler {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), ServiceError> {
        let job: TickerJob = serde_json::from_value(payload)
            .map_err(|e| ServiceError::InvalidRequest(format!("cleanup payload: {e}")))?;

        let removed = self
            .store
            .delete_market_cascade(&job.ticker)
            .map_err(ServiceError::store)?;
        if removed > 0 {
            info!(ticker = job.ticker, removed, "market data reclaimed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HighPriorityMarket;
    use crate::store::test_util::temp_store;
    use serde_json::json;

    #[tokio::test]
    async fn redelivery_is_a_no_op() {
        let (store, _dir) = temp_store();
        store
            .insert_snapshots(&[crate::models::tests::sample_snapshot()])
            .unwrap();
        store
            .upsert_watchlist(&HighPriorityMarket {
                ticker_id: "MKT-A".into(),
                priority: 1,
                enable_l1: true,
                enable_l2: true,
                enable_l3: true,
                fetch_candlesticks: true,
                fetch_orderbook: true,
            })
            .unwrap();

        let handler = CleanupHandler::new(store.clone());
        handler.handle(json!({"ticker": "MKT-A"})).await.unwrap();
        assert_eq!(store.snapshot_count("MKT-A").unwrap(), 0);
        assert!(store.watchlist().unwrap().is_empty());

        // Same message again: nothing left to delete, still Ok.
        handler.handle(json!({"ticker": "MKT-A"})).await.unwrap();
    }
}
