//! Orderbook sync: snapshot-then-diff for every watchlisted market with
//! book fetching enabled.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::bus::JobHandler;
use crate::error::ServiceError;
use crate::models::{BookLevel, OrderbookSnapshot};
use crate::orderbook::diff_snapshots;
use crate::store::MarketStore;
use crate::upstream::{ApiOrderbook, ExchangeApi};

const BOOK_DEPTH: u32 = 32;

fn levels_from_wire(wire: &[[i64; 2]]) -> Vec<BookLevel> {
    wire.iter()
        .map(|&[price, size]| BookLevel { price, size })
        .collect()
}

pub fn snapshot_from_book(
    market_id: &str,
    captured_at: i64,
    book: &ApiOrderbook,
) -> OrderbookSnapshot {
    OrderbookSnapshot::from_ladders(
        market_id,
        captured_at,
        levels_from_wire(&book.yes),
        levels_from_wire(&book.no),
    )
}

pub struct OrderbookSyncHandler {
    store: MarketStore,
    api: Arc<dyn ExchangeApi>,
}

impl OrderbookSyncHandler {
    pub fn new(store: MarketStore, api: Arc<dyn ExchangeApi>) -> Self {
        Self { store, api }
    }
}

#[async_trait]
impl JobHandler for OrderbookSyncHandler {
    async fn handle(&self, _payload: serde_json::Value) -> Result<(), ServiceError> {
        // Watchlist as of job start.
        let watchlist = self.store.watchlist().map_err(ServiceError::store)?;
        let mut captured = 0usize;
        let mut events_total = 0usize;

        for entry in watchlist.iter().filter(|e| e.fetch_orderbook) {
            let book = match self.api.get_orderbook(&entry.ticker_id, BOOK_DEPTH).await {
                Ok(book) => book,
                Err(ServiceError::NotFound(_)) => {
                    debug!(ticker = entry.ticker_id, "no orderbook upstream");
                    continue;
                }
                // Rate limits and transient errors abort the whole job and
                // take its queue policy.
                Err(e) => return Err(e),
            };

            let captured_at = Utc::now().timestamp();
            let snapshot = snapshot_from_book(&entry.ticker_id, captured_at, &book);

            // Prior snapshot first, then persist, then the diff events.
            let prior = self
                .store
                .latest_orderbook_snapshot(&entry.ticker_id, Some(captured_at))
                .map_err(ServiceError::store)?;
            self.store
                .insert_orderbook_snapshot(&snapshot)
                .map_err(ServiceError::store)?;

            if let Some(prior) = prior {
                let events = diff_snapshots(&prior, &snapshot);
                events_total += self
                    .store
                    .insert_orderbook_events(&events)
                    .map_err(ServiceError::store)?;
            }
            captured += 1;
        }

        info!(captured, events = events_total, "orderbook sweep complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BookEventType, HighPriorityMarket};
    use crate::store::test_util::temp_store;
    use crate::testing::MockExchange;
    use serde_json::json;

    fn watch(store: &MarketStore, ticker: &str, fetch_orderbook: bool) {
        store
            .upsert_watchlist(&HighPriorityMarket {
                ticker_id: ticker.into(),
                priority: 1,
                enable_l1: true,
                enable_l2: false,
                enable_l3: true,
                fetch_candlesticks: false,
                fetch_orderbook,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn first_capture_has_no_events_second_diffs() {
        let (store, _dir) = temp_store();
        watch(&store, "MKT-A", true);
        watch(&store, "MKT-OFF", false);

        let mock = Arc::new(MockExchange::default());
        mock.push_orderbook(
            "MKT-A",
            Ok(ApiOrderbook {
                yes: vec![[40, 10], [41, 5]],
                no: vec![[55, 3]],
            }),
        );
        mock.push_orderbook(
            "MKT-A",
            Ok(ApiOrderbook {
                yes: vec![[40, 10], [42, 7]],
                no: vec![[55, 3]],
            }),
        );

        let handler = OrderbookSyncHandler::new(store.clone(), mock);
        handler.handle(json!({})).await.unwrap();

        // First sweep: snapshot stored, nothing to diff against.
        assert!(store.latest_orderbook_snapshot("MKT-A", None).unwrap().is_some());
        assert!(store.orderbook_events_for_market("MKT-A").unwrap().is_empty());

        // Captures are keyed by second; make sure the next one lands later.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        handler.handle(json!({})).await.unwrap();

        let events = store.orderbook_events_for_market("MKT-A").unwrap();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .any(|e| e.kind == BookEventType::Remove && e.price == 41 && e.size == 0));
        assert!(events
            .iter()
            .any(|e| e.kind == BookEventType::Add && e.price == 42 && e.size == 7));
    }

    #[tokio::test]
    async fn missing_book_is_skipped() {
        let (store, _dir) = temp_store();
        watch(&store, "MKT-GONE", true);

        let mock = Arc::new(MockExchange::default());
        let handler = OrderbookSyncHandler::new(store.clone(), mock);
        handler.handle(json!({})).await.unwrap();

        assert!(store
            .latest_orderbook_snapshot("MKT-GONE", None)
            .unwrap()
            .is_none());
    }
}
