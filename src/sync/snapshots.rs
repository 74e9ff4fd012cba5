//! Market-snapshot sync: cursor-paginated fan-out.
//!
//! Each message covers one page. A non-empty cursor in the response publishes
//! a continuation message carrying the same filters; the pending counter is
//! incremented before the publish and decremented when a message finishes,
//! so the single-flight lock releases exactly when the family drains.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{JobHandler, JobKind, SqliteBus};
use crate::dispatcher::{SnapshotSyncJob, SyncFamilyGuard};
use crate::error::{recovery_action, RecoveryAction, ServiceError};
use crate::models::{cents_to_dollars, MarketSnapshot, MarketStatus};
use crate::store::MarketStore;
use crate::upstream::{ApiMarket, ExchangeApi};

/// Map one wire market into a snapshot row captured at `fetched_at`.
pub fn snapshot_from_market(market: &ApiMarket, fetched_at: i64) -> MarketSnapshot {
    let series_key = market
        .event_ticker
        .clone()
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| market.ticker.clone());

    // The formatted dollar fields are re-derived from the cents; a
    // disagreeing upstream string is reported, not stored.
    if let Some(sent) = &market.yes_bid_dollars {
        let derived = cents_to_dollars(market.yes_bid);
        if sent != &derived {
            warn!(
                ticker = market.ticker,
                sent, derived, "upstream dollar string disagrees with cents"
            );
        }
    }

    MarketSnapshot {
        snapshot_id: Uuid::new_v4().to_string(),
        ticker: market.ticker.clone(),
        event_ticker: market.event_ticker.clone().filter(|t| !t.is_empty()),
        series_key,
        market_type: market.market_type.clone().unwrap_or_else(|| "binary".into()),
        title: market.title.clone().unwrap_or_default(),
        generate_date: fetched_at,
        yes_bid: market.yes_bid,
        yes_ask: market.yes_ask,
        no_bid: market.no_bid,
        no_ask: market.no_ask,
        last_price: market.last_price,
        previous_yes_bid: market.previous_yes_bid,
        previous_yes_ask: market.previous_yes_ask,
        previous_price: market.previous_price,
        volume: market.volume,
        volume_24h: market.volume_24h,
        open_interest: market.open_interest,
        liquidity: market.liquidity,
        notional_value: market.notional_value,
        close_time: market.close_time.map(|t| t.timestamp()),
        expiration_time: market.expiration_time.map(|t| t.timestamp()),
        status: market
            .status
            .as_deref()
            .map(MarketStatus::parse)
            .unwrap_or(MarketStatus::Open),
        settlement_value: market.settlement_value,
        result: market.result.clone().filter(|r| !r.is_empty()),
        rules_primary: market.rules_primary.clone(),
    }
}

pub struct SnapshotSyncHandler {
    store: MarketStore,
    bus: SqliteBus,
    api: Arc<dyn ExchangeApi>,
    guard: SyncFamilyGuard,
    page_limit: u32,
}

impl SnapshotSyncHandler {
    pub fn new(
        store: MarketStore,
        bus: SqliteBus,
        api: Arc<dyn ExchangeApi>,
        guard: SyncFamilyGuard,
        page_limit: u32,
    ) -> Self {
        Self {
            store,
            bus,
            api,
            guard,
            page_limit,
        }
    }

    async fn process(&self, job: &SnapshotSyncJob) -> Result<(), ServiceError> {
        let fetched_at = Utc::now().timestamp();
        let page = self
            .api
            .list_markets(&job.filter, job.cursor.as_deref(), self.page_limit)
            .await?;

        let snapshots: Vec<MarketSnapshot> = page
            .markets
            .iter()
            .map(|m| snapshot_from_market(m, fetched_at))
            .collect();
        let written = self
            .store
            .insert_snapshots(&snapshots)
            .map_err(ServiceError::store)?;
        info!(
            written,
            page = page.markets.len(),
            cursor = job.cursor.as_deref().unwrap_or(""),
            "snapshot page persisted"
        );

        if let Some(cursor) = page.cursor.filter(|c| !c.is_empty()) {
            let continuation = SnapshotSyncJob {
                filter: job.filter.clone(),
                cursor: Some(cursor),
            };
            let payload =
                serde_json::to_value(&continuation).map_err(ServiceError::internal)?;
            self.guard.job_added()?;
            if let Err(e) = self.bus.publish(JobKind::SyncMarketSnapshots, &payload) {
                // The continuation never made it onto the bus; undo its slot.
                let _ = self.guard.job_done();
                return Err(e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for SnapshotSyncHandler {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), ServiceError> {
        let job: SnapshotSyncJob = serde_json::from_value(payload)
            .map_err(|e| ServiceError::InvalidRequest(format!("snapshot payload: {e}")))?;

        let result = self.process(&job).await;

        // This message is finished for every outcome that will not be
        // redelivered; retried deliveries keep their pending slot.
        match &result {
            Ok(()) => {
                self.guard.job_done()?;
            }
            Err(err) => match recovery_action(err) {
                RecoveryAction::Retry | RecoveryAction::RetryOnce => {}
                _ => {
                    let _ = self.guard.job_done();
                }
            },
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::test_util::temp_bus;
    use crate::cache::CacheStore;
    use crate::dispatcher::{SNAPSHOT_COUNTER_KEY, SNAPSHOT_LOCK_KEY};
    use crate::store::test_util::temp_store;
    use crate::testing::MockExchange;
    use crate::upstream::MarketsPage;
    use serde_json::json;
    use tempfile::TempDir;

    fn wire_market(ticker: &str) -> ApiMarket {
        ApiMarket {
            ticker: ticker.into(),
            event_ticker: Some("EVT-A".into()),
            market_type: Some("binary".into()),
            title: Some("m".into()),
            yes_bid: 45,
            yes_ask: 47,
            no_bid: 53,
            no_ask: 55,
            last_price: 46,
            previous_yes_bid: 44,
            previous_yes_ask: 46,
            previous_price: 45,
            volume: 100,
            volume_24h: 50,
            open_interest: 10,
            liquidity: 1000,
            notional_value: 100,
            close_time: None,
            expiration_time: None,
            status: Some("open".into()),
            settlement_value: None,
            result: None,
            rules_primary: None,
            yes_bid_dollars: None,
            yes_ask_dollars: None,
        }
    }

    struct Fixture {
        handler: SnapshotSyncHandler,
        store: MarketStore,
        bus: crate::bus::SqliteBus,
        cache: CacheStore,
        guard: SyncFamilyGuard,
        mock: Arc<MockExchange>,
        _dirs: Vec<TempDir>,
    }

    fn fixture() -> Fixture {
        let (bus, d1) = temp_bus();
        let (store, d2) = temp_store();
        let d3 = TempDir::new().unwrap();
        let cache = CacheStore::new(d3.path().join("cache.db").to_str().unwrap()).unwrap();
        let guard = SyncFamilyGuard::new(
            cache.clone(),
            SNAPSHOT_LOCK_KEY,
            SNAPSHOT_COUNTER_KEY,
            1800,
        );
        let mock = Arc::new(MockExchange::default());
        let handler = SnapshotSyncHandler::new(
            store.clone(),
            bus.clone(),
            mock.clone(),
            guard.clone(),
            250,
        );
        Fixture {
            handler,
            store,
            bus,
            cache,
            guard,
            mock,
            _dirs: vec![d1, d2, d3],
        }
    }

    #[tokio::test]
    async fn cursor_fan_out_publishes_continuation_and_drains() {
        let f = fixture();
        f.mock.push_markets_page(Ok(MarketsPage {
            markets: vec![wire_market("MKT-1"), wire_market("MKT-2")],
            cursor: Some("c1".into()),
        }));
        f.mock.push_markets_page(Ok(MarketsPage {
            markets: vec![wire_market("MKT-3")],
            cursor: Some("".into()),
        }));

        // Operator enqueue: lock acquired, counter 1.
        f.guard.begin().unwrap();
        assert_eq!(f.cache.counter(SNAPSHOT_COUNTER_KEY).unwrap(), 1);

        // Page 1: two rows, one continuation with cursor "c1".
        f.handler.handle(json!({})).await.unwrap();
        assert_eq!(f.cache.counter(SNAPSHOT_COUNTER_KEY).unwrap(), 1);
        let pending = f.bus.reserve("sync-market-snapshots", 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["cursor"], "c1");

        // Page 2: empty cursor terminates; counter drains, lock releases.
        f.handler.handle(pending[0].payload.clone()).await.unwrap();
        assert_eq!(f.cache.counter(SNAPSHOT_COUNTER_KEY).unwrap(), 0);
        assert!(!f.cache.lock_held(SNAPSHOT_LOCK_KEY).unwrap());

        assert_eq!(f.store.snapshot_count("MKT-1").unwrap(), 1);
        assert_eq!(f.store.snapshot_count("MKT-2").unwrap(), 1);
        assert_eq!(f.store.snapshot_count("MKT-3").unwrap(), 1);

        // Second call resumed from the published cursor.
        assert_eq!(
            f.mock.markets_calls(),
            vec![None, Some("c1".to_string())]
        );
    }

    #[tokio::test]
    async fn rate_limit_drops_without_continuation() {
        let f = fixture();
        f.mock
            .push_markets_page(Err(ServiceError::RateLimitExceeded("429".into())));

        f.guard.begin().unwrap();
        let err = f.handler.handle(json!({})).await.unwrap_err();
        assert!(matches!(err, ServiceError::RateLimitExceeded(_)));

        // Dropped message still completes its pending slot; nothing queued.
        assert_eq!(f.cache.counter(SNAPSHOT_COUNTER_KEY).unwrap(), 0);
        assert!(f.bus.reserve("sync-market-snapshots", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_keeps_pending_slot() {
        let f = fixture();
        f.mock
            .push_markets_page(Err(ServiceError::TransientUpstream("timeout".into())));

        f.guard.begin().unwrap();
        let err = f.handler.handle(json!({})).await.unwrap_err();
        assert!(matches!(err, ServiceError::TransientUpstream(_)));

        // Redelivery will run the same message again; the family stays busy.
        assert_eq!(f.cache.counter(SNAPSHOT_COUNTER_KEY).unwrap(), 1);
        assert!(f.cache.lock_held(SNAPSHOT_LOCK_KEY).unwrap());
    }

    #[test]
    fn series_key_falls_back_to_ticker() {
        let mut market = wire_market("MKT-1");
        market.event_ticker = None;
        let snap = snapshot_from_market(&market, 100);
        assert_eq!(snap.series_key, "MKT-1");
        assert_eq!(snap.generate_date, 100);

        let with_event = snapshot_from_market(&wire_market("MKT-2"), 100);
        assert_eq!(with_event.series_key, "EVT-A");
    }
}
