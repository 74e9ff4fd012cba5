//! End-to-end pipeline tests: dispatcher -> bus -> consumers -> store, with
//! a scripted exchange standing in for upstream.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;

use marketsync_backend::bus::{RetryPolicy, SqliteBus};
use marketsync_backend::cache::CacheStore;
use marketsync_backend::charts::ChartService;
use marketsync_backend::config::Config;
use marketsync_backend::dispatcher::JobDispatcher;
use marketsync_backend::error::ServiceError;
use marketsync_backend::store::MarketStore;
use marketsync_backend::sync::spawn_consumers;
use marketsync_backend::testing::MockExchange;
use marketsync_backend::upstream::{
    ApiEvent, ApiMarket, EventDetail, MarketsFilter, MarketsPage,
};

struct Harness {
    store: MarketStore,
    bus: SqliteBus,
    dispatcher: JobDispatcher,
    mock: Arc<MockExchange>,
    shutdown: watch::Sender<bool>,
    workers: Vec<tokio::task::JoinHandle<()>>,
    _dir: TempDir,
}

fn wire_market(ticker: &str) -> ApiMarket {
    ApiMarket {
        ticker: ticker.into(),
        event_ticker: Some("EVT-A".into()),
        market_type: Some("binary".into()),
        title: Some("market".into()),
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
        liquidity: 1_000,
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

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pipeline.db");
    let path = path.to_str().unwrap();

    let retry = RetryPolicy {
        max_attempts: 3,
        backoff_base_ms: 5,
        backoff_cap_ms: 20,
        visibility_timeout_ms: 60_000,
    };

    let store = MarketStore::new(path).unwrap();
    let cache = CacheStore::new(path).unwrap();
    let bus = SqliteBus::new(path, retry).unwrap();
    let mock = Arc::new(MockExchange::default());

    let dispatcher = JobDispatcher::new(bus.clone(), store.clone(), cache, 1_800, 30);
    let charts = Arc::new(ChartService::new(store.clone(), mock.clone(), 86_400, 30));

    let cfg = Config {
        queue_poll_ms: 10,
        ..Config::default()
    };

    let (shutdown, shutdown_rx) = watch::channel(false);
    let workers = spawn_consumers(
        &cfg,
        store.clone(),
        bus.clone(),
        mock.clone(),
        dispatcher.clone(),
        charts,
        shutdown_rx,
    );

    Harness {
        store,
        bus,
        dispatcher,
        mock,
        shutdown,
        workers,
        _dir: dir,
    }
}

impl Harness {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
    }

    async fn wait_until<F: Fn() -> bool>(&self, what: &str, cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {what}");
    }
}

#[tokio::test]
async fn cursor_fan_out_persists_all_pages_and_drains() {
    let h = harness();
    h.mock.push_markets_page(Ok(MarketsPage {
        markets: vec![wire_market("MKT-1"), wire_market("MKT-2")],
        cursor: Some("c1".into()),
    }));
    h.mock.push_markets_page(Ok(MarketsPage {
        markets: vec![wire_market("MKT-3")],
        cursor: Some("".into()),
    }));

    h.dispatcher
        .enqueue_market_snapshots(MarketsFilter::default(), None)
        .unwrap();

    h.wait_until("snapshot sweep to drain", || {
        !h.dispatcher.snapshot_status().unwrap().is_running
    })
    .await;

    assert_eq!(h.store.snapshot_count("MKT-1").unwrap(), 1);
    assert_eq!(h.store.snapshot_count("MKT-2").unwrap(), 1);
    assert_eq!(h.store.snapshot_count("MKT-3").unwrap(), 1);

    // Page two was fetched with the published continuation cursor.
    assert_eq!(h.mock.markets_calls(), vec![None, Some("c1".to_string())]);

    let status = h.dispatcher.snapshot_status().unwrap();
    assert_eq!(status.pending_jobs, 0);
    assert_eq!(
        h.bus.stats("sync-market-snapshots").unwrap().messages,
        0
    );

    h.stop().await;
}

#[tokio::test]
async fn rate_limited_event_detail_is_dropped_others_proceed() {
    let h = harness();
    h.mock.push_event_detail(
        "EVT-A",
        Err(ServiceError::RateLimitExceeded("429".into())),
    );
    h.mock.push_event_detail(
        "EVT-B",
        Ok(EventDetail {
            event: ApiEvent {
                event_ticker: "EVT-B".into(),
                series_ticker: Some("SER-B".into()),
                title: Some("event".into()),
                category: Some("Economics".into()),
                strike_date: None,
                strike_period: None,
                mutually_exclusive: Some(false),
            },
            markets: vec![],
        }),
    );

    h.dispatcher.enqueue_event_detail("EVT-A").unwrap();
    h.dispatcher.enqueue_event_detail("EVT-B").unwrap();

    h.wait_until("event-detail queue to drain", || {
        h.bus.stats("sync-event-detail").unwrap().messages == 0
    })
    .await;

    // EVT-A dropped without retry or dead-letter; EVT-B landed.
    assert_eq!(h.mock.event_detail_calls().len(), 2);
    assert_eq!(h.bus.dead_letter_count("sync-event-detail").unwrap(), 0);
    assert!(h.store.get_event("EVT-B").unwrap().is_some());
    assert!(h.store.get_event("EVT-A").unwrap().is_none());

    h.stop().await;
}

#[tokio::test]
async fn single_flight_conflict_then_recovery() {
    let h = harness();
    // One page, no continuation.
    h.mock.push_markets_page(Ok(MarketsPage {
        markets: vec![wire_market("MKT-1")],
        cursor: None,
    }));

    let first = h
        .dispatcher
        .enqueue_market_snapshots(MarketsFilter::default(), None);
    let second = h
        .dispatcher
        .enqueue_market_snapshots(MarketsFilter::default(), None);

    // Exactly one of the two concurrent requests is accepted.
    assert!(first.is_ok());
    assert!(matches!(
        second.unwrap_err(),
        ServiceError::AlreadyInProgress(_)
    ));

    h.wait_until("first sweep to drain", || {
        !h.dispatcher.snapshot_status().unwrap().is_running
    })
    .await;

    // A third call after the drain is accepted again.
    h.mock.push_markets_page(Ok(MarketsPage {
        markets: vec![],
        cursor: None,
    }));
    h.dispatcher
        .enqueue_market_snapshots(MarketsFilter::default(), None)
        .unwrap();

    h.wait_until("second sweep to drain", || {
        !h.dispatcher.snapshot_status().unwrap().is_running
    })
    .await;

    h.stop().await;
}

#[tokio::test]
async fn cleanup_job_reclaims_market_rows() {
    let h = harness();

    // Seed one settled market directly through the snapshot consumer path.
    let mut settled = wire_market("MKT-OLD");
    settled.status = Some("finalized".into());
    h.mock.push_markets_page(Ok(MarketsPage {
        markets: vec![settled],
        cursor: None,
    }));
    h.dispatcher
        .enqueue_market_snapshots(MarketsFilter::default(), None)
        .unwrap();
    h.wait_until("seed sweep to drain", || {
        h.store.snapshot_count("MKT-OLD").unwrap() == 1
    })
    .await;

    h.dispatcher.enqueue_cleanup_ticker("MKT-OLD").unwrap();
    h.wait_until("cleanup to run", || {
        h.store.snapshot_count("MKT-OLD").unwrap() == 0
    })
    .await;

    // Redelivery of the same cleanup is a no-op.
    h.dispatcher.enqueue_cleanup_ticker("MKT-OLD").unwrap();
    h.wait_until("second cleanup to drain", || {
        h.bus.stats("cleanup-market").unwrap().messages == 0
    })
    .await;
    assert_eq!(h.bus.dead_letter_count("cleanup-market").unwrap(), 0);

    h.stop().await;
}
