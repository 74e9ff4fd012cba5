//! Queue consumers: one handler per job kind.
//!
//! Every handler is idempotent with respect to its payload; the bus may
//! redeliver. Rate-limit failures bubble up as `RateLimitExceeded` so the
//! worker runtime acks and drops them without retry.

pub mod candles;
pub mod dimensions;
pub mod event_detail;
pub mod orderbook;
pub mod snapshots;
pub mod tags;

use std::sync::Arc;
use tokio::sync::watch;

use crate::analytics::FeatureEngine;
use crate::bus::{spawn_worker, JobKind, SqliteBus, WorkerOptions};
use crate::charts::ChartService;
use crate::cleanup::CleanupHandler;
use crate::config::Config;
use crate::dispatcher::{JobDispatcher, TickerJob};
use crate::error::ServiceError;
use crate::store::MarketStore;
use crate::upstream::ExchangeApi;

use async_trait::async_trait;
use tracing::debug;

/// Analytics consumer: one feature row per watchlisted ticker message.
pub struct AnalyticsHandler {
    store: MarketStore,
    engine: FeatureEngine,
}

impl AnalyticsHandler {
    pub fn new(store: MarketStore) -> Self {
        let engine = FeatureEngine::new(store.clone());
        Self { store, engine }
    }
}

#[async_trait]
impl crate::bus::JobHandler for AnalyticsHandler {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), ServiceError> {
        let job: TickerJob = serde_json::from_value(payload)
            .map_err(|e| ServiceError::InvalidRequest(format!("analytics payload: {e}")))?;

        // Flags as of consume time; a vanished entry still gets L1.
        let entry = self
            .store
            .watchlist()
            .map_err(ServiceError::store)?
            .into_iter()
            .find(|e| e.ticker_id == job.ticker);
        let (l2, l3) = entry
            .map(|e| (e.enable_l2, e.enable_l3))
            .unwrap_or((false, false));

        let computed = self.engine.compute_and_store(&job.ticker, l2, l3)?;
        if computed.is_none() {
            debug!(ticker = job.ticker, "analytics skipped, no snapshots");
        }
        Ok(())
    }
}

/// Wire every consumer to its queue and start the workers. Returns the task
/// handles so the caller can await shutdown.
#[allow(clippy::too_many_arguments)]
pub fn spawn_consumers(
    cfg: &Config,
    store: MarketStore,
    bus: SqliteBus,
    api: Arc<dyn ExchangeApi>,
    dispatcher: JobDispatcher,
    chart_service: Arc<ChartService>,
    shutdown: watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let one_at_a_time = WorkerOptions {
        prefetch: cfg.queue_prefetch,
        batch_size: 1,
        poll_ms: cfg.queue_poll_ms,
    };
    let batched = WorkerOptions {
        prefetch: cfg.event_detail_batch,
        batch_size: cfg.event_detail_batch,
        poll_ms: cfg.queue_poll_ms,
    };

    vec![
        spawn_worker(
            bus.clone(),
            JobKind::SyncMarketSnapshots,
            Arc::new(snapshots::SnapshotSyncHandler::new(
                store.clone(),
                bus.clone(),
                api.clone(),
                dispatcher.snapshot_guard.clone(),
                cfg.market_page_limit,
            )),
            one_at_a_time,
            shutdown.clone(),
        ),
        spawn_worker(
            bus.clone(),
            JobKind::SyncMarketCategories,
            Arc::new(tags::TagsSyncHandler::new(store.clone(), api.clone())),
            one_at_a_time,
            shutdown.clone(),
        ),
        spawn_worker(
            bus.clone(),
            JobKind::SyncSeries,
            Arc::new(dimensions::SeriesSyncHandler::new(
                store.clone(),
                bus.clone(),
                api.clone(),
            )),
            one_at_a_time,
            shutdown.clone(),
        ),
        spawn_worker(
            bus.clone(),
            JobKind::SyncEvents,
            Arc::new(dimensions::EventsSyncHandler::new(
                store.clone(),
                bus.clone(),
                api.clone(),
            )),
            one_at_a_time,
            shutdown.clone(),
        ),
        spawn_worker(
            bus.clone(),
            JobKind::SyncEventDetail,
            Arc::new(event_detail::EventDetailHandler::new(
                store.clone(),
                api.clone(),
            )),
            batched,
            shutdown.clone(),
        ),
        spawn_worker(
            bus.clone(),
            JobKind::SyncOrderbook,
            Arc::new(orderbook::OrderbookSyncHandler::new(
                store.clone(),
                api.clone(),
            )),
            one_at_a_time,
            shutdown.clone(),
        ),
        spawn_worker(
            bus.clone(),
            JobKind::SyncCandlesticks,
            Arc::new(candles::CandlesSyncHandler::new(
                store.clone(),
                chart_service,
            )),
            one_at_a_time,
            shutdown.clone(),
        ),
        spawn_worker(
            bus.clone(),
            JobKind::ProcessAnalytics,
            Arc::new(AnalyticsHandler::new(store.clone())),
            one_at_a_time,
            shutdown.clone(),
        ),
        spawn_worker(
            bus,
            JobKind::CleanupMarket,
            Arc::new(CleanupHandler::new(store)),
            one_at_a_time,
            shutdown,
        ),
    ]
}
