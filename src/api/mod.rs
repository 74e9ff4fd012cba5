//! HTTP control surface.
//!
//! Operators enqueue sync families, inspect their progress, and manage the
//! queues here. Enqueues answer 202, single-flight conflicts 409, a dead bus
//! 503; the full mapping lives on [`crate::error::ServiceError`].

mod markets_api;
mod queues_api;
mod sync_api;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::bus::SqliteBus;
use crate::charts::ChartService;
use crate::dispatcher::JobDispatcher;
use crate::store::MarketStore;

pub use markets_api::{get_market_chart, get_watchlist, put_watchlist_entry};
pub use queues_api::{get_queues_status, post_queues_purge};
pub use sync_api::{
    get_snapshot_sync_status, health_check, post_cleanup_scan, post_cleanup_ticker,
    post_process_analytics, post_sync_candlesticks, post_sync_categories, post_sync_event_detail,
    post_sync_events, post_sync_market_snapshots, post_sync_orderbook, post_sync_series,
};

/// State shared by every control handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: JobDispatcher,
    pub bus: SqliteBus,
    pub store: MarketStore,
    pub charts: Arc<ChartService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/sync/market-snapshots",
            post(post_sync_market_snapshots),
        )
        .route(
            "/sync/market-snapshots/status",
            get(get_snapshot_sync_status),
        )
        .route("/sync/categories", post(post_sync_categories))
        .route("/sync/series", post(post_sync_series))
        .route("/sync/events", post(post_sync_events))
        .route("/sync/event/:event_ticker", post(post_sync_event_detail))
        .route("/sync/orderbook", post(post_sync_orderbook))
        .route("/sync/candlesticks", post(post_sync_candlesticks))
        .route("/analytics", post(post_process_analytics))
        .route("/cleanup", post(post_cleanup_scan))
        .route("/cleanup/:ticker_id", post(post_cleanup_ticker))
        .route("/queues/purge", post(post_queues_purge))
        .route("/queues/status", get(get_queues_status))
        .route("/markets/:ticker/chart", get(get_market_chart))
        .route("/watchlist", get(get_watchlist).put(put_watchlist_entry))
        .with_state(state)
}
