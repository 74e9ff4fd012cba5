//! Enqueue and status handlers for the sync families.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::dispatcher::FamilyStatus;
use crate::error::ServiceError;
use crate::upstream::MarketsFilter;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct SnapshotSyncQuery {
    #[serde(rename = "minCreatedTs")]
    pub min_created_ts: Option<i64>,
    #[serde(rename = "maxCreatedTs")]
    pub max_created_ts: Option<i64>,
    pub status: Option<String>,
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub started: bool,
    pub family: &'static str,
    pub enqueued_at: String,
}

fn accepted(family: &'static str) -> (StatusCode, Json<EnqueueResponse>) {
    (
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            started: true,
            family,
            enqueued_at: Utc::now().to_rfc3339(),
        }),
    )
}

pub async fn health_check() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn post_sync_market_snapshots(
    State(state): State<AppState>,
    Query(query): Query<SnapshotSyncQuery>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ServiceError> {
    if let (Some(min), Some(max)) = (query.min_created_ts, query.max_created_ts) {
        if min > max {
            return Err(ServiceError::InvalidRequest(
                "minCreatedTs is after maxCreatedTs".into(),
            ));
        }
    }

    let filter = MarketsFilter {
        min_created_ts: query.min_created_ts,
        max_created_ts: query.max_created_ts,
        status: query.status,
    };
    state
        .dispatcher
        .enqueue_market_snapshots(filter, query.cursor)?;
    Ok(accepted("market-snapshots"))
}

pub async fn get_snapshot_sync_status(
    State(state): State<AppState>,
) -> Result<Json<FamilyStatus>, ServiceError> {
    Ok(Json(state.dispatcher.snapshot_status()?))
}

pub async fn post_sync_categories(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ServiceError> {
    state.dispatcher.enqueue_categories()?;
    Ok(accepted("categories"))
}

#[derive(Debug, Deserialize)]
pub struct CursorQuery {
    pub cursor: Option<String>,
}

pub async fn post_sync_series(
    State(state): State<AppState>,
    Query(query): Query<CursorQuery>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ServiceError> {
    state.dispatcher.enqueue_series(query.cursor)?;
    Ok(accepted("series"))
}

pub async fn post_sync_events(
    State(state): State<AppState>,
    Query(query): Query<CursorQuery>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ServiceError> {
    state.dispatcher.enqueue_events(query.cursor)?;
    Ok(accepted("events"))
}

pub async fn post_sync_event_detail(
    State(state): State<AppState>,
    Path(event_ticker): Path<String>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ServiceError> {
    state.dispatcher.enqueue_event_detail(&event_ticker)?;
    Ok(accepted("event-detail"))
}

pub async fn post_sync_orderbook(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ServiceError> {
    state.dispatcher.enqueue_orderbook()?;
    Ok(accepted("orderbook"))
}

pub async fn post_sync_candlesticks(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ServiceError> {
    state.dispatcher.enqueue_candlesticks()?;
    Ok(accepted("candlesticks"))
}

pub async fn post_process_analytics(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<Value>), ServiceError> {
    let queued = state.dispatcher.enqueue_analytics()?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"tickers_queued": queued})),
    ))
}

pub async fn post_cleanup_scan(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<Value>), ServiceError> {
    let queued = state.dispatcher.enqueue_cleanup_scan()?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"markets_queued": queued})),
    ))
}

pub async fn post_cleanup_ticker(
    State(state): State<AppState>,
    Path(ticker_id): Path<String>,
) -> Result<Json<Value>, ServiceError> {
    state.dispatcher.enqueue_cleanup_ticker(&ticker_id)?;
    Ok(Json(json!({"queued": true, "ticker": ticker_id})))
}
