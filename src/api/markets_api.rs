//! Read-demand chart access and watchlist administration.

use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::charts::ChartPoint;
use crate::error::ServiceError;
use crate::models::HighPriorityMarket;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct ChartResponse {
    pub ticker: String,
    pub points: Vec<ChartPoint>,
}

/// Daily chart for one market; the missing tail is fetched differentially
/// before serving.
pub async fn get_market_chart(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
) -> Result<Json<ChartResponse>, ServiceError> {
    let (points, _) = state.charts.daily_chart(&ticker).await?;
    Ok(Json(ChartResponse { ticker, points }))
}

pub async fn get_watchlist(
    State(state): State<AppState>,
) -> Result<Json<Vec<HighPriorityMarket>>, ServiceError> {
    Ok(Json(state.store.watchlist().map_err(ServiceError::store)?))
}

/// Admin-only upsert of one watchlist entry.
pub async fn put_watchlist_entry(
    State(state): State<AppState>,
    Json(entry): Json<HighPriorityMarket>,
) -> Result<Json<Value>, ServiceError> {
    if entry.ticker_id.trim().is_empty() {
        return Err(ServiceError::InvalidRequest("empty ticker_id".into()));
    }
    state
        .store
        .upsert_watchlist(&entry)
        .map_err(ServiceError::store)?;
    Ok(Json(json!({"updated": true, "ticker_id": entry.ticker_id})))
}
