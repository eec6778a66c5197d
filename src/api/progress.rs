//! Progress API
//!
//! Backfill progress of the collected symbols, read straight from the store.

use crate::error::Result;
use crate::types::{Candle, MarketType, Progress, SymbolProgressReport};
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DEFAULT_RANGE_MS: i64 = 24 * 60 * 60 * 1000;

/// Query parameters for the candles endpoint (epoch ms, inclusive).
#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub from: Option<i64>,
    pub to: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandlesResponse {
    pub symbol: String,
    pub market_type: MarketType,
    pub timeframe: String,
    pub count: usize,
    pub candles: Vec<Candle>,
}

/// GET /progress
async fn all_progress(State(state): State<AppState>) -> Result<Json<BTreeMap<String, Progress>>> {
    Ok(Json(state.historical.get_all_symbols_progress().await?))
}

/// GET /progress/:marketType/:symbol
async fn symbol_progress(
    State(state): State<AppState>,
    Path((market_type, symbol)): Path<(String, String)>,
) -> Result<Json<SymbolProgressReport>> {
    let market_type: MarketType = market_type.parse()?;
    let progress = state.historical.get_progress(&symbol, market_type).await?;

    Ok(Json(SymbolProgressReport::build(
        symbol,
        market_type,
        progress,
        state.historical.start_timestamp_ms(),
        state.historical.now_ms(),
    )))
}

/// GET /candles/:marketType/:symbol?from=&to=
///
/// Defaults to the last 24 hours.
async fn candles(
    State(state): State<AppState>,
    Path((market_type, symbol)): Path<(String, String)>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<CandlesResponse>> {
    let market_type: MarketType = market_type.parse()?;
    let to = query.to.unwrap_or_else(|| state.historical.now_ms());
    let from = query.from.unwrap_or(to.saturating_sub(DEFAULT_RANGE_MS));

    let candles = state
        .historical
        .get_candles(&symbol, market_type, from, to)
        .await?;

    Ok(Json(CandlesResponse {
        symbol,
        market_type,
        timeframe: state.config.historical.timeframe.to_string(),
        count: candles.len(),
        candles,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/progress", get(all_progress))
        .route("/progress/:market_type/:symbol", get(symbol_progress))
        .route("/candles/:market_type/:symbol", get(candles))
}
