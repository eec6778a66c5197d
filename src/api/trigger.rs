//! Manual trigger API
//!
//! Single-symbol backfill/update and full scheduler passes, run synchronously.

use crate::error::Result;
use crate::services::{PassOutcome, PassSummary};
use crate::types::{BackfillReport, MarketType};
use crate::AppState;
use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillResponse {
    pub success: bool,
    pub symbol: String,
    pub market_type: MarketType,
    pub report: BackfillReport,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResponse {
    pub success: bool,
    pub symbol: String,
    pub market_type: MarketType,
    /// Candles written by this update.
    pub candles: usize,
}

#[derive(Debug, Serialize)]
pub struct PassResponse {
    pub success: bool,
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<PassSummary>,
}

impl PassResponse {
    fn from_outcome(outcome: PassOutcome, done: &'static str, busy: &'static str) -> Self {
        match outcome {
            PassOutcome::Completed(summary) => Self {
                success: true,
                action: done,
                summary: Some(summary),
            },
            PassOutcome::AlreadyRunning => Self {
                success: true,
                action: busy,
                summary: None,
            },
        }
    }
}

/// POST /backfill/:marketType/:symbol
async fn backfill_symbol(
    State(state): State<AppState>,
    Path((market_type, symbol)): Path<(String, String)>,
) -> Result<Json<BackfillResponse>> {
    let market_type: MarketType = market_type.parse()?;
    info!("Manual backfill requested for {}:{}", market_type, symbol);
    let report = state.historical.backfill_symbol(&symbol, market_type).await?;

    Ok(Json(BackfillResponse {
        success: true,
        symbol,
        market_type,
        report,
    }))
}

/// POST /update/:marketType/:symbol
async fn update_symbol(
    State(state): State<AppState>,
    Path((market_type, symbol)): Path<(String, String)>,
) -> Result<Json<UpdateResponse>> {
    let market_type: MarketType = market_type.parse()?;
    let candles = state.historical.update_symbol(&symbol, market_type).await?;

    Ok(Json(UpdateResponse {
        success: true,
        symbol,
        market_type,
        candles,
    }))
}

/// POST /scheduler/backfill
async fn scheduler_backfill(State(state): State<AppState>) -> Json<PassResponse> {
    let outcome = state.scheduler.run_backfill_once().await;
    Json(PassResponse::from_outcome(
        outcome,
        "backfill_started",
        "backfill_already_running",
    ))
}

/// POST /scheduler/update
async fn scheduler_update(State(state): State<AppState>) -> Json<PassResponse> {
    let outcome = state.scheduler.run_update_once().await;
    Json(PassResponse::from_outcome(
        outcome,
        "update_completed",
        "update_already_running",
    ))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/backfill/:market_type/:symbol", post(backfill_symbol))
        .route("/update/:market_type/:symbol", post(update_symbol))
        .route("/scheduler/backfill", post(scheduler_backfill))
        .route("/scheduler/update", post(scheduler_update))
}
