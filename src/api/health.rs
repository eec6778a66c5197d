use crate::services::{RateLimiterStats, SchedulerStatus};
use crate::types::MarketType;
use crate::AppState;
use axum::{extract::State, routing::get, Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    version: &'static str,
    timestamp: String,
    /// Seconds since the process started.
    uptime: f64,
    scheduler: SchedulerStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MarketStatus {
    enabled: bool,
    symbols: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigEcho {
    exchange: String,
    timeframe: String,
    start_date: String,
    batch_size: u32,
    all_symbols: bool,
    spot: MarketStatus,
    futures: MarketStatus,
}

/// Outbound throttle counters per market.
#[derive(Serialize)]
struct RateLimiterEcho {
    spot: Option<RateLimiterStats>,
    futures: Option<RateLimiterStats>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    scheduler: SchedulerStatus,
    config: ConfigEcho,
    rate_limiter: RateLimiterEcho,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: state.config.service.name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        uptime: state.started_at.elapsed().as_secs_f64(),
        scheduler: state.scheduler.status(),
    })
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let config = &state.config;
    let market = |m: &crate::config::MarketSymbols| MarketStatus {
        enabled: m.enabled,
        symbols: m.symbols.clone(),
    };

    Json(StatusResponse {
        scheduler: state.scheduler.status(),
        config: ConfigEcho {
            exchange: config.exchange.name.clone(),
            timeframe: config.historical.timeframe.to_string(),
            start_date: config.historical.start_date.clone(),
            batch_size: config.historical.batch_size,
            all_symbols: config.market.all_symbols,
            spot: market(&config.market.spot),
            futures: market(&config.market.futures),
        },
        rate_limiter: RateLimiterEcho {
            spot: state.historical.rate_limiter_stats(MarketType::Spot),
            futures: state.historical.rate_limiter_stats(MarketType::Futures),
        },
    })
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
}
