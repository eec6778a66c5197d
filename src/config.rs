use crate::error::{AppError, Result};
use crate::types::{MarketType, Timeframe};
use chrono::{DateTime, NaiveDate, Utc};
use std::env;

/// Exchanges with a provider implementation.
pub const SUPPORTED_EXCHANGES: &[&str] = &["binance"];

/// Largest page the exchange accepts for a single klines request.
pub const MAX_BATCH_SIZE: u32 = 1500;

/// Service identity and HTTP bind settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Default tracing level when `RUST_LOG` is unset.
    pub log_level: String,
}

/// Exchange connection and throttling settings.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub name: String,
    /// Budget for the token bucket and the sliding window.
    pub requests_per_minute: u32,
    /// Minimum gap between two requests, and the base politeness delay (ms).
    pub request_delay_ms: u64,
    /// Per-request HTTP timeout (ms).
    pub timeout_ms: u64,
}

/// Symbols collected for one market type.
#[derive(Debug, Clone)]
pub struct MarketSymbols {
    pub enabled: bool,
    /// Exchange-native symbols, e.g. `BTC/USDT` or `BTC/USDT:USDT`.
    pub symbols: Vec<String>,
}

/// Symbol universe selection.
#[derive(Debug, Clone)]
pub struct MarketConfig {
    /// Discover every listed market instead of using the fixed lists.
    pub all_symbols: bool,
    /// Only keep markets that are currently trading (discovery mode).
    pub active_only: bool,
    pub spot: MarketSymbols,
    pub futures: MarketSymbols,
}

impl MarketConfig {
    pub fn for_market(&self, market_type: MarketType) -> &MarketSymbols {
        match market_type {
            MarketType::Spot => &self.spot,
            MarketType::Futures => &self.futures,
        }
    }

    /// Enabled market types in a stable order (spot first).
    pub fn enabled_markets(&self) -> Vec<MarketType> {
        MarketType::ALL
            .into_iter()
            .filter(|mt| self.for_market(*mt).enabled)
            .collect()
    }
}

/// Backfill and update behaviour.
#[derive(Debug, Clone)]
pub struct HistoricalConfig {
    /// Raw `HISTORICAL_START_DATE` value, echoed by `/status`.
    pub start_date: String,
    pub timeframe: Timeframe,
    pub batch_size: u32,
    pub retry_attempts: u32,
    /// Base backoff delay (ms); doubles on each retry.
    pub retry_delay_ms: u64,
    /// Block the periodic loops until the initial backfill converges.
    pub backfill_first: bool,
    /// Multiplier over `request_delay_ms` slept after every backfill page.
    pub page_delay_multiplier: u32,
}

/// Periodic loop settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Update period (ms). Updates are phase-aligned to candle boundaries.
    pub update_interval_ms: u64,
    /// Backfill period (ms).
    pub backfill_interval_ms: u64,
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub service: ServiceConfig,
    pub exchange: ExchangeConfig,
    pub market: MarketConfig,
    pub historical: HistoricalConfig,
    pub scheduler: SchedulerConfig,
    /// Redis URL for the time-series store.
    pub redis_url: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            service: ServiceConfig {
                name: env::var("SERVICE_NAME")
                    .unwrap_or_else(|_| "historical-data-service".to_string()),
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_parse("PORT", 3001),
                log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            },
            exchange: ExchangeConfig {
                name: env::var("EXCHANGE_NAME").unwrap_or_else(|_| "binance".to_string()),
                requests_per_minute: env_parse("EXCHANGE_REQUESTS_PER_MINUTE", 300),
                request_delay_ms: env_parse("EXCHANGE_REQUEST_DELAY", 1000),
                timeout_ms: env_parse("EXCHANGE_TIMEOUT_MS", 30_000),
            },
            market: MarketConfig {
                all_symbols: env_bool("MARKET_ALL_SYMBOLS", false),
                active_only: env_bool("MARKET_ACTIVE_ONLY", true),
                spot: MarketSymbols {
                    enabled: env_bool("MARKET_SPOT_ENABLED", true),
                    symbols: env_list("MARKET_SPOT_SYMBOLS", &["BTC/USDT", "ETH/USDT"]),
                },
                futures: MarketSymbols {
                    enabled: env_bool("MARKET_FUTURES_ENABLED", true),
                    symbols: env_list(
                        "MARKET_FUTURES_SYMBOLS",
                        &["BTC/USDT:USDT", "ETH/USDT:USDT", "SOL/USDT:USDT"],
                    ),
                },
            },
            historical: HistoricalConfig {
                start_date: env::var("HISTORICAL_START_DATE")
                    .unwrap_or_else(|_| "2025-01-01".to_string()),
                timeframe: env::var("HISTORICAL_TIMEFRAME")
                    .ok()
                    .and_then(|v| Timeframe::parse(&v))
                    .unwrap_or_default(),
                batch_size: env_parse("HISTORICAL_BATCH_SIZE", 500),
                retry_attempts: env_parse("HISTORICAL_RETRY_ATTEMPTS", 3),
                retry_delay_ms: env_parse("HISTORICAL_RETRY_DELAY", 10_000),
                backfill_first: env_bool("HISTORICAL_BACKFILL_FIRST", true),
                page_delay_multiplier: env_parse("HISTORICAL_PAGE_DELAY_MULTIPLIER", 2),
            },
            scheduler: SchedulerConfig {
                enabled: env_bool("SCHEDULER_ENABLED", true),
                update_interval_ms: env_parse("SCHEDULER_INTERVAL", 300_000),
                backfill_interval_ms: env_parse("SCHEDULER_BACKFILL_INTERVAL", 3_600_000),
            },
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        }
    }

    /// Reject settings the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        let exchange = self.exchange.name.to_lowercase();
        if !SUPPORTED_EXCHANGES.contains(&exchange.as_str()) {
            return Err(AppError::Config(format!(
                "unsupported exchange '{}', supported: {:?}",
                self.exchange.name, SUPPORTED_EXCHANGES
            )));
        }

        parse_start_date(&self.historical.start_date)?;

        if self.historical.batch_size == 0 || self.historical.batch_size > MAX_BATCH_SIZE {
            return Err(AppError::Config(format!(
                "HISTORICAL_BATCH_SIZE must be in 1..={}, got {}",
                MAX_BATCH_SIZE, self.historical.batch_size
            )));
        }

        if self.historical.retry_attempts == 0 {
            return Err(AppError::Config(
                "HISTORICAL_RETRY_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        if self.exchange.requests_per_minute == 0 {
            return Err(AppError::Config(
                "EXCHANGE_REQUESTS_PER_MINUTE must be at least 1".to_string(),
            ));
        }

        if self.scheduler.update_interval_ms == 0 || self.scheduler.backfill_interval_ms == 0 {
            return Err(AppError::Config("scheduler intervals must be non-zero".to_string()));
        }

        Ok(())
    }

    /// Global backfill start in epoch milliseconds.
    pub fn start_timestamp_ms(&self) -> Result<i64> {
        parse_start_date(&self.historical.start_date)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Parse `YYYY-MM-DD` (UTC midnight) or an RFC 3339 timestamp.
pub fn parse_start_date(raw: &str) -> Result<i64> {
    let trimmed = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc().timestamp_millis());
        }
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
        .map_err(|e| AppError::Config(format!("invalid HISTORICAL_START_DATE '{}': {}", raw, e)))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    env::var(key)
        .ok()
        .map(|v| parse_list(&v))
        .filter(|list| !list.is_empty())
        .unwrap_or_else(|| default.iter().map(|s| s.to_string()).collect())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
