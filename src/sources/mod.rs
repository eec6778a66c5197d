pub mod binance;

pub use binance::BinanceProvider;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::services::RateLimiterStats;
use crate::types::{Candle, MarketType, Timeframe};
use async_trait::async_trait;
use std::sync::Arc;

/// Fetch-by-time-window access to one market of an exchange.
#[async_trait]
pub trait ExchangeProvider: Send + Sync {
    fn market_type(&self) -> MarketType;

    /// Candles starting at `since_ms`, ascending. An empty vector means the
    /// exchange has no data for the window; that is not an error.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since_ms: i64,
        limit: Option<u32>,
    ) -> Result<Vec<Candle>>;

    /// Exchange-native symbols to collect for this market.
    async fn fetch_filtered_symbols(&self) -> Result<Vec<String>>;

    /// Counters of the provider's own request throttle, if it has one.
    fn rate_limiter_stats(&self) -> Option<RateLimiterStats> {
        None
    }
}

/// One provider per market type.
#[derive(Clone)]
pub struct ExchangeProviders {
    pub spot: Arc<dyn ExchangeProvider>,
    pub futures: Arc<dyn ExchangeProvider>,
}

impl ExchangeProviders {
    pub fn new(spot: Arc<dyn ExchangeProvider>, futures: Arc<dyn ExchangeProvider>) -> Self {
        Self { spot, futures }
    }

    /// Build the providers for the configured exchange.
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.exchange.name.to_lowercase().as_str() {
            "binance" => Ok(Self {
                spot: Arc::new(BinanceProvider::new(MarketType::Spot, config)?),
                futures: Arc::new(BinanceProvider::new(MarketType::Futures, config)?),
            }),
            other => Err(AppError::Config(format!("unsupported exchange '{}'", other))),
        }
    }

    pub fn get(&self, market_type: MarketType) -> &Arc<dyn ExchangeProvider> {
        match market_type {
            MarketType::Spot => &self.spot,
            MarketType::Futures => &self.futures,
        }
    }
}
