//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use candlekeeper::config::Config;
use candlekeeper::error::{AppError, Result};
use candlekeeper::services::{HistoricalDataService, MemoryTimeSeriesStore, TimeSeriesStore};
use candlekeeper::sources::{ExchangeProvider, ExchangeProviders};
use candlekeeper::types::{Candle, MarketType, SeriesInfo, Timeframe};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// 2025-01-01T00:00:00Z
pub const START: i64 = 1_735_689_600_000;
pub const DAY: i64 = 24 * 60 * 60 * 1000;
pub const HOUR: i64 = 60 * 60 * 1000;
pub const INTERVAL: i64 = 5 * 60 * 1000;

pub fn test_config() -> Config {
    let mut config = Config::from_env();
    config.exchange.name = "binance".to_string();
    config.exchange.requests_per_minute = 1200;
    config.exchange.request_delay_ms = 100;
    config.market.all_symbols = false;
    config.market.active_only = true;
    config.market.spot.enabled = true;
    config.market.spot.symbols = vec!["BTC/USDT".to_string()];
    config.market.futures.enabled = false;
    config.market.futures.symbols = vec!["BTC/USDT:USDT".to_string()];
    config.historical.start_date = "2025-01-01".to_string();
    config.historical.timeframe = Timeframe::FiveMinutes;
    config.historical.batch_size = 500;
    config.historical.retry_attempts = 3;
    config.historical.retry_delay_ms = 1000;
    config.historical.backfill_first = false;
    config.historical.page_delay_multiplier = 2;
    config.scheduler.enabled = true;
    config.scheduler.update_interval_ms = 300_000;
    config.scheduler.backfill_interval_ms = 3_600_000;
    config
}

/// `count` flat candles spaced one interval apart from `start`.
pub fn candles(start: i64, count: usize) -> Vec<Candle> {
    (0..count)
        .map(|i| {
            let price = 100.0 + i as f64;
            Candle {
                timestamp: start + i as i64 * INTERVAL,
                open: price,
                high: price + 1.0,
                low: price - 1.0,
                close: price,
                volume: 10.0,
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub symbol: String,
    pub since: i64,
    pub limit: Option<u32>,
}

/// Exchange serving a fixed candle set, honouring `since` and `limit`.
pub struct MockExchange {
    market_type: MarketType,
    candles: Vec<Candle>,
    symbols: Vec<String>,
    failures_left: AtomicU32,
    always_fail: bool,
    calls: Mutex<Vec<FetchCall>>,
}

impl MockExchange {
    pub fn new(market_type: MarketType) -> Self {
        Self {
            market_type,
            candles: Vec::new(),
            symbols: Vec::new(),
            failures_left: AtomicU32::new(0),
            always_fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_candles(mut self, candles: Vec<Candle>) -> Self {
        self.candles = candles;
        self
    }

    pub fn with_symbols(mut self, symbols: &[&str]) -> Self {
        self.symbols = symbols.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Fail the next `n` fetches, then serve normally.
    pub fn failing_first(self, n: u32) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn always_failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ExchangeProvider for MockExchange {
    fn market_type(&self) -> MarketType {
        self.market_type
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        since_ms: i64,
        limit: Option<u32>,
    ) -> Result<Vec<Candle>> {
        self.calls.lock().unwrap().push(FetchCall {
            symbol: symbol.to_string(),
            since: since_ms,
            limit,
        });

        let should_fail = self.always_fail
            || self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if should_fail {
            return Err(AppError::ExchangeFetch {
                symbol: symbol.to_string(),
                message: "mock failure".to_string(),
            });
        }

        Ok(self
            .candles
            .iter()
            .filter(|c| c.timestamp >= since_ms)
            .take(limit.unwrap_or(1000) as usize)
            .copied()
            .collect())
    }

    async fn fetch_filtered_symbols(&self) -> Result<Vec<String>> {
        Ok(self.symbols.clone())
    }
}

/// Memory store that counts bulk writes.
#[derive(Default)]
pub struct CountingStore {
    pub inner: MemoryTimeSeriesStore,
    writes: AtomicUsize,
}

impl CountingStore {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TimeSeriesStore for CountingStore {
    async fn add_bulk_data(&self, key_prefix: &str, candles: &[Candle]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.add_bulk_data(key_prefix, candles).await
    }

    async fn get_last_timestamp(&self, key_prefix: &str) -> Result<Option<i64>> {
        self.inner.get_last_timestamp(key_prefix).await
    }

    async fn get_time_series_info(&self, key_prefix: &str) -> Result<SeriesInfo> {
        self.inner.get_time_series_info(key_prefix).await
    }

    async fn get_range(&self, key_prefix: &str, from_ms: i64, to_ms: i64) -> Result<Vec<Candle>> {
        self.inner.get_range(key_prefix, from_ms, to_ms).await
    }
}

/// Historical service over the given mocks with a fixed clock.
pub fn service(
    config: Config,
    spot: Arc<MockExchange>,
    futures: Arc<MockExchange>,
    store: Arc<CountingStore>,
    now: i64,
) -> HistoricalDataService {
    let providers = ExchangeProviders::new(spot, futures);
    HistoricalDataService::new(Arc::new(config), providers, store)
        .unwrap()
        .with_clock(move || now)
}
