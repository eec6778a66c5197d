//! Historical candle backfill and incremental updates.
//!
//! A symbol's state lives entirely in the store: "how far along" is the last
//! stored timestamp and "complete" is recomputed from the series statistics
//! on every call. Nothing here caches either answer.

use crate::config::Config;
use crate::error::Result;
use crate::services::retry::{retry_with_backoff, RetryPolicy};
use crate::services::timeseries::{series_key_prefix, TimeSeriesStore};
use crate::services::{RateLimiterStats, SymbolNormalizer};
use crate::sources::{ExchangeProvider, ExchangeProviders};
use crate::types::{iso_millis, BackfillReport, Candle, MarketType, Progress, SeriesInfo, SymbolKey};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Series with fewer samples are never complete.
pub const MIN_SAMPLES: u64 = 100;
/// The newest candle must be at most this old for the series to be complete.
pub const FRESHNESS_WINDOW_MS: i64 = 2 * 60 * 60 * 1000;
/// Coverage gate, as a ratio `NUM / DEN` of the span since the first sample.
const COVERAGE_NUM: i64 = 9;
const COVERAGE_DEN: i64 = 10;
/// Density gate, as a ratio of the expected candle count.
const DENSITY_NUM: u64 = 7;
const DENSITY_DEN: u64 = 10;

const LISTING_PROBE_STRIDE_MS: i64 = 7 * 24 * 60 * 60 * 1000;
const LISTING_PROBE_LIMIT: u32 = 10;
const LISTING_PROBE_DELAY: Duration = Duration::from_millis(200);
/// Cursor advance after an empty page.
const GAP_SKIP_MS: i64 = 4 * 60 * 60 * 1000;
/// Update lookback when a symbol has no stored data.
const UPDATE_LOOKBACK_MS: i64 = 24 * 60 * 60 * 1000;
const PROGRESS_LOG_EVERY: u32 = 10;

/// Source of "now" in epoch milliseconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Result of the completeness check, carrying the first failing gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    Complete,
    MissingStats,
    TooFewSamples { samples: u64 },
    Stale { age_ms: i64 },
    InsufficientCoverage { actual_ms: i64, expected_ms: i64 },
    InsufficientDensity { samples: u64, expected: u64 },
}

impl Completeness {
    pub fn is_complete(&self) -> bool {
        matches!(self, Completeness::Complete)
    }
}

/// Decide whether a stored series is complete.
///
/// Coverage is measured against the series' own first sample, so symbols
/// listed after the configured start date are not penalised. All ratios use
/// integer arithmetic and the bounds are inclusive.
pub fn validate_data_completeness(info: &SeriesInfo, interval_ms: i64, now_ms: i64) -> Completeness {
    let (Some(samples), Some(first), Some(last)) =
        (info.total_samples, info.first_timestamp, info.last_timestamp)
    else {
        return Completeness::MissingStats;
    };
    if samples == 0 {
        return Completeness::MissingStats;
    }

    if samples < MIN_SAMPLES {
        return Completeness::TooFewSamples { samples };
    }

    if last < now_ms - FRESHNESS_WINDOW_MS {
        return Completeness::Stale {
            age_ms: now_ms - last,
        };
    }

    let actual_ms = last - first;
    let expected_ms = now_ms - first;
    if actual_ms * COVERAGE_DEN < expected_ms * COVERAGE_NUM {
        return Completeness::InsufficientCoverage {
            actual_ms,
            expected_ms,
        };
    }

    let expected = if interval_ms > 0 {
        (actual_ms / interval_ms).max(0) as u64
    } else {
        0
    };
    if expected > 0 && samples * DENSITY_DEN < expected * DENSITY_NUM {
        return Completeness::InsufficientDensity { samples, expected };
    }

    Completeness::Complete
}

/// Drives listing discovery, paginated backfill and incremental updates.
pub struct HistoricalDataService {
    config: Arc<Config>,
    providers: ExchangeProviders,
    store: Arc<dyn TimeSeriesStore>,
    clock: Clock,
    start_ms: i64,
    retry: RetryPolicy,
    symbol_locks: DashMap<SymbolKey, Arc<Mutex<()>>>,
}

impl HistoricalDataService {
    /// Create the service. Fails if the configured start date is invalid.
    pub fn new(
        config: Arc<Config>,
        providers: ExchangeProviders,
        store: Arc<dyn TimeSeriesStore>,
    ) -> Result<Self> {
        let start_ms = config.start_timestamp_ms()?;
        let retry = RetryPolicy::from_config(&config.historical);

        Ok(Self {
            config,
            providers,
            store,
            clock: Arc::new(|| Utc::now().timestamp_millis()),
            start_ms,
            retry,
            symbol_locks: DashMap::new(),
        })
    }

    /// Replace the wall clock, e.g. with a fixed instant.
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn now_ms(&self) -> i64 {
        (self.clock)()
    }

    /// Configured global start date (epoch ms).
    pub fn start_timestamp_ms(&self) -> i64 {
        self.start_ms
    }

    /// Length of one candle (ms).
    pub fn interval_ms(&self) -> i64 {
        self.config.historical.timeframe.duration_ms()
    }

    pub fn key_prefix(&self, symbol: &str, market_type: MarketType) -> String {
        series_key_prefix(
            &self.config.exchange.name,
            market_type,
            &SymbolNormalizer::normalize(symbol),
            self.config.historical.timeframe,
        )
    }

    fn provider(&self, market_type: MarketType) -> &Arc<dyn ExchangeProvider> {
        self.providers.get(market_type)
    }

    /// Request throttle counters of the market's exchange provider.
    pub fn rate_limiter_stats(&self, market_type: MarketType) -> Option<RateLimiterStats> {
        self.provider(market_type).rate_limiter_stats()
    }

    fn symbol_lock(&self, key: &SymbolKey) -> Arc<Mutex<()>> {
        self.symbol_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Exchange-native symbols collected for a market. Empty when disabled.
    pub async fn get_symbols(&self, market_type: MarketType) -> Result<Vec<String>> {
        if !self.config.market.for_market(market_type).enabled {
            return Ok(Vec::new());
        }
        self.provider(market_type).fetch_filtered_symbols().await
    }

    /// Stored progress of one symbol, recomputed from the series statistics.
    pub async fn get_progress(&self, symbol: &str, market_type: MarketType) -> Result<Progress> {
        let key_prefix = self.key_prefix(symbol, market_type);
        let info = self.store.get_time_series_info(&key_prefix).await?;

        if !info.exists || info.last_timestamp.is_none() {
            return Ok(Progress::default());
        }

        let verdict = validate_data_completeness(&info, self.interval_ms(), self.now_ms());
        if !verdict.is_complete() {
            debug!("{} incomplete: {:?}", key_prefix, verdict);
        }

        Ok(Progress {
            last_timestamp: info.last_timestamp,
            is_complete: verdict.is_complete(),
        })
    }

    /// Progress of every collected symbol, keyed `<market>:<SYMBOL>`.
    pub async fn get_all_symbols_progress(&self) -> Result<BTreeMap<String, Progress>> {
        let mut all = BTreeMap::new();

        for market_type in self.config.market.enabled_markets() {
            for symbol in self.get_symbols(market_type).await? {
                let key = SymbolKey::new(market_type, SymbolNormalizer::normalize(&symbol));
                let progress = self.get_progress(&symbol, market_type).await?;
                all.insert(key.to_string(), progress);
            }
        }

        Ok(all)
    }

    /// Stored candles in `[from_ms, to_ms]`.
    pub async fn get_candles(
        &self,
        symbol: &str,
        market_type: MarketType,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<Candle>> {
        let key_prefix = self.key_prefix(symbol, market_type);
        self.store.get_range(&key_prefix, from_ms, to_ms).await
    }

    /// Earliest candle at or after the configured start date.
    ///
    /// Probes forward a week at a time; probe errors only skip ahead. Falls
    /// back to the configured start date when nothing is found before now.
    pub async fn find_listing_date(&self, symbol: &str, market_type: MarketType) -> i64 {
        let provider = self.provider(market_type);
        let native = SymbolNormalizer::denormalize(symbol, market_type);
        let timeframe = self.config.historical.timeframe;
        let now = self.now_ms();
        let mut probe = self.start_ms;

        while probe < now {
            match provider
                .fetch_ohlcv(&native, timeframe, probe, Some(LISTING_PROBE_LIMIT))
                .await
            {
                Ok(candles) => {
                    if let Some(first) = candles.first() {
                        info!("{} {} listed at {}", market_type, native, iso_millis(first.timestamp));
                        return first.timestamp;
                    }
                    tokio::time::sleep(LISTING_PROBE_DELAY).await;
                }
                Err(e) => {
                    debug!("Listing probe for {} at {} failed: {}", native, probe, e);
                }
            }
            probe += LISTING_PROBE_STRIDE_MS;
        }

        debug!(
            "No data found for {} {}, using configured start date",
            market_type, native
        );
        self.start_ms
    }

    /// Page through history from the resume point up to now.
    ///
    /// A complete symbol is a no-op. Exhausted retries abort the whole call.
    pub async fn backfill_symbol(&self, symbol: &str, market_type: MarketType) -> Result<BackfillReport> {
        let canonical = SymbolNormalizer::normalize(symbol);
        let lock = self.symbol_lock(&SymbolKey::new(market_type, canonical.clone()));
        let _guard = lock.lock().await;

        let progress = self.get_progress(&canonical, market_type).await?;
        if progress.is_complete {
            debug!("{}:{} already complete", market_type, canonical);
            return Ok(BackfillReport {
                skipped: true,
                ..Default::default()
            });
        }

        let interval = self.interval_ms();
        let start_ms = match progress.last_timestamp {
            Some(last) => last + interval,
            None => self.find_listing_date(&canonical, market_type).await,
        };

        let provider = &**self.provider(market_type);
        let store = &*self.store;
        let native = SymbolNormalizer::denormalize(&canonical, market_type);
        let key_prefix = self.key_prefix(&canonical, market_type);
        let timeframe = self.config.historical.timeframe;
        let batch_size = self.config.historical.batch_size;
        let page_delay = Duration::from_millis(
            self.config.exchange.request_delay_ms
                * u64::from(self.config.historical.page_delay_multiplier),
        );
        let label = format!("backfill {}:{}", market_type, canonical);

        let now = self.now_ms();
        let total_range = (now - start_ms).max(1);
        let mut report = BackfillReport {
            start_ms,
            cursor_ms: start_ms,
            ..Default::default()
        };

        info!(
            "Backfilling {}:{} from {}",
            market_type,
            canonical,
            iso_millis(start_ms)
        );

        let (native, key_prefix) = (native.as_str(), key_prefix.as_str());
        while report.cursor_ms < now {
            let since = report.cursor_ms;
            report.requests += 1;

            let page = retry_with_backoff(self.retry, &label, move || async move {
                let candles = provider
                    .fetch_ohlcv(native, timeframe, since, Some(batch_size))
                    .await?;
                if !candles.is_empty() {
                    store.add_bulk_data(key_prefix, &candles).await?;
                }
                Ok(candles)
            })
            .await?;

            let Some(last) = page.last() else {
                report.cursor_ms += GAP_SKIP_MS;
                continue;
            };

            report.pages += 1;
            report.candles += page.len() as u64;
            report.cursor_ms = last.timestamp + interval;

            if report.requests % PROGRESS_LOG_EVERY == 0 {
                let pct = ((report.cursor_ms - start_ms) as f64 / total_range as f64 * 100.0).min(100.0);
                info!(
                    "{}:{} reached {} ({:.1}%)",
                    market_type,
                    canonical,
                    iso_millis(report.cursor_ms),
                    pct
                );
            }

            tokio::time::sleep(page_delay).await;
        }

        info!(
            "Backfill {}:{} finished: {} candles in {} pages ({} requests)",
            market_type, canonical, report.candles, report.pages, report.requests
        );
        Ok(report)
    }

    /// Fetch and store the candles after the newest stored one.
    ///
    /// Returns the number of candles written. A symbol that is busy (usually
    /// a backfill in flight, which runs up to now anyway) is skipped and
    /// reports 0.
    pub async fn update_symbol(&self, symbol: &str, market_type: MarketType) -> Result<usize> {
        let canonical = SymbolNormalizer::normalize(symbol);
        let lock = self.symbol_lock(&SymbolKey::new(market_type, canonical.clone()));
        let Ok(_guard) = lock.try_lock() else {
            info!(
                "Skipping update of {}:{}, another operation holds the symbol",
                market_type, canonical
            );
            return Ok(0);
        };

        let provider = &**self.provider(market_type);
        let store = &*self.store;
        let native = SymbolNormalizer::denormalize(&canonical, market_type);
        let key_prefix = self.key_prefix(&canonical, market_type);
        let timeframe = self.config.historical.timeframe;

        let since = match store.get_last_timestamp(&key_prefix).await? {
            Some(last) => last + self.interval_ms(),
            None => self.now_ms() - UPDATE_LOOKBACK_MS,
        };

        let label = format!("update {}:{}", market_type, canonical);
        let (native, key_prefix_ref) = (native.as_str(), key_prefix.as_str());
        let written = retry_with_backoff(self.retry, &label, move || async move {
            let candles = provider.fetch_ohlcv(native, timeframe, since, None).await?;
            if !candles.is_empty() {
                store.add_bulk_data(key_prefix_ref, &candles).await?;
            }
            Ok(candles.len())
        })
        .await?;

        debug!("Updated {} with {} candles", key_prefix, written);
        Ok(written)
    }
}
