//! Binance public REST provider for spot and USDT-margined futures klines.

use crate::config::{Config, MarketSymbols};
use crate::error::{AppError, Result};
use crate::services::{RateLimiter, RateLimiterStats, SymbolNormalizer};
use crate::sources::ExchangeProvider;
use crate::types::{Candle, MarketType, Timeframe};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

const SPOT_API_URL: &str = "https://api.binance.com";
const FUTURES_API_URL: &str = "https://fapi.binance.com";

const SPOT_MAX_LIMIT: u32 = 1000;
const FUTURES_MAX_LIMIT: u32 = 1500;
const DEFAULT_LIMIT: u32 = 500;

const MIN_RATE_LIMIT_SLEEP: Duration = Duration::from_millis(1);
/// Characters of an error body kept in the log line.
const ERROR_BODY_LOG_CHARS: usize = 200;

/// Binance `exchangeInfo` response (only the fields we filter on).
#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<MarketInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketInfo {
    status: String,
    base_asset: String,
    quote_asset: String,
    #[serde(default)]
    margin_asset: Option<String>,
    #[serde(default)]
    contract_type: Option<String>,
    #[serde(default = "default_true")]
    is_spot_trading_allowed: bool,
}

fn default_true() -> bool {
    true
}

impl MarketInfo {
    fn is_trading(&self) -> bool {
        self.status == "TRADING"
    }

    /// Native `BASE/QUOTE[:SETTLE]` symbol if this market is collectable.
    fn collectable_symbol(&self, market_type: MarketType, active_only: bool) -> Option<String> {
        if active_only && !self.is_trading() {
            return None;
        }

        match market_type {
            MarketType::Spot => (self.is_spot_trading_allowed && self.quote_asset == "USDT")
                .then(|| format!("{}/{}", self.base_asset, self.quote_asset)),
            MarketType::Futures => {
                let settle = self.margin_asset.as_deref().unwrap_or(&self.quote_asset);
                let perpetual = self.contract_type.as_deref() == Some("PERPETUAL");
                (perpetual && settle == "USDT")
                    .then(|| format!("{}/{}:{}", self.base_asset, self.quote_asset, settle))
            }
        }
    }
}

/// Rate-limited Binance REST client for one market type.
pub struct BinanceProvider {
    client: Client,
    market_type: MarketType,
    base_url: String,
    limiter: Mutex<RateLimiter>,
    symbols: MarketSymbols,
    all_symbols: bool,
    active_only: bool,
}

impl BinanceProvider {
    /// Create a provider against the public Binance endpoints.
    pub fn new(market_type: MarketType, config: &Config) -> Result<Self> {
        let base_url = match market_type {
            MarketType::Spot => SPOT_API_URL,
            MarketType::Futures => FUTURES_API_URL,
        };
        Self::with_base_url(market_type, config, base_url)
    }

    /// Create a provider against a custom base URL.
    pub fn with_base_url(market_type: MarketType, config: &Config, base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.exchange.timeout_ms))
            .user_agent("candlekeeper/0.1")
            .build()?;

        let limiter = RateLimiter::new(
            config.exchange.requests_per_minute,
            config.exchange.requests_per_minute,
            Duration::from_millis(config.exchange.request_delay_ms),
        );

        Ok(Self {
            client,
            market_type,
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter: Mutex::new(limiter),
            symbols: config.market.for_market(market_type).clone(),
            all_symbols: config.market.all_symbols,
            active_only: config.market.active_only,
        })
    }

    fn api_path(&self, endpoint: &str) -> String {
        match self.market_type {
            MarketType::Spot => format!("{}/api/v3/{}", self.base_url, endpoint),
            MarketType::Futures => format!("{}/fapi/v1/{}", self.base_url, endpoint),
        }
    }

    fn max_limit(&self) -> u32 {
        match self.market_type {
            MarketType::Spot => SPOT_MAX_LIMIT,
            MarketType::Futures => FUTURES_MAX_LIMIT,
        }
    }

    /// Sleep until the limiter admits a request, then book it.
    ///
    /// Never returns without booking, even if the estimated wait rounds to zero.
    async fn wait_for_rate_limit(&self) {
        loop {
            let wait = {
                let mut limiter = self.limiter.lock().unwrap_or_else(PoisonError::into_inner);
                if limiter.can_execute() {
                    limiter.mark_request();
                    return;
                }
                limiter.wait_time()
            };

            tokio::time::sleep(wait.max(MIN_RATE_LIMIT_SLEEP)).await;
        }
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)], symbol: &str) -> Result<Value> {
        self.wait_for_rate_limit().await;

        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| fetch_error(symbol, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            warn!(
                "Binance {} returned {}: {}",
                self.market_type,
                status,
                truncate_chars(&text, ERROR_BODY_LOG_CHARS)
            );
            return Err(fetch_error(symbol, format!("HTTP {}", status)));
        }

        response
            .json()
            .await
            .map_err(|e| fetch_error(symbol, e.to_string()))
    }

    async fn fetch_exchange_info(&self) -> Result<Vec<String>> {
        let value = self
            .get_json(&self.api_path("exchangeInfo"), &[], "exchangeInfo")
            .await?;
        let info: ExchangeInfo = serde_json::from_value(value)?;

        Ok(info
            .symbols
            .iter()
            .filter_map(|m| m.collectable_symbol(self.market_type, self.active_only))
            .collect())
    }
}

#[async_trait]
impl ExchangeProvider for BinanceProvider {
    fn market_type(&self) -> MarketType {
        self.market_type
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since_ms: i64,
        limit: Option<u32>,
    ) -> Result<Vec<Candle>> {
        let market_id = SymbolNormalizer::normalize(symbol);
        let limit = limit.unwrap_or(DEFAULT_LIMIT).clamp(1, self.max_limit());

        let query = [
            ("symbol", market_id),
            ("interval", timeframe.as_str().to_string()),
            ("startTime", since_ms.max(0).to_string()),
            ("limit", limit.to_string()),
        ];

        let value = self.get_json(&self.api_path("klines"), &query, symbol).await?;
        let candles = parse_klines(&value).ok_or_else(|| {
            fetch_error(symbol, "unexpected klines payload".to_string())
        })?;

        debug!(
            "Fetched {} {} candles for {} since {}",
            candles.len(),
            timeframe,
            symbol,
            since_ms
        );
        Ok(candles)
    }

    async fn fetch_filtered_symbols(&self) -> Result<Vec<String>> {
        if !self.all_symbols {
            return Ok(self.symbols.symbols.clone());
        }

        match self.fetch_exchange_info().await {
            Ok(symbols) if !symbols.is_empty() => Ok(symbols),
            Ok(_) => Ok(self.symbols.symbols.clone()),
            Err(e) => {
                warn!(
                    "Failed to load {} markets, using configured symbols: {}",
                    self.market_type, e
                );
                Ok(self.symbols.symbols.clone())
            }
        }
    }

    fn rate_limiter_stats(&self) -> Option<RateLimiterStats> {
        Some(
            self.limiter
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .stats(),
        )
    }
}

/// At most `max` characters of `text`, cut on a char boundary.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

fn fetch_error(symbol: &str, message: String) -> AppError {
    AppError::ExchangeFetch {
        symbol: symbol.to_string(),
        message,
    }
}

/// Klines arrive as `[[openTime, "open", "high", "low", "close", "volume", ...], ...]`.
/// Missing or unparsable prices decode as 0.
fn parse_klines(value: &Value) -> Option<Vec<Candle>> {
    let rows = value.as_array()?;
    let mut candles = Vec::with_capacity(rows.len());

    for row in rows {
        let fields = row.as_array()?;
        let timestamp = fields.first()?.as_i64()?;
        let number = |idx: usize| fields.get(idx).map(json_f64).unwrap_or(0.0);

        candles.push(Candle {
            timestamp,
            open: number(1),
            high: number(2),
            low: number(3),
            close: number(4),
            volume: number(5),
        });
    }

    Some(candles)
}

fn json_f64(value: &Value) -> f64 {
    match value {
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}
