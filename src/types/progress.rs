use super::MarketType;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Summary statistics of one symbol's stored series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesInfo {
    pub exists: bool,
    pub total_samples: Option<u64>,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
}

impl SeriesInfo {
    pub fn missing() -> Self {
        Self::default()
    }
}

/// Backfill progress of a symbol, always derived from the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub last_timestamp: Option<i64>,
    pub is_complete: bool,
}

/// Outcome of one `backfill_symbol` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    /// Whether the symbol was already complete and nothing was fetched.
    pub skipped: bool,
    /// Page requests issued, empty pages included.
    pub requests: u32,
    /// Non-empty pages written to the store.
    pub pages: u32,
    pub candles: u64,
    pub start_ms: i64,
    /// Where the next page would have started.
    pub cursor_ms: i64,
}

/// Per-symbol progress enriched for the HTTP surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolProgressReport {
    pub symbol: String,
    pub market_type: MarketType,
    pub start_date: String,
    pub last_timestamp: Option<String>,
    pub is_complete: bool,
    pub percentage: f64,
    pub remaining_days: i64,
}

impl SymbolProgressReport {
    /// Build the report relative to the configured start date.
    pub fn build(
        symbol: impl Into<String>,
        market_type: MarketType,
        progress: Progress,
        start_ms: i64,
        now_ms: i64,
    ) -> Self {
        let start_date = iso_millis(start_ms);
        let symbol = symbol.into();

        match progress.last_timestamp {
            Some(last) => {
                let total_range = (now_ms - start_ms) as f64;
                let completed = (last - start_ms) as f64;
                let percentage = if total_range > 0.0 {
                    (completed / total_range * 100.0).clamp(0.0, 100.0)
                } else {
                    100.0
                };

                Self {
                    symbol,
                    market_type,
                    start_date,
                    last_timestamp: Some(iso_millis(last)),
                    is_complete: progress.is_complete,
                    percentage: (percentage * 100.0).round() / 100.0,
                    remaining_days: ceil_days(now_ms - last),
                }
            }
            None => Self {
                symbol,
                market_type,
                start_date,
                last_timestamp: None,
                is_complete: false,
                percentage: 0.0,
                remaining_days: ceil_days(now_ms - start_ms),
            },
        }
    }
}

fn ceil_days(ms: i64) -> i64 {
    if ms <= 0 {
        return 0;
    }
    (ms + DAY_MS - 1) / DAY_MS
}

/// Render a millisecond timestamp as RFC 3339 with millisecond precision.
pub fn iso_millis(ms: i64) -> String {
    let dt: DateTime<Utc> = Utc
        .timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| DateTime::<Utc>::from(std::time::UNIX_EPOCH));
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}
