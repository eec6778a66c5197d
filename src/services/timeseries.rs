//! Per-field candle storage.
//!
//! Each symbol owns a key family `data:<exchange>:<market>:<symbol>:<tf>`
//! with one series per OHLCV field appended (`...:Open`, `...:Close`, ...).
//! Writes are last-write-wins per timestamp, so replaying a batch is safe.

use crate::error::{AppError, Result};
use crate::types::{Candle, MarketType, SeriesInfo, Timeframe};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, RedisError, Value};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Field whose series answers "last timestamp" and info queries.
const REFERENCE_FIELD: &str = "Close";

/// Build the key prefix for one symbol's series family.
pub fn series_key_prefix(
    exchange: &str,
    market_type: MarketType,
    canonical_symbol: &str,
    timeframe: Timeframe,
) -> String {
    format!(
        "data:{}:{}:{}:{}",
        exchange.to_lowercase(),
        market_type,
        canonical_symbol,
        timeframe
    )
}

/// Durable append/range/stat store for candles.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Write a batch. Duplicate timestamps overwrite the stored values.
    async fn add_bulk_data(&self, key_prefix: &str, candles: &[Candle]) -> Result<()>;

    /// Timestamp of the newest stored candle, if any.
    async fn get_last_timestamp(&self, key_prefix: &str) -> Result<Option<i64>>;

    /// Summary statistics. A missing series reports `exists = false`.
    async fn get_time_series_info(&self, key_prefix: &str) -> Result<SeriesInfo>;

    /// Candles with `from_ms <= timestamp <= to_ms`, ascending.
    async fn get_range(&self, key_prefix: &str, from_ms: i64, to_ms: i64) -> Result<Vec<Candle>>;
}

// =============================================================================
// RedisTimeSeries
// =============================================================================

/// Store backed by the RedisTimeSeries module.
#[derive(Clone)]
pub struct RedisTimeSeriesStore {
    conn: ConnectionManager,
}

impl RedisTimeSeriesStore {
    /// Connect to Redis at the given URL.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis time-series store at {}", redis_url);
        Ok(Self { conn })
    }

    async fn write_pipeline(&self, key_prefix: &str, candles: &[Candle]) -> redis::RedisResult<()> {
        let mut pipe = redis::pipe();
        for candle in candles {
            for (field, value) in Candle::FIELDS.iter().zip(candle.values()) {
                pipe.cmd("TS.ADD")
                    .arg(format!("{}:{}", key_prefix, field))
                    .arg(candle.timestamp)
                    .arg(value)
                    .arg("ON_DUPLICATE")
                    .arg("LAST")
                    .ignore();
            }
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await
    }

    async fn create_series(&self, key_prefix: &str) {
        let mut conn = self.conn.clone();
        for field in Candle::FIELDS {
            let key = format!("{}:{}", key_prefix, field);
            // Fails harmlessly when the key already exists.
            if let Err(e) = redis::cmd("TS.CREATE")
                .arg(&key)
                .arg("RETENTION")
                .arg(0)
                .arg("DUPLICATE_POLICY")
                .arg("LAST")
                .query_async::<_, ()>(&mut conn)
                .await
            {
                debug!("TS.CREATE {} skipped: {}", key, e);
            }
        }
    }
}

#[async_trait]
impl TimeSeriesStore for RedisTimeSeriesStore {
    async fn add_bulk_data(&self, key_prefix: &str, candles: &[Candle]) -> Result<()> {
        if candles.is_empty() {
            return Ok(());
        }

        if let Err(first) = self.write_pipeline(key_prefix, candles).await {
            debug!("Bulk write to {} failed ({}), creating series", key_prefix, first);
            self.create_series(key_prefix).await;
            self.write_pipeline(key_prefix, candles)
                .await
                .map_err(|e| store_error(key_prefix, e))?;
        }

        Ok(())
    }

    async fn get_last_timestamp(&self, key_prefix: &str) -> Result<Option<i64>> {
        let key = format!("{}:{}", key_prefix, REFERENCE_FIELD);
        let mut conn = self.conn.clone();

        let reply: redis::RedisResult<Value> =
            redis::cmd("TS.GET").arg(&key).query_async(&mut conn).await;

        match reply {
            Ok(value) => Ok(parse_sample_timestamp(&value)),
            Err(e) if is_missing_key(&e) => Ok(None),
            Err(e) => Err(store_error(key_prefix, e)),
        }
    }

    async fn get_time_series_info(&self, key_prefix: &str) -> Result<SeriesInfo> {
        let key = format!("{}:{}", key_prefix, REFERENCE_FIELD);
        let mut conn = self.conn.clone();

        let reply: redis::RedisResult<Value> =
            redis::cmd("TS.INFO").arg(&key).query_async(&mut conn).await;

        match reply {
            Ok(value) => Ok(parse_info(&value)),
            Err(e) if is_missing_key(&e) => Ok(SeriesInfo::missing()),
            Err(e) => Err(store_error(key_prefix, e)),
        }
    }

    async fn get_range(&self, key_prefix: &str, from_ms: i64, to_ms: i64) -> Result<Vec<Candle>> {
        let mut pipe = redis::pipe();
        for field in Candle::FIELDS {
            pipe.cmd("TS.RANGE")
                .arg(format!("{}:{}", key_prefix, field))
                .arg(from_ms)
                .arg(to_ms);
        }

        let mut conn = self.conn.clone();
        let reply: redis::RedisResult<Vec<Vec<(i64, f64)>>> = pipe.query_async(&mut conn).await;

        match reply {
            Ok(series) => Ok(join_fields(&series)),
            Err(e) if is_missing_key(&e) => Ok(Vec::new()),
            Err(e) => Err(store_error(key_prefix, e)),
        }
    }
}

fn store_error(key_prefix: &str, e: RedisError) -> AppError {
    AppError::Store {
        key: key_prefix.to_string(),
        message: e.to_string(),
    }
}

fn is_missing_key(e: &RedisError) -> bool {
    e.to_string().contains("does not exist")
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Data(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok(),
        Value::Status(s) => s.parse().ok(),
        _ => None,
    }
}

fn value_as_str(value: &Value) -> Option<&str> {
    match value {
        Value::Data(bytes) => std::str::from_utf8(bytes).ok(),
        Value::Status(s) => Some(s.as_str()),
        _ => None,
    }
}

/// `TS.GET` replies `[timestamp, value]`, or an empty array for an empty series.
fn parse_sample_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Bulk(items) => items.first().and_then(value_as_i64),
        _ => None,
    }
}

/// `TS.INFO` replies with a flat `[name, value, name, value, ...]` array.
fn parse_info(value: &Value) -> SeriesInfo {
    let Value::Bulk(items) = value else {
        return SeriesInfo::missing();
    };

    let mut info = SeriesInfo {
        exists: true,
        total_samples: Some(0),
        first_timestamp: None,
        last_timestamp: None,
    };

    for pair in items.chunks(2) {
        let [name, field] = pair else { continue };
        match value_as_str(name) {
            Some("totalSamples") => {
                info.total_samples = value_as_i64(field).map(|n| n.max(0) as u64);
            }
            Some("firstTimestamp") => {
                info.first_timestamp = value_as_i64(field).filter(|ts| *ts > 0);
            }
            Some("lastTimestamp") => {
                info.last_timestamp = value_as_i64(field).filter(|ts| *ts > 0);
            }
            _ => {}
        }
    }

    info
}

/// Join per-field `(timestamp, value)` series into candles. Fields missing
/// for a timestamp read as 0.
fn join_fields(series: &[Vec<(i64, f64)>]) -> Vec<Candle> {
    let mut rows: BTreeMap<i64, [f64; 5]> = BTreeMap::new();
    for (idx, points) in series.iter().enumerate().take(Candle::FIELDS.len()) {
        for (ts, value) in points {
            rows.entry(*ts).or_insert([0.0; 5])[idx] = *value;
        }
    }

    rows.into_iter()
        .map(|(timestamp, [open, high, low, close, volume])| Candle {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        })
        .collect()
}

// =============================================================================
// In-memory
// =============================================================================

/// Process-local store with the same duplicate policy as the Redis store.
#[derive(Default)]
pub struct MemoryTimeSeriesStore {
    series: RwLock<HashMap<String, BTreeMap<i64, Candle>>>,
}

impl MemoryTimeSeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of key families holding data.
    pub async fn len(&self) -> usize {
        self.series.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.series.read().await.is_empty()
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryTimeSeriesStore {
    async fn add_bulk_data(&self, key_prefix: &str, candles: &[Candle]) -> Result<()> {
        if candles.is_empty() {
            return Ok(());
        }
        let mut series = self.series.write().await;
        let entry = series.entry(key_prefix.to_string()).or_default();
        for candle in candles {
            entry.insert(candle.timestamp, *candle);
        }
        Ok(())
    }

    async fn get_last_timestamp(&self, key_prefix: &str) -> Result<Option<i64>> {
        let series = self.series.read().await;
        Ok(series
            .get(key_prefix)
            .and_then(|s| s.keys().next_back().copied()))
    }

    async fn get_time_series_info(&self, key_prefix: &str) -> Result<SeriesInfo> {
        let series = self.series.read().await;
        Ok(match series.get(key_prefix) {
            Some(s) => SeriesInfo {
                exists: true,
                total_samples: Some(s.len() as u64),
                first_timestamp: s.keys().next().copied(),
                last_timestamp: s.keys().next_back().copied(),
            },
            None => SeriesInfo::missing(),
        })
    }

    async fn get_range(&self, key_prefix: &str, from_ms: i64, to_ms: i64) -> Result<Vec<Candle>> {
        if from_ms > to_ms {
            return Ok(Vec::new());
        }
        let series = self.series.read().await;
        Ok(series
            .get(key_prefix)
            .map(|s| s.range(from_ms..=to_ms).map(|(_, c)| *c).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(ts: i64, close: f64) -> Candle {
        Candle {
            timestamp: ts,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn test_series_key_prefix_format() {
        assert_eq!(
            series_key_prefix("Binance", MarketType::Futures, "BTCUSDT", Timeframe::FiveMinutes),
            "data:binance:futures:BTCUSDT:5m"
        );
    }

    #[test]
    fn test_parse_info_reply() {
        let reply = Value::Bulk(vec![
            Value::Data(b"totalSamples".to_vec()),
            Value::Int(288),
            Value::Data(b"memoryUsage".to_vec()),
            Value::Int(4184),
            Value::Data(b"firstTimestamp".to_vec()),
            Value::Int(1_000),
            Value::Data(b"lastTimestamp".to_vec()),
            Value::Int(2_000),
            Value::Data(b"labels".to_vec()),
            Value::Bulk(vec![]),
        ]);
        let info = parse_info(&reply);
        assert!(info.exists);
        assert_eq!(info.total_samples, Some(288));
        assert_eq!(info.first_timestamp, Some(1_000));
        assert_eq!(info.last_timestamp, Some(2_000));
    }

    #[test]
    fn test_parse_info_empty_series() {
        let reply = Value::Bulk(vec![
            Value::Status("totalSamples".to_string()),
            Value::Int(0),
            Value::Status("firstTimestamp".to_string()),
            Value::Int(0),
            Value::Status("lastTimestamp".to_string()),
            Value::Int(0),
        ]);
        let info = parse_info(&reply);
        assert!(info.exists);
        assert_eq!(info.total_samples, Some(0));
        assert_eq!(info.first_timestamp, None);
        assert_eq!(info.last_timestamp, None);
    }

    #[test]
    fn test_parse_sample_timestamp() {
        let reply = Value::Bulk(vec![Value::Int(42), Value::Data(b"1.5".to_vec())]);
        assert_eq!(parse_sample_timestamp(&reply), Some(42));
        assert_eq!(parse_sample_timestamp(&Value::Bulk(vec![])), None);
        assert_eq!(parse_sample_timestamp(&Value::Nil), None);
    }

    #[test]
    fn test_join_fields_fills_missing_with_zero() {
        let series = vec![
            vec![(1, 1.0), (2, 2.0)],
            vec![(1, 1.5), (2, 2.5)],
            vec![(1, 0.5)],
            vec![(1, 1.2), (2, 2.2)],
            vec![(1, 10.0), (2, 20.0)],
        ];
        let candles = join_fields(&series);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].low, 0.5);
        assert_eq!(candles[1].low, 0.0);
        assert_eq!(candles[1].volume, 20.0);
    }

    #[tokio::test]
    async fn test_memory_store_last_write_wins() {
        let store = MemoryTimeSeriesStore::new();
        let key = "data:binance:spot:BTCUSDT:5m";
        let batch = vec![candle(300_000, 1.0), candle(600_000, 2.0)];

        store.add_bulk_data(key, &batch).await.unwrap();
        store.add_bulk_data(key, &batch).await.unwrap();
        store
            .add_bulk_data(key, &[candle(600_000, 3.0)])
            .await
            .unwrap();

        let info = store.get_time_series_info(key).await.unwrap();
        assert_eq!(info.total_samples, Some(2));
        assert_eq!(info.first_timestamp, Some(300_000));
        assert_eq!(store.get_last_timestamp(key).await.unwrap(), Some(600_000));

        let range = store.get_range(key, 0, i64::MAX).await.unwrap();
        assert_eq!(range[1].close, 3.0);
    }

    #[tokio::test]
    async fn test_memory_store_missing_series() {
        let store = MemoryTimeSeriesStore::new();
        let info = store.get_time_series_info("data:x").await.unwrap();
        assert!(!info.exists);
        assert_eq!(store.get_last_timestamp("data:x").await.unwrap(), None);
        assert!(store.get_range("data:x", 0, 10).await.unwrap().is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_memory_store_range_bounds() {
        let store = MemoryTimeSeriesStore::new();
        let key = "data:binance:spot:ETHUSDT:5m";
        let batch: Vec<_> = (1..=5).map(|i| candle(i * 300_000, i as f64)).collect();
        store.add_bulk_data(key, &batch).await.unwrap();

        let range = store.get_range(key, 600_000, 1_200_000).await.unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range.first().map(|c| c.timestamp), Some(600_000));
        assert!(store.get_range(key, 10, 0).await.unwrap().is_empty());
        assert_eq!(store.len().await, 1);
    }
}
