//! Integration tests for listing discovery, backfill and update

mod common;

use candlekeeper::error::AppError;
use candlekeeper::services::{MemoryTimeSeriesStore, TimeSeriesStore};
use candlekeeper::types::MarketType;
use common::*;
use std::sync::Arc;
use tokio_test::assert_ok;

const SPOT_KEY: &str = "data:binance:spot:BTCUSDT:5m";

fn mocks() -> (Arc<MockExchange>, Arc<MockExchange>, Arc<CountingStore>) {
    (
        Arc::new(MockExchange::new(MarketType::Spot)),
        Arc::new(MockExchange::new(MarketType::Futures)),
        Arc::new(CountingStore::default()),
    )
}

// =============================================================================
// Backfill
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_backfill_three_pages_from_listing_date() {
    let t0 = START + DAY;
    let data = candles(t0, 1120);
    let last = data.last().unwrap().timestamp;
    let now = last + INTERVAL;

    let spot = Arc::new(MockExchange::new(MarketType::Spot).with_candles(data));
    let (_, futures, store) = mocks();
    let service = service(test_config(), spot.clone(), futures, store.clone(), now);

    let report = service.backfill_symbol("BTC/USDT", MarketType::Spot).await.unwrap();

    // One listing probe plus three pages.
    assert_eq!(spot.fetch_count(), 4);
    assert_eq!(store.writes(), 3);
    assert_eq!(report.start_ms, t0);
    assert_eq!(report.requests, 3);
    assert_eq!(report.pages, 3);
    assert_eq!(report.candles, 1120);
    assert_eq!(report.cursor_ms, last + INTERVAL);
    assert!(!report.skipped);

    let calls = spot.calls();
    assert_eq!(calls[0].since, START);
    assert_eq!(calls[0].limit, Some(10));
    assert_eq!(calls[1].since, t0);
    assert_eq!(calls[1].limit, Some(500));
    assert_eq!(calls[2].since, t0 + 500 * INTERVAL);
    assert_eq!(calls[3].since, t0 + 1000 * INTERVAL);
    assert!(calls.iter().all(|c| c.symbol == "BTC/USDT"));

    let info = store.get_time_series_info(SPOT_KEY).await.unwrap();
    assert_eq!(info.total_samples, Some(1120));
    assert_eq!(info.first_timestamp, Some(t0));
    assert_eq!(info.last_timestamp, Some(last));
}

#[tokio::test(start_paused = true)]
async fn test_backfill_skips_empty_windows() {
    let t0 = START + DAY;
    let data = candles(t0, 1120);
    let last = data.last().unwrap().timestamp;
    let now = last + INTERVAL + 6 * HOUR;

    let spot = Arc::new(MockExchange::new(MarketType::Spot).with_candles(data));
    let (_, futures, store) = mocks();
    let service = service(test_config(), spot.clone(), futures, store.clone(), now);

    let report = service.backfill_symbol("BTCUSDT", MarketType::Spot).await.unwrap();

    // Two empty pages of 4h each close the 6h tail.
    assert_eq!(report.requests, 5);
    assert_eq!(report.pages, 3);
    assert_eq!(report.cursor_ms, last + INTERVAL + 8 * HOUR);
    assert_eq!(store.writes(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_backfill_terminates_without_any_data() {
    let now = START + 30 * DAY;
    let (spot, futures, store) = mocks();
    let service = service(test_config(), spot.clone(), futures, store.clone(), now);

    let report = service.backfill_symbol("BTC/USDT", MarketType::Spot).await.unwrap();

    assert_eq!(report.start_ms, START);
    assert_eq!(report.pages, 0);
    assert_eq!(report.requests, 30 * 6);
    assert!(report.cursor_ms >= now);
    // Five weekly probes before falling back to the start date.
    assert_eq!(spot.fetch_count(), 5 + 30 * 6);
    assert_eq!(store.writes(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_backfill_resumes_after_last_stored_candle() {
    let t0 = START + DAY;
    let data = candles(t0, 600);
    let stored = &data[..200];
    let resume_at = stored.last().unwrap().timestamp + INTERVAL;
    let now = data.last().unwrap().timestamp + INTERVAL;

    let spot = Arc::new(MockExchange::new(MarketType::Spot).with_candles(data.clone()));
    let (_, futures, store) = mocks();
    store.inner.add_bulk_data(SPOT_KEY, stored).await.unwrap();
    let service = service(test_config(), spot.clone(), futures, store.clone(), now);

    let report = service.backfill_symbol("BTC/USDT", MarketType::Spot).await.unwrap();

    assert_eq!(report.start_ms, resume_at);
    assert_eq!(spot.calls()[0].since, resume_at);
    assert_eq!(report.candles, 400);
    let info = store.get_time_series_info(SPOT_KEY).await.unwrap();
    assert_eq!(info.total_samples, Some(600));
}

#[tokio::test(start_paused = true)]
async fn test_backfill_complete_symbol_is_noop() {
    let t0 = START + DAY;
    let data = candles(t0, 1120);
    let now = data.last().unwrap().timestamp + INTERVAL;

    let spot = Arc::new(MockExchange::new(MarketType::Spot).with_candles(data));
    let (_, futures, store) = mocks();
    let service = service(test_config(), spot.clone(), futures, store.clone(), now);

    service.backfill_symbol("BTC/USDT", MarketType::Spot).await.unwrap();
    let fetches = spot.fetch_count();

    let progress = service.get_progress("BTC/USDT", MarketType::Spot).await.unwrap();
    assert!(progress.is_complete);

    let report = service.backfill_symbol("BTC/USDT", MarketType::Spot).await.unwrap();
    assert!(report.skipped);
    assert_eq!(spot.fetch_count(), fetches);
}

#[tokio::test(start_paused = true)]
async fn test_backfill_recovers_from_transient_failures() {
    let t0 = START + DAY;
    let data = candles(t0, 300);
    let now = data.last().unwrap().timestamp + INTERVAL;

    // Probe fails (skipped ahead), then the first page fails once.
    let spot = Arc::new(
        MockExchange::new(MarketType::Spot)
            .with_candles(data)
            .failing_first(2),
    );
    let (_, futures, store) = mocks();
    let mut config = test_config();
    config.historical.start_date = "2025-01-02".to_string();
    let service = service(config, spot.clone(), futures, store.clone(), now);

    let report = service.backfill_symbol("BTC/USDT", MarketType::Spot).await.unwrap();
    assert_eq!(report.start_ms, START + DAY);
    assert_eq!(report.candles, 300);
    assert_eq!(report.requests, 1);
    // Probe, failed page, retried page.
    assert_eq!(spot.fetch_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_backfill_fails_after_retries_exhausted() {
    let t0 = START + DAY;
    let (_, futures, store) = mocks();
    let spot = Arc::new(MockExchange::new(MarketType::Spot).always_failing());
    store
        .inner
        .add_bulk_data(SPOT_KEY, &candles(t0, 10))
        .await
        .unwrap();
    let service = service(test_config(), spot.clone(), futures, store, t0 + DAY);

    let err = service
        .backfill_symbol("BTC/USDT", MarketType::Spot)
        .await
        .unwrap_err();

    match err {
        AppError::RetriesExhausted { attempts, source } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*source, AppError::ExchangeFetch { .. }));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(spot.fetch_count(), 3);
}

// =============================================================================
// Listing discovery
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_listing_probe_error_skips_a_week() {
    let listed = START + 3 * DAY;
    let spot = Arc::new(
        MockExchange::new(MarketType::Spot)
            .with_candles(candles(listed, 5000))
            .failing_first(1),
    );
    let (_, futures, store) = mocks();
    let service = service(test_config(), spot.clone(), futures, store, START + 60 * DAY);

    let listing = service.find_listing_date("BTCUSDT", MarketType::Spot).await;

    assert_eq!(listing, START + 7 * DAY);
    let calls = spot.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].since, START + 7 * DAY);
}

#[tokio::test(start_paused = true)]
async fn test_listing_date_found_on_first_probe() {
    let listed = START + 2 * DAY;
    let spot = Arc::new(MockExchange::new(MarketType::Spot).with_candles(candles(listed, 50)));
    let (_, futures, store) = mocks();
    let service = service(test_config(), spot, futures, store, START + 60 * DAY);

    assert_eq!(service.find_listing_date("BTC/USDT", MarketType::Spot).await, listed);
}

// =============================================================================
// Update
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_update_without_data_looks_back_a_day() {
    let now = START + 10 * DAY;
    let spot = Arc::new(MockExchange::new(MarketType::Spot).with_candles(candles(now - DAY, 288)));
    let (_, futures, store) = mocks();
    let service = service(test_config(), spot.clone(), futures, store.clone(), now);

    let written = service.update_symbol("BTC/USDT", MarketType::Spot).await.unwrap();

    assert_eq!(written, 288);
    let calls = spot.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].since, now - DAY);
    assert_eq!(calls[0].limit, None);
    assert_eq!(store.writes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_update_continues_after_last_candle() {
    let now = START + 10 * DAY;
    let data = candles(now - HOUR, 12);
    let (_, futures, store) = mocks();
    store.inner.add_bulk_data(SPOT_KEY, &data[..6]).await.unwrap();
    let spot = Arc::new(MockExchange::new(MarketType::Spot).with_candles(data.clone()));
    let service = service(test_config(), spot.clone(), futures, store.clone(), now);

    let written = service.update_symbol("BTCUSDT", MarketType::Spot).await.unwrap();

    assert_eq!(written, 6);
    assert_eq!(spot.calls()[0].since, data[5].timestamp + INTERVAL);
    assert_eq!(store.get_last_timestamp(SPOT_KEY).await.unwrap(), Some(data[11].timestamp));
}

#[tokio::test(start_paused = true)]
async fn test_update_empty_page_writes_nothing() {
    let (spot, futures, store) = mocks();
    let service = service(test_config(), spot, futures, store.clone(), START + DAY);

    let written = service.update_symbol("BTC/USDT", MarketType::Spot).await.unwrap();
    assert_eq!(written, 0);
    assert_eq!(store.writes(), 0);
}

// =============================================================================
// Progress
// =============================================================================

#[tokio::test]
async fn test_all_symbols_progress_keys() {
    let mut config = test_config();
    config.market.spot.symbols = vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()];
    config.market.futures.enabled = true;

    let spot = Arc::new(MockExchange::new(MarketType::Spot).with_symbols(&["BTC/USDT", "ETH/USDT"]));
    let futures = Arc::new(MockExchange::new(MarketType::Futures).with_symbols(&["SOL/USDT:USDT"]));
    let store = Arc::new(CountingStore::default());
    let service = service(config, spot, futures, store, START + DAY);

    let progress = service.get_all_symbols_progress().await.unwrap();
    let keys: Vec<_> = progress.keys().cloned().collect();
    assert_eq!(keys, vec!["futures:SOLUSDT", "spot:BTCUSDT", "spot:ETHUSDT"]);
    assert!(progress.values().all(|p| !p.is_complete && p.last_timestamp.is_none()));
}

#[tokio::test]
async fn test_disabled_market_has_no_symbols() {
    let futures = Arc::new(MockExchange::new(MarketType::Futures).with_symbols(&["BTC/USDT:USDT"]));
    let (spot, _, store) = mocks();
    let service = service(test_config(), spot, futures, store, START + DAY);

    assert!(service.get_symbols(MarketType::Futures).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stale_series_is_incomplete() {
    let (spot, futures, store) = mocks();
    let data = candles(START, 2000);
    let last = data.last().unwrap().timestamp;
    store.inner.add_bulk_data(SPOT_KEY, &data).await.unwrap();
    let service = service(test_config(), spot, futures, store, last + 3 * HOUR);

    let progress = service.get_progress("BTC/USDT", MarketType::Spot).await.unwrap();
    assert_eq!(progress.last_timestamp, Some(last));
    assert!(!progress.is_complete);
}

#[test]
fn test_rewriting_a_batch_is_idempotent() {
    let store = MemoryTimeSeriesStore::new();
    let batch = candles(START, 150);

    assert_ok!(tokio_test::block_on(store.add_bulk_data(SPOT_KEY, &batch)));
    assert_ok!(tokio_test::block_on(store.add_bulk_data(SPOT_KEY, &batch)));

    let info = tokio_test::block_on(store.get_time_series_info(SPOT_KEY)).unwrap();
    assert_eq!(info.total_samples, Some(150));
}
