//! Periodic update and backfill loops over the collected symbol universe.
//!
//! Two independent loops share one [`HistoricalDataService`]:
//! - the update loop is phase-aligned to candle boundaries (plus a grace
//!   period for the exchange to close the candle) and then fires on a fixed
//!   period;
//! - the backfill loop fires shortly after start and then on its own period,
//!   backfilling every incomplete symbol.
//!
//! Each loop is guarded by its own running flag so it never overlaps itself.
//! The loops are not mutually exclusive with each other; per-symbol
//! serialisation is handled by the historical service's symbol locks.

use crate::services::HistoricalDataService;
use crate::types::SymbolKey;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Grace period after a candle boundary before updating.
pub const UPDATE_GRACE_MS: u64 = 5_000;
const FIRST_BACKFILL_DELAY: Duration = Duration::from_secs(5);

const STARTUP_MAX_ATTEMPTS: u32 = 100;
/// Consecutive failures after which the startup phase gives up on a symbol.
pub const STARTUP_MAX_FAILURES: u32 = 5;
const STARTUP_ATTEMPT_PAUSE: Duration = Duration::from_secs(10);

const UPDATE_DELAY_FACTOR: u64 = 1;
const STARTUP_DELAY_FACTOR: u64 = 2;
const BACKFILL_DELAY_FACTOR: u64 = 3;

/// Read-only scheduler snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub backfill_running: bool,
    /// Update period (ms).
    pub update_interval: u64,
    /// Backfill period (ms).
    pub backfill_interval: u64,
}

/// Per-symbol tally of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(PassSummary),
    /// Another pass of the same kind was in flight; nothing was done.
    AlreadyRunning,
}

/// Delay from `now_ms` to the next multiple of `period_ms`, plus `grace_ms`.
pub fn delay_until_next_boundary(now_ms: i64, period_ms: u64, grace_ms: u64) -> Duration {
    let period = period_ms.max(1) as i64;
    let into_period = now_ms.rem_euclid(period);
    Duration::from_millis((period - into_period) as u64 + grace_ms)
}

/// Holds a running flag for as long as it lives.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the loop state: flags, failure counters and task handles.
pub struct SchedulerService {
    historical: Arc<HistoricalDataService>,
    running: AtomicBool,
    update_running: AtomicBool,
    backfill_running: AtomicBool,
    failure_counts: DashMap<SymbolKey, u32>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerService {
    pub fn new(historical: Arc<HistoricalDataService>) -> Self {
        Self {
            historical,
            running: AtomicBool::new(false),
            update_running: AtomicBool::new(false),
            backfill_running: AtomicBool::new(false),
            failure_counts: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn request_delay(&self, factor: u64) -> Duration {
        Duration::from_millis(self.historical.config().exchange.request_delay_ms * factor)
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.historical.config().historical.retry_delay_ms)
    }

    pub fn status(&self) -> SchedulerStatus {
        let scheduler = &self.historical.config().scheduler;
        SchedulerStatus {
            running: self.running.load(Ordering::SeqCst),
            backfill_running: self.backfill_running.load(Ordering::SeqCst),
            update_interval: scheduler.update_interval_ms,
            backfill_interval: scheduler.backfill_interval_ms,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_update_running(&self) -> bool {
        self.update_running.load(Ordering::SeqCst)
    }

    /// Consecutive startup-phase failures recorded for a symbol.
    pub fn failure_count(&self, key: &SymbolKey) -> u32 {
        self.failure_counts.get(key).map(|c| *c).unwrap_or(0)
    }

    /// Spawn the scheduler. Calling it again while running is a no-op.
    ///
    /// With `backfill_first` set, the periodic loops only begin once the
    /// startup convergence phase has finished.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running");
            return;
        }

        info!("Starting scheduler");
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if this.historical.config().historical.backfill_first {
                info!("Running initial backfill before starting updates");
                this.complete_backfill_first().await;
            }
            tokio::join!(this.update_loop(), this.backfill_loop());
        });

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Abort the loops and clear the flags.
    pub fn stop(&self) {
        let handles: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }

        self.running.store(false, Ordering::SeqCst);
        self.update_running.store(false, Ordering::SeqCst);
        self.backfill_running.store(false, Ordering::SeqCst);
        info!("Scheduler stopped");
    }

    async fn update_loop(&self) {
        let period_ms = self.historical.config().scheduler.update_interval_ms;
        let first = delay_until_next_boundary(self.historical.now_ms(), period_ms, UPDATE_GRACE_MS);
        info!("Next update in {}s", first.as_secs());
        tokio::time::sleep(first).await;

        let mut ticker = interval(Duration::from_millis(period_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match self.run_update_once().await {
                PassOutcome::Completed(summary) => info!(
                    "Update pass: {}/{} symbols updated",
                    summary.succeeded, summary.total
                ),
                PassOutcome::AlreadyRunning => debug!("Update pass still running, skipping tick"),
            }
        }
    }

    async fn backfill_loop(&self) {
        let period_ms = self.historical.config().scheduler.backfill_interval_ms;
        info!(
            "Backfill loop starts in {}s, then every {}ms",
            FIRST_BACKFILL_DELAY.as_secs(),
            period_ms
        );
        tokio::time::sleep(FIRST_BACKFILL_DELAY).await;

        let mut ticker = interval(Duration::from_millis(period_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match self.run_backfill_once().await {
                PassOutcome::Completed(summary) => info!(
                    "Backfill pass: {} ok, {} failed of {} incomplete",
                    summary.succeeded, summary.failed, summary.total
                ),
                PassOutcome::AlreadyRunning => debug!("Backfill already running, skipping tick"),
            }
        }
    }

    /// One update pass over every enabled market's symbols.
    pub async fn run_update_once(&self) -> PassOutcome {
        let Some(_guard) = FlagGuard::acquire(&self.update_running) else {
            return PassOutcome::AlreadyRunning;
        };

        let mut symbols = Vec::new();
        for market_type in self.historical.config().market.enabled_markets() {
            match self.historical.get_symbols(market_type).await {
                Ok(list) => {
                    debug!("Found {} {} symbols", list.len(), market_type);
                    symbols.extend(list.into_iter().map(|s| (market_type, s)));
                }
                Err(e) => error!("Failed to list {} symbols: {}", market_type, e),
            }
        }

        let mut summary = PassSummary {
            total: symbols.len(),
            ..Default::default()
        };

        for (market_type, symbol) in symbols {
            match self.historical.update_symbol(&symbol, market_type).await {
                Ok(written) => {
                    debug!("Updated {}:{} ({} candles)", market_type, symbol, written);
                    summary.succeeded += 1;
                    tokio::time::sleep(self.request_delay(UPDATE_DELAY_FACTOR)).await;
                }
                Err(e) => {
                    warn!("Failed to update {}:{}: {}", market_type, symbol, e);
                    summary.failed += 1;
                }
            }
        }

        PassOutcome::Completed(summary)
    }

    /// One backfill pass over every incomplete symbol.
    pub async fn run_backfill_once(&self) -> PassOutcome {
        let Some(_guard) = FlagGuard::acquire(&self.backfill_running) else {
            return PassOutcome::AlreadyRunning;
        };

        let pending = match self.incomplete_symbols().await {
            Some(pending) => pending,
            None => return PassOutcome::Completed(PassSummary::default()),
        };
        info!("Found {} incomplete symbols for backfill", pending.len());

        let mut summary = PassSummary {
            total: pending.len(),
            ..Default::default()
        };

        for key in pending {
            if !self.backfill_running.load(Ordering::SeqCst) {
                info!("Backfill pass cancelled");
                break;
            }

            match self.historical.backfill_symbol(&key.symbol, key.market_type).await {
                Ok(_) => {
                    summary.succeeded += 1;
                    tokio::time::sleep(self.request_delay(BACKFILL_DELAY_FACTOR)).await;
                }
                Err(e) => {
                    warn!("Failed to backfill {}: {}", key, e);
                    summary.failed += 1;
                    tokio::time::sleep(self.retry_delay()).await;
                }
            }
        }

        PassOutcome::Completed(summary)
    }

    /// Repeat backfill passes until every symbol is complete or given up on.
    ///
    /// Returns `true` when no eligible incomplete symbols remain, `false`
    /// when the attempt cap was hit or the phase was cancelled.
    pub async fn complete_backfill_first(&self) -> bool {
        let Some(_guard) = FlagGuard::acquire(&self.backfill_running) else {
            warn!("Backfill already running, skipping startup phase");
            return false;
        };

        for attempt in 1..=STARTUP_MAX_ATTEMPTS {
            if !self.backfill_running.load(Ordering::SeqCst) {
                info!("Startup backfill cancelled");
                return false;
            }
            debug!("Startup backfill attempt {}/{}", attempt, STARTUP_MAX_ATTEMPTS);

            let Some(incomplete) = self.incomplete_symbols().await else {
                tokio::time::sleep(STARTUP_ATTEMPT_PAUSE).await;
                continue;
            };

            let pending: Vec<SymbolKey> = incomplete
                .into_iter()
                .filter(|key| {
                    let failures = self.failure_count(key);
                    if failures >= STARTUP_MAX_FAILURES {
                        debug!("Skipping {} ({} failures)", key, failures);
                        false
                    } else {
                        true
                    }
                })
                .collect();

            if pending.is_empty() {
                info!("Startup backfill finished after {} attempt(s)", attempt);
                return true;
            }

            for key in pending {
                match self.historical.backfill_symbol(&key.symbol, key.market_type).await {
                    Ok(_) => {
                        self.failure_counts.remove(&key);
                        tokio::time::sleep(self.request_delay(STARTUP_DELAY_FACTOR)).await;
                    }
                    Err(e) => {
                        let failures = {
                            let mut count = self.failure_counts.entry(key.clone()).or_insert(0);
                            *count += 1;
                            *count
                        };
                        warn!(
                            "Failed to backfill {} (failure {}/{}): {}",
                            key, failures, STARTUP_MAX_FAILURES, e
                        );
                        tokio::time::sleep(self.retry_delay()).await;
                    }
                }
            }

            tokio::time::sleep(STARTUP_ATTEMPT_PAUSE).await;
        }

        warn!("Startup backfill hit the attempt cap, starting updates anyway");
        false
    }

    /// Incomplete symbols from a fresh progress snapshot; `None` on failure.
    async fn incomplete_symbols(&self) -> Option<Vec<SymbolKey>> {
        match self.historical.get_all_symbols_progress().await {
            Ok(progress) => Some(
                progress
                    .into_iter()
                    .filter(|(_, p)| !p.is_complete)
                    .filter_map(|(key, _)| SymbolKey::parse(&key))
                    .collect(),
            ),
            Err(e) => {
                error!("Failed to load symbol progress: {}", e);
                None
            }
        }
    }
}
