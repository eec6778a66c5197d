//! Candlekeeper - OHLCV history backfill and completeness service

pub mod api;
pub mod config;
pub mod error;
pub mod services;
pub mod sources;
pub mod types;

use config::Config;
use services::{HistoricalDataService, SchedulerService};
use std::sync::Arc;
use std::time::Instant;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub historical: Arc<HistoricalDataService>,
    pub scheduler: Arc<SchedulerService>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(historical: Arc<HistoricalDataService>, scheduler: Arc<SchedulerService>) -> Self {
        Self {
            config: Arc::new(historical.config().clone()),
            historical,
            scheduler,
            started_at: Instant::now(),
        }
    }
}

// Re-export commonly used types
pub use error::{AppError, Result};
pub use types::*;
