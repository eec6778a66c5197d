pub mod historical;
pub mod rate_limiter;
pub mod retry;
pub mod scheduler;
pub mod symbol_normalizer;
pub mod timeseries;

pub use historical::{validate_data_completeness, Completeness, HistoricalDataService};
pub use rate_limiter::{RateLimiter, RateLimiterStats};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use scheduler::{PassOutcome, PassSummary, SchedulerService, SchedulerStatus};
pub use symbol_normalizer::SymbolNormalizer;
pub use timeseries::{MemoryTimeSeriesStore, RedisTimeSeriesStore, TimeSeriesStore};
