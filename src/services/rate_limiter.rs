//! Token bucket plus sliding-window limiter for outbound exchange calls.
//!
//! The limiter is advisory: it never fails a call, it only tells the caller
//! how long to wait. State is process-local and resets on restart.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);
/// Smallest wait reported while a request is not allowed.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Snapshot of the limiter counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    pub tokens: u32,
    pub requests_in_last_minute: usize,
    /// Milliseconds until the next token is due.
    pub next_refill_ms: u64,
}

/// Token bucket with a trailing one-minute window and a minimum gap.
#[derive(Debug)]
pub struct RateLimiter {
    max_tokens: u32,
    /// Tokens added per minute.
    refill_rate: u32,
    min_request_delay: Duration,
    tokens: u32,
    last_refill: Instant,
    requests: VecDeque<Instant>,
}

impl RateLimiter {
    /// Create a full bucket.
    pub fn new(max_tokens: u32, refill_rate: u32, min_request_delay: Duration) -> Self {
        Self {
            max_tokens,
            refill_rate: refill_rate.max(1),
            min_request_delay,
            tokens: max_tokens,
            last_refill: Instant::now(),
            requests: VecDeque::with_capacity(max_tokens as usize),
        }
    }

    /// Whether a request may be issued right now.
    pub fn can_execute(&mut self) -> bool {
        self.can_execute_at(Instant::now())
    }

    /// How long to sleep before the next request may be allowed. Never zero
    /// unless a request is allowed now.
    pub fn wait_time(&mut self) -> Duration {
        self.wait_time_at(Instant::now())
    }

    /// Record a request. Ignored when the limiter would not allow one.
    pub fn mark_request(&mut self) {
        self.mark_request_at(Instant::now());
    }

    pub fn stats(&mut self) -> RateLimiterStats {
        let now = Instant::now();
        self.refill(now);
        self.prune(now);

        let refill_every = self.refill_period();
        let since_refill = now.saturating_duration_since(self.last_refill);

        RateLimiterStats {
            tokens: self.tokens,
            requests_in_last_minute: self.requests.len(),
            next_refill_ms: refill_every.saturating_sub(since_refill).as_millis() as u64,
        }
    }

    pub(crate) fn can_execute_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.prune(now);

        if self.requests.len() >= self.max_tokens as usize {
            return false;
        }

        if self.tokens == 0 {
            return false;
        }

        match self.requests.back() {
            Some(last) => now.saturating_duration_since(*last) >= self.min_request_delay,
            None => true,
        }
    }

    pub(crate) fn wait_time_at(&mut self, now: Instant) -> Duration {
        if self.can_execute_at(now) {
            return Duration::ZERO;
        }

        if let Some(last) = self.requests.back() {
            let gap = now.saturating_duration_since(*last);
            if gap < self.min_request_delay {
                return self.min_request_delay - gap;
            }
        }

        if self.requests.len() >= self.max_tokens as usize {
            if let Some(oldest) = self.requests.front() {
                return WINDOW.saturating_sub(now.saturating_duration_since(*oldest));
            }
        }

        // Refill counts whole milliseconds, so it can lag the exact period.
        self.refill_period()
            .saturating_sub(now.saturating_duration_since(self.last_refill))
            .max(MIN_WAIT)
    }

    pub(crate) fn mark_request_at(&mut self, now: Instant) {
        if self.can_execute_at(now) {
            self.tokens -= 1;
            self.requests.push_back(now);
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_millis() as u64;
        let to_add = elapsed_ms * u64::from(self.refill_rate) / WINDOW.as_millis() as u64;

        if to_add > 0 {
            let refilled = u64::from(self.tokens) + to_add;
            self.tokens = refilled.min(u64::from(self.max_tokens)) as u32;
            self.last_refill = now;
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.requests.front() {
            if now.saturating_duration_since(*front) >= WINDOW {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }

    fn refill_period(&self) -> Duration {
        WINDOW / self.refill_rate
    }
}
