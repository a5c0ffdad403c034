//! Dispatch throttling.
//!
//! A token bucket per dimension (messages and bytes). Each bucket refills at
//! `rate / period` continuously and holds at most `rate * burst_periods`
//! tokens. A bucket with any tokens left admits a request and may go into
//! debt, so an entry larger than the byte rate still gets through once the
//! debt from earlier entries is repaid.
//!
//! A zero rate disables that dimension. Denial is not an error: the
//! dispatcher parks the entry and retries after [`DispatchRateLimiter::retry_delay`].

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::DispatchRate;
use crate::constants::MIN_THROTTLE_RETRY_DELAY_MS;

#[derive(Debug, Clone)]
struct Bucket {
    rate: u64,
    capacity: f64,
    tokens: f64,
}

impl Bucket {
    fn new(rate: u64, burst_periods: u32) -> Self {
        let capacity = rate as f64 * burst_periods.max(1) as f64;
        Self {
            rate,
            capacity,
            tokens: capacity,
        }
    }

    fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    fn refill(&mut self, elapsed: Duration, period: Duration) {
        if self.is_unlimited() || period.is_zero() {
            return;
        }
        let added = self.rate as f64 * elapsed.as_secs_f64() / period.as_secs_f64();
        self.tokens = (self.tokens + added).min(self.capacity);
    }

    fn admits(&self) -> bool {
        self.is_unlimited() || self.tokens > 0.0
    }

    fn consume(&mut self, amount: u64) {
        if !self.is_unlimited() {
            self.tokens -= amount as f64;
        }
    }

    fn available(&self) -> Option<u64> {
        if self.is_unlimited() {
            None
        } else {
            Some(self.tokens.max(0.0).floor() as u64)
        }
    }

    /// Time until the bucket is positive again.
    fn time_to_positive(&self, period: Duration) -> Duration {
        if self.admits() || period.is_zero() {
            return Duration::ZERO;
        }
        let deficit = -self.tokens + 1.0;
        period.mul_f64(deficit / self.rate as f64)
    }
}

#[derive(Debug)]
struct LimiterState {
    rate: DispatchRate,
    messages: Bucket,
    bytes: Bucket,
    last_refill: Instant,
}

impl LimiterState {
    fn new(rate: DispatchRate, now: Instant) -> Self {
        Self {
            messages: Bucket::new(rate.msgs_per_period, rate.burst_periods),
            bytes: Bucket::new(rate.bytes_per_period, rate.burst_periods),
            rate,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        self.messages.refill(elapsed, self.rate.period);
        self.bytes.refill(elapsed, self.rate.period);
        self.last_refill = now;
    }
}

/// Remaining tokens per dimension; `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailablePermits {
    pub messages: Option<u64>,
    pub bytes: Option<u64>,
}

/// Token-bucket limiter shared by every dispatch attempt of a subscription.
#[derive(Debug)]
pub struct DispatchRateLimiter {
    state: Mutex<LimiterState>,
}

impl DispatchRateLimiter {
    pub fn new(rate: DispatchRate) -> Self {
        Self {
            state: Mutex::new(LimiterState::new(rate, Instant::now())),
        }
    }

    pub async fn rate(&self) -> DispatchRate {
        self.state.lock().await.rate
    }

    pub async fn is_enabled(&self) -> bool {
        self.state.lock().await.rate.is_enabled()
    }

    /// Replace the policy. Buckets restart full.
    pub async fn update(&self, rate: DispatchRate) {
        let mut state = self.state.lock().await;
        *state = LimiterState::new(rate, Instant::now());
    }

    pub async fn try_acquire(&self, messages: u64, bytes: u64) -> bool {
        self.try_acquire_at(messages, bytes, Instant::now()).await
    }

    /// Take tokens for `messages` and `bytes` as of `now`.
    ///
    /// Both dimensions are checked before either is charged, so a denial
    /// leaves the buckets untouched.
    pub async fn try_acquire_at(&self, messages: u64, bytes: u64, now: Instant) -> bool {
        let mut state = self.state.lock().await;
        state.refill(now);
        if !state.messages.admits() || !state.bytes.admits() {
            return false;
        }
        state.messages.consume(messages);
        state.bytes.consume(bytes);
        true
    }

    pub async fn available_permits_at(&self, now: Instant) -> AvailablePermits {
        let mut state = self.state.lock().await;
        state.refill(now);
        AvailablePermits {
            messages: state.messages.available(),
            bytes: state.bytes.available(),
        }
    }

    /// How long to wait before the next attempt can succeed.
    pub async fn retry_delay(&self) -> Duration {
        let mut state = self.state.lock().await;
        state.refill(Instant::now());
        let period = state.rate.period;
        let wait = state
            .messages
            .time_to_positive(period)
            .max(state.bytes.time_to_positive(period));
        wait.max(Duration::from_millis(MIN_THROTTLE_RETRY_DELAY_MS))
    }
}
