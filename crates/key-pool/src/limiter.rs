//! Per-key token bucket
//!
//! Capacity equals the configured requests-per-minute and the bucket refills
//! at the same rate, so an empty bucket is full again after one minute. Refill
//! is lazy: every operation first credits the whole tokens accrued since the
//! last refill. No background timer is involved.
//!
//! Time is read from `tokio::time::Instant` so tests can drive the bucket with
//! tokio's paused clock.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

const NANOS_PER_MINUTE: u128 = 60 * 1_000_000_000;

/// Token bucket admitting at most `capacity` requests per minute.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket. The refill rate is `capacity` tokens per minute.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available. A failed attempt leaves the count untouched.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.refilled();
        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, after crediting elapsed time.
    pub fn available_tokens(&self) -> u32 {
        self.refilled().tokens
    }

    /// Zero when a token is available, otherwise the interval at which a
    /// single token accrues (one minute divided by the refill rate).
    pub fn time_until_next_token(&self) -> Duration {
        let state = self.refilled();
        if state.tokens > 0 || self.capacity == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((NANOS_PER_MINUTE / u128::from(self.capacity)) as u64)
    }

    /// Lock the state and apply the refill for the time elapsed since
    /// `last_refill`.
    ///
    /// `last_refill` only moves when at least one whole token was credited, so
    /// fractional accrual carries over to the next call.
    fn refilled(&self) -> MutexGuard<'_, BucketState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        let accrued = elapsed.as_nanos() * u128::from(self.capacity) / NANOS_PER_MINUTE;
        if accrued > 0 {
            let room = self.capacity - state.tokens;
            state.tokens += accrued.min(u128::from(room)) as u32;
            state.last_refill = now;
        }
        state
    }
}
