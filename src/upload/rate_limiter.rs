//! Request rate limiter shared by the workers of one upload run.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as Governor,
};
use std::num::NonZeroU32;
use std::time::Duration;

// Defaults mirror the control plane's request budget
pub const DEFAULT_RATE_LIMIT_CAPACITY: u32 = 500;
pub const DEFAULT_RATE_LIMIT_PER_SECOND: f64 = 500.0;

// Slowest refill accepted, one token per day
const MAX_REFILL_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

type DirectLimiter = Governor<NotKeyed, InMemoryState, DefaultClock>;

/// Bounds the rate of outbound calls; `acquire` only ever delays
pub struct RateLimiter {
    capacity: u32,
    refill_per_second: f64,
    limiter: DirectLimiter,
}

impl RateLimiter {
    /// Create a full bucket. Capacity is at least one token.
    pub fn new(capacity: u32, refill_per_second: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_per_second,
            limiter: Governor::direct(quota(capacity, refill_per_second)),
        }
    }

    /// Wait until a token is available and take it
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a token if one is available right now
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// Burst of `capacity`, one token back every `1 / refill_per_second` seconds
fn quota(capacity: u32, refill_per_second: f64) -> Quota {
    let burst = NonZeroU32::new(capacity).unwrap_or(NonZeroU32::MIN);
    let period = Duration::try_from_secs_f64(1.0 / refill_per_second)
        .unwrap_or(MAX_REFILL_PERIOD)
        .min(MAX_REFILL_PERIOD);
    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX))
        .allow_burst(burst)
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT_CAPACITY, DEFAULT_RATE_LIMIT_PER_SECOND)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("refill_per_second", &self.refill_per_second)
            .finish()
    }
}
