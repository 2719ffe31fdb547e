//! Token-bucket rate limiting for inbound client messages.

use std::{ops::Sub, time::Duration};

use serde::{Deserialize, Serialize};

/// Sustained inbound messages per second before `RATE_LIMITED`.
pub const DEFAULT_MESSAGES_PER_SECOND: u32 = 20;

/// Burst allowance on top of the sustained rate.
pub const DEFAULT_BURST: u32 = 40;

/// Rate limit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Refill rate in tokens per second
    pub per_second: u32,
    /// Bucket capacity
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { per_second: DEFAULT_MESSAGES_PER_SECOND, burst: DEFAULT_BURST }
    }
}

/// Token bucket, starting full.
///
/// Each admitted message costs one token; tokens refill continuously at
/// `per_second` up to `burst`.
#[derive(Debug, Clone)]
pub struct TokenBucket<I> {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: I,
}

impl<I> TokenBucket<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Full bucket at `now`.
    pub fn new(now: I, config: RateLimitConfig) -> Self {
        let capacity = f64::from(config.burst.max(1));
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: f64::from(config.per_second),
            last_refill: now,
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self, now: I) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (after refilling to `now`).
    pub fn available(&mut self, now: I) -> f64 {
        self.refill(now);
        self.tokens
    }

    fn refill(&mut self, now: I) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = (now - self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}
