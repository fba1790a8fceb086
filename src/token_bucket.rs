use crate::error::{ThrottlerError, ThrottlerResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Immutable limiter policy shared by every bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct LimiterConfig {
    /// Maximum tokens a bucket can hold (burst size).
    #[validate(range(min = 1, message = "capacity must be at least 1"))]
    pub capacity: u32,
    /// Tokens added per second.
    #[validate(range(exclusive_min = 0.0, message = "refill rate must be greater than 0"))]
    pub refill_rate: f64,
    /// How long a bucket may stay untouched before the store may purge it.
    #[serde(with = "humantime_serde")]
    pub idle_ttl: Duration,
}

impl LimiterConfig {
    pub fn new(capacity: u32, refill_rate: f64, idle_ttl: Duration) -> ThrottlerResult<Self> {
        let config = Self {
            capacity,
            refill_rate,
            idle_ttl,
        };
        config.check()?;
        Ok(config)
    }

    /// Validates every field, failing with `InvalidConfig`.
    pub fn check(&self) -> ThrottlerResult<()> {
        self.validate()?;
        if self.refill_rate.is_nan() {
            return Err(ThrottlerError::InvalidConfig(
                "refill rate must be a number".to_string(),
            ));
        }
        if self.idle_ttl.is_zero() {
            return Err(ThrottlerError::InvalidConfig(
                "idle ttl must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// One client's throttling state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill_ms: u64,
}

impl BucketState {
    /// State of a bucket seen for the first time: full.
    pub fn full(config: &LimiterConfig, now_ms: u64) -> Self {
        Self {
            tokens: f64::from(config.capacity),
            last_refill_ms: now_ms,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.tokens.max(0.0).floor() as u32
    }
}

/// Result of applying the token bucket to one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    pub allowed: bool,
    pub state: BucketState,
    /// Zero when allowed, otherwise the time until one token accrues.
    pub retry_after: Duration,
    /// Set when `now` was earlier than the stored refill time.
    pub clock_skew: Option<Duration>,
}

/// Decides whether one request may proceed and returns the updated state.
///
/// Pure: the same inputs always yield the same outcome. A `now` earlier than
/// `state.last_refill_ms` grants no refill; the refill time still moves to
/// `now`, so later calls measure elapsed time from the observed clock.
pub fn apply(state: BucketState, config: &LimiterConfig, now_ms: u64) -> Outcome {
    let capacity = f64::from(config.capacity);

    let (elapsed_ms, clock_skew) = match now_ms.checked_sub(state.last_refill_ms) {
        Some(elapsed) => (elapsed, None),
        None => (0, Some(Duration::from_millis(state.last_refill_ms - now_ms))),
    };

    let elapsed_secs = elapsed_ms as f64 / 1000.0;
    let mut tokens = (state.tokens.max(0.0) + elapsed_secs * config.refill_rate).min(capacity);

    let (allowed, retry_after) = if tokens >= 1.0 {
        tokens -= 1.0;
        (true, Duration::ZERO)
    } else {
        let wait = (1.0 - tokens) / config.refill_rate;
        (false, Duration::try_from_secs_f64(wait).unwrap_or(Duration::MAX))
    };

    Outcome {
        allowed,
        state: BucketState {
            tokens,
            last_refill_ms: now_ms,
        },
        retry_after,
        clock_skew,
    }
}
