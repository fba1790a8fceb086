use crate::clock::{Clock, SystemClock};
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::store::BucketStore;
use crate::token_bucket::{self, BucketState, LimiterConfig};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What to do when the bucket store cannot be consulted.
///
/// Defaults to `FailOpen`: a store outage lets traffic through (and is
/// logged) instead of rejecting every request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "camelCase")]
pub enum FallbackPolicy {
    /// Allow the request.
    #[default]
    #[value(name = "failOpen", alias = "fail-open")]
    FailOpen,
    /// Deny the request with a zero retry hint.
    #[value(name = "failClosed", alias = "fail-closed")]
    FailClosed,
}

/// Admission decision for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub retry_after: Duration,
    /// Whole tokens left; `None` when the decision came from the fallback policy.
    pub remaining: Option<u32>,
}

impl Decision {
    /// Decision used when the store could not be consulted.
    pub fn fallback(policy: FallbackPolicy) -> Self {
        Self {
            allowed: policy == FallbackPolicy::FailOpen,
            retry_after: Duration::ZERO,
            remaining: None,
        }
    }

    /// `Retry-After` value in whole seconds, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 {
            secs.saturating_add(1)
        } else {
            secs
        }
    }
}

/// Decision counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub allowed: u64,
    pub denied: u64,
    pub fallbacks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    allowed: AtomicU64,
    denied: AtomicU64,
    fallbacks: AtomicU64,
}

/// Token bucket rate limiter over an injected [`BucketStore`].
///
/// For a given key the load, apply and save steps are linearizable: state is
/// written back with a compare-and-swap and the whole step is retried when a
/// concurrent caller won the race, so a token is never spent twice.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    config: Arc<LimiterConfig>,
    fallback: FallbackPolicy,
    max_cas_attempts: u32,
    counters: Arc<Counters>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn BucketStore>, config: LimiterConfig) -> ThrottlerResult<Self> {
        config.check()?;
        Ok(Self {
            store,
            clock: Arc::new(SystemClock::new()),
            config: Arc::new(config),
            fallback: FallbackPolicy::default(),
            max_cas_attempts: 64,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_max_cas_attempts(mut self, attempts: u32) -> Self {
        self.max_cas_attempts = attempts.max(1);
        self
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn fallback(&self) -> FallbackPolicy {
        self.fallback
    }

    pub fn store(&self) -> &Arc<dyn BucketStore> {
        &self.store
    }

    /// Decides whether the request identified by `key` may proceed.
    ///
    /// Never fails: store errors are turned into a decision by the fallback policy.
    pub async fn decide(&self, key: &str) -> Decision {
        match self.try_decide(key).await {
            Ok(decision) => {
                let counter = if decision.allowed {
                    &self.counters.allowed
                } else {
                    &self.counters.denied
                };
                counter.fetch_add(1, Ordering::Relaxed);
                decision
            }
            Err(err) => {
                self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                let decision = Decision::fallback(self.fallback);
                if err.is_store_failure() {
                    warn!(
                        key,
                        error = %err,
                        policy = ?self.fallback,
                        allowed = decision.allowed,
                        "Bucket store failed, applying fallback policy"
                    );
                } else {
                    error!(
                        key,
                        error = %err,
                        policy = ?self.fallback,
                        allowed = decision.allowed,
                        "Unexpected rate limiter error, applying fallback policy"
                    );
                }
                decision
            }
        }
    }

    /// Load, apply and compare-and-swap, retrying lost races.
    pub async fn try_decide(&self, key: &str) -> ThrottlerResult<Decision> {
        for attempt in 1..=self.max_cas_attempts {
            let current = self.store.load(key).await?;
            let now_ms = self.clock.now_millis();
            let state = current.unwrap_or_else(|| BucketState::full(&self.config, now_ms));

            let outcome = token_bucket::apply(state, &self.config, now_ms);
            if let Some(skew) = outcome.clock_skew {
                warn!(key, skew_ms = skew.as_millis() as u64, "Clock went backwards, no refill granted");
            }

            let swapped = self
                .store
                .compare_and_swap(key, current.as_ref(), &outcome.state, self.config.idle_ttl)
                .await?;

            if swapped {
                debug!(
                    key,
                    allowed = outcome.allowed,
                    tokens = outcome.state.tokens,
                    retry_after_ms = outcome.retry_after.as_millis() as u64,
                    "Rate limit decision"
                );
                return Ok(Decision {
                    allowed: outcome.allowed,
                    retry_after: outcome.retry_after,
                    remaining: Some(outcome.state.remaining()),
                });
            }

            debug!(key, attempt, "Concurrent bucket update, retrying");
        }

        Err(ThrottlerError::Contention {
            key: key.to_string(),
            attempts: self.max_cas_attempts,
        })
    }

    /// Forgets the bucket for `key`, giving the client a full burst again.
    pub async fn reset(&self, key: &str) -> ThrottlerResult<bool> {
        self.store.delete(key).await
    }

    /// Purges buckets idle for longer than the configured TTL.
    pub async fn sweep_idle(&self) -> ThrottlerResult<usize> {
        self.store
            .sweep(self.clock.now_millis(), self.config.idle_ttl)
            .await
    }

    /// Runs [`sweep_idle`](Self::sweep_idle) every `interval` until the handle is aborted.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match limiter.sweep_idle().await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "Swept idle rate limit buckets"),
                    Err(err) => warn!(error = %err, "Idle bucket sweep failed"),
                }
            }
        })
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Store whose backend is always down; counts write attempts.
    #[derive(Debug, Default)]
    struct UnavailableStore {
        writes: AtomicUsize,
    }

    #[async_trait]
    impl BucketStore for UnavailableStore {
        async fn load(&self, _key: &str) -> ThrottlerResult<Option<BucketState>> {
            Err(ThrottlerError::StoreUnavailable("connection refused".into()))
        }

        async fn save(&self, _: &str, _: &BucketState, _: Duration) -> ThrottlerResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Err(ThrottlerError::StoreUnavailable("connection refused".into()))
        }

        async fn compare_and_swap(
            &self,
            _: &str,
            _: Option<&BucketState>,
            _: &BucketState,
            _: Duration,
        ) -> ThrottlerResult<bool> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Err(ThrottlerError::StoreUnavailable("connection refused".into()))
        }

        async fn delete(&self, _: &str) -> ThrottlerResult<bool> {
            Err(ThrottlerError::StoreUnavailable("connection refused".into()))
        }

        async fn sweep(&self, _: u64, _: Duration) -> ThrottlerResult<usize> {
            Ok(0)
        }

        fn backend_name(&self) -> &'static str {
            "unavailable"
        }
    }

    /// Store whose compare-and-swap always loses.
    #[derive(Debug, Default)]
    struct AlwaysRacingStore;

    #[async_trait]
    impl BucketStore for AlwaysRacingStore {
        async fn load(&self, _: &str) -> ThrottlerResult<Option<BucketState>> {
            Ok(None)
        }

        async fn save(&self, _: &str, _: &BucketState, _: Duration) -> ThrottlerResult<()> {
            Ok(())
        }

        async fn compare_and_swap(
            &self,
            _: &str,
            _: Option<&BucketState>,
            _: &BucketState,
            _: Duration,
        ) -> ThrottlerResult<bool> {
            Ok(false)
        }

        async fn delete(&self, _: &str) -> ThrottlerResult<bool> {
            Ok(false)
        }

        async fn sweep(&self, _: u64, _: Duration) -> ThrottlerResult<usize> {
            Ok(0)
        }

        fn backend_name(&self) -> &'static str {
            "racing"
        }
    }

    /// Store that rejects every call with an error unrelated to availability.
    #[derive(Debug, Default)]
    struct MisconfiguredStore;

    #[async_trait]
    impl BucketStore for MisconfiguredStore {
        async fn load(&self, _: &str) -> ThrottlerResult<Option<BucketState>> {
            Err(ThrottlerError::InvalidConfig("unsupported value encoding".into()))
        }

        async fn save(&self, _: &str, _: &BucketState, _: Duration) -> ThrottlerResult<()> {
            Ok(())
        }

        async fn compare_and_swap(
            &self,
            _: &str,
            _: Option<&BucketState>,
            _: &BucketState,
            _: Duration,
        ) -> ThrottlerResult<bool> {
            Ok(true)
        }

        async fn delete(&self, _: &str) -> ThrottlerResult<bool> {
            Ok(false)
        }

        async fn sweep(&self, _: u64, _: Duration) -> ThrottlerResult<usize> {
            Ok(0)
        }

        fn backend_name(&self) -> &'static str {
            "misconfigured"
        }
    }

    fn limiter(capacity: u32, refill_rate: f64, clock: &ManualClock) -> RateLimiter {
        let config = LimiterConfig::new(capacity, refill_rate, Duration::from_secs(60)).unwrap();
        RateLimiter::new(Arc::new(MemoryStore::new()), config)
            .unwrap()
            .with_clock(Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn test_burst_then_refill() {
        let clock = ManualClock::new(0);
        let limiter = limiter(5, 1.0, &clock);

        for i in 0..5 {
            let decision = limiter.decide("client").await;
            assert!(decision.allowed, "call {} should be allowed", i);
            assert_eq!(decision.remaining, Some(4 - i));
        }

        let denied = limiter.decide("client").await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(1));
        assert_eq!(denied.retry_after_secs(), 1);

        clock.advance(Duration::from_secs(3));
        let decision = limiter.decide("client").await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, Some(2));

        let stats = limiter.stats();
        assert_eq!(stats.allowed, 6);
        assert_eq!(stats.denied, 1);
        assert_eq!(stats.fallbacks, 0);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let clock = ManualClock::new(0);
        let limiter = limiter(1, 1.0, &clock);

        assert!(limiter.decide("a").await.allowed);
        assert!(!limiter.decide("a").await.allowed);
        assert!(limiter.decide("b").await.allowed);
    }

    #[tokio::test]
    async fn test_long_idle_does_not_overfill() {
        let clock = ManualClock::new(0);
        let limiter = limiter(3, 10.0, &clock);

        assert!(limiter.decide("k").await.allowed);
        clock.advance(Duration::from_secs(24 * 3600));

        let allowed = {
            let mut n = 0;
            for _ in 0..10 {
                if limiter.decide("k").await.allowed {
                    n += 1;
                }
            }
            n
        };
        assert_eq!(allowed, 3);
    }

    #[tokio::test]
    async fn test_fail_closed_denies_without_writing() {
        let store = Arc::new(UnavailableStore::default());
        let config = LimiterConfig::new(5, 1.0, Duration::from_secs(60)).unwrap();
        let limiter = RateLimiter::new(store.clone(), config)
            .unwrap()
            .with_fallback(FallbackPolicy::FailClosed);

        for _ in 0..3 {
            let decision = limiter.decide("k").await;
            assert!(!decision.allowed);
            assert_eq!(decision.retry_after, Duration::ZERO);
            assert_eq!(decision.remaining, None);
        }
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
        assert_eq!(limiter.stats().fallbacks, 3);
    }

    #[tokio::test]
    async fn test_fail_open_always_allows() {
        let config = LimiterConfig::new(1, 1.0, Duration::from_secs(60)).unwrap();
        let limiter = RateLimiter::new(Arc::new(UnavailableStore::default()), config)
            .unwrap()
            .with_fallback(FallbackPolicy::FailOpen);

        for _ in 0..5 {
            assert!(limiter.decide("k").await.allowed);
        }
    }

    #[tokio::test]
    async fn test_contention_exhaustion_uses_fallback() {
        let config = LimiterConfig::new(1, 1.0, Duration::from_secs(60)).unwrap();
        let limiter = RateLimiter::new(Arc::new(AlwaysRacingStore), config)
            .unwrap()
            .with_max_cas_attempts(3)
            .with_fallback(FallbackPolicy::FailClosed);

        let err = limiter.try_decide("k").await.unwrap_err();
        assert!(matches!(err, ThrottlerError::Contention { attempts: 3, .. }));
        assert!(!limiter.decide("k").await.allowed);
    }

    #[tokio::test]
    async fn test_unexpected_errors_use_fallback() {
        let config = LimiterConfig::new(1, 1.0, Duration::from_secs(60)).unwrap();
        let limiter = RateLimiter::new(Arc::new(MisconfiguredStore), config)
            .unwrap()
            .with_fallback(FallbackPolicy::FailClosed);

        let err = limiter.try_decide("k").await.unwrap_err();
        assert!(!err.is_store_failure());

        let decision = limiter.decide("k").await;
        assert_eq!(decision, Decision::fallback(FallbackPolicy::FailClosed));
        assert_eq!(limiter.stats().fallbacks, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_concurrent_calls_on_unseen_key() {
        let clock = ManualClock::new(0);
        let limiter = limiter(1, 1.0, &clock);

        let a = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.decide("fresh").await }
        });
        let b = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.decide("fresh").await }
        });

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a.allowed ^ b.allowed, "exactly one call may pass");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_never_double_grant() {
        let clock = ManualClock::new(0);
        let limiter = limiter(10, 1.0, &clock);

        let handles: Vec<_> = (0..40)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.decide("hot").await })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);

        let state = limiter.store().load("hot").await.unwrap().unwrap();
        assert_eq!(state.tokens, 0.0);
    }

    #[tokio::test]
    async fn test_reset_restores_burst() {
        let clock = ManualClock::new(0);
        let limiter = limiter(1, 0.1, &clock);

        assert!(limiter.decide("k").await.allowed);
        assert!(!limiter.decide("k").await.allowed);
        assert!(limiter.reset("k").await.unwrap());
        assert!(limiter.decide("k").await.allowed);
    }

    #[tokio::test]
    async fn test_sweep_idle_uses_clock_and_ttl() {
        let clock = ManualClock::new(0);
        let limiter = limiter(2, 1.0, &clock);

        limiter.decide("idle").await;
        clock.advance(Duration::from_secs(30));
        limiter.decide("busy").await;

        clock.advance(Duration::from_secs(31));
        assert_eq!(limiter.sweep_idle().await.unwrap(), 1);
        assert!(limiter.store().load("idle").await.unwrap().is_none());
        assert!(limiter.store().load("busy").await.unwrap().is_some());
    }

    #[test]
    fn test_retry_after_secs_rounds_up() {
        let decision = Decision {
            allowed: false,
            retry_after: Duration::from_millis(1_200),
            remaining: Some(0),
        };
        assert_eq!(decision.retry_after_secs(), 2);
        assert_eq!(Decision::fallback(FallbackPolicy::FailClosed).retry_after_secs(), 0);
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let config = LimiterConfig {
            capacity: 0,
            refill_rate: 1.0,
            idle_ttl: Duration::from_secs(1),
        };
        let result = RateLimiter::new(Arc::new(MemoryStore::new()), config);
        assert!(matches!(result, Err(ThrottlerError::InvalidConfig(_))));
    }
}
