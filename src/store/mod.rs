//! Bucket stores
//!
//! A store owns every client's [`BucketState`], keyed by client key. Two
//! variants exist and are chosen once, at construction time:
//!
//! - [`MemoryStore`]: process-local map, enough for a single instance.
//! - [`RedisStore`]: shared Redis backend so several instances see the same
//!   buckets. Redis must support `EVAL`; the compare-and-swap script is what
//!   prevents lost updates between instances.

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, RedisStoreConfig};

use crate::config::{BackendKind, Config};
use crate::error::ThrottlerResult;
use crate::token_bucket::BucketState;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait BucketStore: Send + Sync + std::fmt::Debug {
    /// Current state for `key`, or `None` if the key is unknown or expired.
    async fn load(&self, key: &str) -> ThrottlerResult<Option<BucketState>>;

    /// Unconditionally stores `state`, expiring it after `ttl` of inactivity.
    async fn save(&self, key: &str, state: &BucketState, ttl: Duration) -> ThrottlerResult<()>;

    /// Atomically replaces the state for `key` with `new` if the stored state
    /// still equals `expected` (`None` meaning "absent").
    ///
    /// Returns `Ok(false)` when another writer got there first.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&BucketState>,
        new: &BucketState,
        ttl: Duration,
    ) -> ThrottlerResult<bool>;

    /// Removes `key`. Returns whether a bucket existed.
    async fn delete(&self, key: &str) -> ThrottlerResult<bool>;

    /// Purges buckets untouched for at least `idle_ttl`. Returns how many were removed.
    async fn sweep(&self, now_ms: u64, idle_ttl: Duration) -> ThrottlerResult<usize>;

    /// Cheap reachability check.
    async fn ping(&self) -> ThrottlerResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str;
}

/// Builds the store selected by `config.backend`.
pub fn from_config(config: &Config) -> ThrottlerResult<Arc<dyn BucketStore>> {
    match config.backend {
        BackendKind::Memory => Ok(Arc::new(MemoryStore::new())),
        BackendKind::Shared => {
            let store = RedisStore::new(
                &config.redis_url,
                RedisStoreConfig {
                    key_prefix: config.redis_key_prefix.clone(),
                    timeout: Duration::from_millis(config.redis_timeout_ms),
                },
            )?;
            Ok(Arc::new(store))
        }
    }
}
