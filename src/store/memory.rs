use super::BucketStore;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::token_bucket::BucketState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Process-local bucket store.
///
/// Every mutation happens under the write lock, so a compare-and-swap is
/// atomic with respect to all other callers in the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    buckets: Arc<RwLock<HashMap<String, BucketState>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked buckets. Fails once a panic has poisoned the lock.
    pub fn len(&self) -> ThrottlerResult<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> ThrottlerResult<bool> {
        Ok(self.len()? == 0)
    }

    fn read(&self) -> ThrottlerResult<RwLockReadGuard<'_, HashMap<String, BucketState>>> {
        self.buckets.read().map_err(|_| {
            ThrottlerError::Internal("Failed to acquire read lock on buckets".to_string())
        })
    }

    fn write(&self) -> ThrottlerResult<RwLockWriteGuard<'_, HashMap<String, BucketState>>> {
        self.buckets.write().map_err(|_| {
            ThrottlerError::Internal("Failed to acquire write lock on buckets".to_string())
        })
    }
}

fn is_idle(state: &BucketState, now_ms: u64, idle_ms: u64) -> bool {
    now_ms.saturating_sub(state.last_refill_ms) >= idle_ms
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn load(&self, key: &str) -> ThrottlerResult<Option<BucketState>> {
        Ok(self.read()?.get(key).copied())
    }

    async fn save(&self, key: &str, state: &BucketState, _ttl: Duration) -> ThrottlerResult<()> {
        self.write()?.insert(key.to_string(), *state);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&BucketState>,
        new: &BucketState,
        _ttl: Duration,
    ) -> ThrottlerResult<bool> {
        let mut buckets = self.write()?;
        if buckets.get(key) != expected {
            return Ok(false);
        }
        buckets.insert(key.to_string(), *new);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> ThrottlerResult<bool> {
        Ok(self.write()?.remove(key).is_some())
    }

    async fn sweep(&self, now_ms: u64, idle_ttl: Duration) -> ThrottlerResult<usize> {
        let idle_ms = u64::try_from(idle_ttl.as_millis()).unwrap_or(u64::MAX);

        let candidates: Vec<String> = self
            .read()?
            .iter()
            .filter(|(_, state)| is_idle(state, now_ms, idle_ms))
            .map(|(key, _)| key.clone())
            .collect();

        // One write-lock acquisition per key keeps live requests from stalling
        // behind a large sweep. The bucket may have been touched in between,
        // so idleness is checked again under the lock.
        let mut removed = 0;
        for key in candidates {
            let mut buckets = self.write()?;
            if buckets
                .get(&key)
                .is_some_and(|state| is_idle(state, now_ms, idle_ms))
            {
                buckets.remove(&key);
                removed += 1;
            }
        }

        Ok(removed)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
