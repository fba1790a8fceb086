//! Redis-backed bucket store.
//!
//! Buckets are stored as JSON strings under `<prefix><client key>` with a `PX`
//! expiry equal to the idle TTL, so Redis itself evicts idle clients.
//!
//! Writes made on the request path go through [`CAS_SCRIPT`], executed
//! atomically by Redis: the new state is only written if the stored value is
//! still the one the caller read. Two instances racing on the same key can
//! therefore never both spend the same token.

use super::BucketStore;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::token_bucket::BucketState;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisResult, Script};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// `KEYS[1]` bucket key, `ARGV[1]` expected value (empty when absent),
/// `ARGV[2]` new value, `ARGV[3]` expiry in milliseconds.
pub const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
    current = ''
end
if current ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return 1
"#;

#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    pub key_prefix: String,
    /// Upper bound for connecting and for every command.
    pub timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "throttler:".to_string(),
            timeout: Duration::from_millis(250),
        }
    }
}

pub struct RedisStore {
    client: Client,
    connection: Arc<RwLock<Option<ConnectionManager>>>,
    connecting: Arc<Mutex<()>>,
    cas_script: Script,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Wire encoding of a bucket.
///
/// `serde_json` is built with `float_roundtrip`, so decoding and re-encoding a
/// stored value reproduces it byte for byte; [`CAS_SCRIPT`] relies on that.
pub fn encode_state(state: &BucketState) -> ThrottlerResult<String> {
    Ok(serde_json::to_string(state)?)
}

pub fn decode_state(raw: &str) -> ThrottlerResult<BucketState> {
    Ok(serde_json::from_str(raw)?)
}

/// `ARGV[1]` of [`CAS_SCRIPT`]: the encoded expectation, empty for an absent key.
pub fn cas_expectation(expected: Option<&BucketState>) -> ThrottlerResult<String> {
    match expected {
        Some(state) => encode_state(state),
        None => Ok(String::new()),
    }
}

impl RedisStore {
    /// Creates the store without connecting; the connection is opened on first use
    /// and re-opened after failures.
    pub fn new(redis_url: &str, config: RedisStoreConfig) -> ThrottlerResult<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            ThrottlerError::InvalidConfig(format!("Failed to create Redis client: {}", e))
        })?;

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(None)),
            connecting: Arc::new(Mutex::new(())),
            cas_script: Script::new(CAS_SCRIPT),
            config,
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn ttl_millis(ttl: Duration) -> u64 {
        u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> ThrottlerResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.timeout, fut).await {
            Ok(result) => result.map_err(|e| {
                ThrottlerError::StoreUnavailable(format!("{} failed: {}", op, e))
            }),
            Err(_) => Err(ThrottlerError::StoreUnavailable(format!(
                "{} timed out after {:?}",
                op, self.config.timeout
            ))),
        }
    }

    /// Shared connection, opened on demand.
    ///
    /// Only one task dials at a time. Callers arriving while a dial is in
    /// flight fail immediately instead of queueing, so no request waits longer
    /// than one timeout during an outage.
    async fn connection(&self) -> ThrottlerResult<ConnectionManager> {
        if let Some(conn) = self.connection.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let Ok(_dialing) = self.connecting.try_lock() else {
            return Err(ThrottlerError::StoreUnavailable(
                "Redis connection attempt already in progress".to_string(),
            ));
        };

        // a concurrent dial may have finished before the gate was taken
        if let Some(conn) = self.connection.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .bounded("connect", ConnectionManager::new(self.client.clone()))
            .await
            .inspect_err(|e| warn!(error = %e, "Redis connection failed"))?;
        debug!("Connected to Redis");
        *self.connection.write().await = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    async fn load(&self, key: &str) -> ThrottlerResult<Option<BucketState>> {
        let mut conn = self.connection().await?;
        let raw = self
            .bounded(
                "GET",
                redis::cmd("GET")
                    .arg(self.redis_key(key))
                    .query_async::<_, Option<String>>(&mut conn),
            )
            .await?;

        raw.as_deref().map(decode_state).transpose()
    }

    async fn save(&self, key: &str, state: &BucketState, ttl: Duration) -> ThrottlerResult<()> {
        let value = encode_state(state)?;
        let mut conn = self.connection().await?;
        self.bounded(
            "SET",
            redis::cmd("SET")
                .arg(self.redis_key(key))
                .arg(value)
                .arg("PX")
                .arg(Self::ttl_millis(ttl))
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&BucketState>,
        new: &BucketState,
        ttl: Duration,
    ) -> ThrottlerResult<bool> {
        let expected = cas_expectation(expected)?;
        let value = encode_state(new)?;
        let mut conn = self.connection().await?;

        let swapped = self
            .bounded(
                "EVAL",
                self.cas_script
                    .key(self.redis_key(key))
                    .arg(expected)
                    .arg(value)
                    .arg(Self::ttl_millis(ttl))
                    .invoke_async::<_, i64>(&mut conn),
            )
            .await?;
        Ok(swapped == 1)
    }

    async fn delete(&self, key: &str) -> ThrottlerResult<bool> {
        let mut conn = self.connection().await?;
        let deleted = self
            .bounded(
                "DEL",
                redis::cmd("DEL")
                    .arg(self.redis_key(key))
                    .query_async::<_, i64>(&mut conn),
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn sweep(&self, _now_ms: u64, _idle_ttl: Duration) -> ThrottlerResult<usize> {
        // Keys carry a PX expiry; Redis evicts idle buckets on its own.
        Ok(0)
    }

    async fn ping(&self) -> ThrottlerResult<()> {
        let mut conn = self.connection().await?;
        self.bounded(
            "PING",
            redis::cmd("PING").query_async::<_, String>(&mut conn),
        )
        .await
        .map(|_| ())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
