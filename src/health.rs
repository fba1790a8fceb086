use serde::{Deserialize, Serialize};
use std::time::{Instant, SystemTime};

use crate::rate_limiter::{LimiterStats, RateLimiter};

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub fallback: String,
    pub dependencies: DependencyStatus,
    pub decisions: LimiterStats,
}

#[derive(Debug, Serialize)]
pub struct DependencyStatus {
    pub store: ServiceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub backend: String,
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl ServiceStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

#[derive(Debug, Clone)]
pub struct HealthChecker {
    rate_limiter: RateLimiter,
}

impl HealthChecker {
    pub fn new(rate_limiter: RateLimiter) -> Self {
        std::sync::LazyLock::force(&START_TIME);
        Self { rate_limiter }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME).unwrap_or_default().as_secs();

        let store_status = self.check_store().await;

        // A broken store degrades the service; the fallback policy keeps it answering.
        let overall_status = if store_status.is_healthy() {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: now
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            fallback: format!("{:?}", self.rate_limiter.fallback()),
            dependencies: DependencyStatus {
                store: store_status,
            },
            decisions: self.rate_limiter.stats(),
        }
    }

    pub async fn check_store(&self) -> ServiceStatus {
        let store = self.rate_limiter.store();
        let start = Instant::now();
        let result = store.ping().await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(()) => ServiceStatus {
                backend: store.backend_name().to_string(),
                status: "healthy".to_string(),
                response_time_ms,
                error: None,
            },
            Err(err) => ServiceStatus {
                backend: store.backend_name().to_string(),
                status: "unavailable".to_string(),
                response_time_ms,
                error: Some(err.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, RedisStore, RedisStoreConfig};
    use crate::token_bucket::LimiterConfig;
    use std::sync::Arc;
    use std::time::Duration;

    fn config() -> LimiterConfig {
        LimiterConfig::new(5, 1.0, Duration::from_secs(60)).unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_is_healthy() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), config()).unwrap();
        limiter.decide("k").await;

        let status = HealthChecker::new(limiter).check_health().await;
        assert_eq!(status.status, "healthy");
        assert_eq!(status.dependencies.store.backend, "memory");
        assert_eq!(status.decisions.allowed, 1);
        assert_eq!(status.fallback, "FailOpen");
    }

    #[tokio::test]
    async fn test_unreachable_redis_is_degraded() {
        let store = RedisStore::new(
            "redis://127.0.0.1:1/",
            RedisStoreConfig {
                key_prefix: "test:".to_string(),
                timeout: Duration::from_millis(300),
            },
        )
        .unwrap();
        let limiter = RateLimiter::new(Arc::new(store), config()).unwrap();

        let status = HealthChecker::new(limiter).check_health().await;
        assert_eq!(status.status, "degraded");
        assert_eq!(status.dependencies.store.backend, "redis");
        assert!(status.dependencies.store.error.is_some());

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("unavailable"));
    }
}
