use crate::config_validator::ConfigValidator;
use crate::error::ThrottlerResult;
use crate::key_generator::KeyStrategy;
use crate::rate_limiter::FallbackPolicy;
use crate::token_bucket::LimiterConfig;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;

/// Which bucket store backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// In-process map; state is per instance.
    Memory,
    /// Redis; state is shared between instances.
    #[value(alias = "redis")]
    Shared,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "throttler", version, about = "Token bucket rate limiting service")]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Bucket store backend
    #[arg(long, env = "RATE_LIMIT_BACKEND", value_enum, default_value_t = BackendKind::Memory)]
    pub backend: BackendKind,

    /// Redis connection URL, used by the shared backend
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Prefix for every bucket key written to Redis
    #[arg(long, env = "REDIS_KEY_PREFIX", default_value = "throttler:")]
    pub redis_key_prefix: String,

    /// Timeout for connecting to Redis and for each command, in milliseconds
    #[arg(long, env = "REDIS_TIMEOUT_MS", default_value_t = 250)]
    pub redis_timeout_ms: u64,

    /// Bucket capacity (burst size)
    #[arg(long, env = "RATE_LIMIT_CAPACITY", default_value_t = 100)]
    pub capacity: u32,

    /// Tokens added per second
    #[arg(long, env = "RATE_LIMIT_REFILL_RATE", default_value_t = 10.0)]
    pub refill_rate: f64,

    /// Seconds without requests after which a client's bucket is purged
    #[arg(long, env = "RATE_LIMIT_IDLE_TTL_SECS", default_value_t = 300)]
    pub idle_ttl_secs: u64,

    /// Seconds between idle-bucket sweeps
    #[arg(long, env = "RATE_LIMIT_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Behavior when the bucket store cannot be reached
    #[arg(long, env = "RATE_LIMIT_FALLBACK", value_enum, default_value_t = FallbackPolicy::FailOpen)]
    pub fallback: FallbackPolicy,

    /// How the client key is derived: ip, api_key, user_id, or a `+`-joined composite
    #[arg(long, env = "RATE_LIMIT_KEY_STRATEGY", default_value = "ip")]
    pub key_strategy: KeyStrategy,

    /// Compare-and-swap attempts per decision before the fallback policy applies
    #[arg(long, env = "RATE_LIMIT_MAX_CAS_ATTEMPTS", default_value_t = 64)]
    pub max_cas_attempts: u32,

    /// Log level for the throttler target
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Load configuration from command-line arguments and environment variables
    pub fn from_env() -> Self {
        Config::parse()
    }

    /// Limiter policy built from the flat settings, failing fast on bad values.
    pub fn limiter_config(&self) -> ThrottlerResult<LimiterConfig> {
        LimiterConfig::new(
            self.capacity,
            self.refill_rate,
            Duration::from_secs(self.idle_ttl_secs),
        )
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Checks every setting before anything is served.
    pub fn validate(&self) -> ThrottlerResult<()> {
        self.limiter_config()?;
        ConfigValidator::validate_sweep_interval(self.sweep_interval_secs)?;
        ConfigValidator::validate_cas_attempts(self.max_cas_attempts)?;
        if self.backend == BackendKind::Shared {
            ConfigValidator::validate_redis_url(&self.redis_url)?;
            ConfigValidator::validate_key_prefix(&self.redis_key_prefix)?;
        }
        Ok(())
    }
}
