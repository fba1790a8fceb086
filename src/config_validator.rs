use crate::error::ThrottlerError;
use regex::Regex;
use std::sync::LazyLock;

static KEY_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9:_\-.]*$").unwrap_or_else(|e| panic!("invalid key prefix pattern: {e}"))
});

const REDIS_SCHEMES: [&str; 4] = ["redis://", "rediss://", "redis+unix://", "unix://"];

/// Validates configuration values for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL
    pub fn validate_redis_url(url: &str) -> Result<(), ThrottlerError> {
        if url.is_empty() {
            return Err(ThrottlerError::InvalidConfig(
                "Redis URL cannot be empty".to_string(),
            ));
        }

        if !REDIS_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
            return Err(ThrottlerError::InvalidConfig(format!(
                "Redis URL must start with one of {:?}",
                REDIS_SCHEMES
            )));
        }

        Ok(())
    }

    /// Validates the prefix put in front of every Redis bucket key
    pub fn validate_key_prefix(prefix: &str) -> Result<(), ThrottlerError> {
        if !KEY_PREFIX.is_match(prefix) {
            return Err(ThrottlerError::InvalidConfig(format!(
                "Redis key prefix '{}' may only contain alphanumerics, ':', '_', '-' and '.'",
                prefix
            )));
        }
        Ok(())
    }

    pub fn validate_sweep_interval(secs: u64) -> Result<(), ThrottlerError> {
        if secs == 0 {
            return Err(ThrottlerError::InvalidConfig(
                "Sweep interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_cas_attempts(attempts: u32) -> Result<(), ThrottlerError> {
        if attempts == 0 {
            return Err(ThrottlerError::InvalidConfig(
                "Compare-and-swap attempts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_redis_url() {
        assert!(ConfigValidator::validate_redis_url("redis://localhost:6379").is_ok());
        assert!(ConfigValidator::validate_redis_url("rediss://localhost:6379").is_ok());
        assert!(ConfigValidator::validate_redis_url("unix:///tmp/redis.sock").is_ok());
    }

    #[test]
    fn test_invalid_redis_url() {
        assert!(ConfigValidator::validate_redis_url("").is_err());
        assert!(ConfigValidator::validate_redis_url("http://localhost:6379").is_err());
    }

    #[test]
    fn test_key_prefix() {
        assert!(ConfigValidator::validate_key_prefix("throttler:").is_ok());
        assert!(ConfigValidator::validate_key_prefix("").is_ok());
        assert!(ConfigValidator::validate_key_prefix("my app:").is_err());
        assert!(ConfigValidator::validate_key_prefix("a*b").is_err());
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(ConfigValidator::validate_sweep_interval(0).is_err());
        assert!(ConfigValidator::validate_sweep_interval(30).is_ok());
        assert!(ConfigValidator::validate_cas_attempts(0).is_err());
        assert!(ConfigValidator::validate_cas_attempts(1).is_ok());
    }
}
