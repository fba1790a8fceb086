//! Client key derivation for rate limiting.
//!
//! Only request metadata (headers and the peer address) is read; the body is
//! never touched. Credentials are reduced to a SHA-256 fingerprint before they
//! become part of a key, so keys can be stored and logged.

use crate::error::ThrottlerError;
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::str::FromStr;
use tracing::debug;

/// Strategy for generating rate limit keys
#[derive(Debug, Clone, PartialEq)]
pub enum KeyStrategy {
    /// Use client IP address
    IpAddress,
    /// Use API key from header
    ApiKey,
    /// Use the authenticated subject forwarded by the auth layer
    UserId,
    /// Composite key from multiple sources
    Composite(Vec<KeyStrategy>),
}

impl FromStr for KeyStrategy {
    type Err = ThrottlerError;

    /// Parses `ip`, `api_key`, `user_id`, or a `+`-joined composite like `user_id+ip`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn single(part: &str) -> Result<KeyStrategy, ThrottlerError> {
            match part.trim().to_ascii_lowercase().as_str() {
                "ip" | "ip_address" => Ok(KeyStrategy::IpAddress),
                "api_key" | "api-key" => Ok(KeyStrategy::ApiKey),
                "user_id" | "user-id" | "user" => Ok(KeyStrategy::UserId),
                other => Err(ThrottlerError::InvalidKeyStrategy(format!(
                    "unknown key strategy '{}'",
                    other
                ))),
            }
        }

        let parts: Vec<&str> = s.split('+').collect();
        match parts.as_slice() {
            [one] => single(one),
            many => Ok(KeyStrategy::Composite(
                many.iter().map(|p| single(p)).collect::<Result<_, _>>()?,
            )),
        }
    }
}

/// Generates rate limiting keys based on request context
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    default_strategy: KeyStrategy,
}

impl KeyGenerator {
    pub fn new(strategy: KeyStrategy) -> Self {
        Self {
            default_strategy: strategy,
        }
    }

    pub fn strategy(&self) -> &KeyStrategy {
        &self.default_strategy
    }

    /// Key for this request, falling back to the client IP when the configured
    /// identity is missing so anonymous traffic is still limited.
    pub fn client_key(&self, headers: &HeaderMap, client_ip: &str) -> String {
        match self.generate_key(headers, client_ip) {
            Ok(key) => key,
            Err(err) => {
                debug!(error = %err, client_ip, "Falling back to IP based rate limit key");
                format!("throttle:ip:{}", client_ip)
            }
        }
    }

    /// Generate a rate limit key from request headers and the client address
    pub fn generate_key(&self, headers: &HeaderMap, client_ip: &str) -> Result<String, ThrottlerError> {
        match &self.default_strategy {
            KeyStrategy::IpAddress => Ok(format!("throttle:ip:{}", client_ip)),
            KeyStrategy::ApiKey => Ok(format!("throttle:api:{}", api_key(headers)?)),
            KeyStrategy::UserId => Ok(format!("throttle:user:{}", user_id(headers)?)),
            KeyStrategy::Composite(strategies) => {
                let mut key_parts = Vec::with_capacity(strategies.len());
                for sub_strategy in strategies {
                    let part = match sub_strategy {
                        KeyStrategy::IpAddress => client_ip.to_string(),
                        KeyStrategy::ApiKey => api_key(headers)?,
                        KeyStrategy::UserId => user_id(headers)?,
                        KeyStrategy::Composite(_) => {
                            return Err(ThrottlerError::InvalidKeyStrategy(
                                "Nested composite keys not supported".to_string(),
                            ))
                        }
                    };
                    key_parts.push(part);
                }
                Ok(format!("throttle:composite:{}", key_parts.join(":")))
            }
        }
    }

    /// Extract client IP from proxy headers, then the peer address
    pub fn extract_client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        header(headers, "x-forwarded-for")
            .and_then(|xff| xff.split(',').next().map(|ip| ip.trim().to_string()))
            .filter(|ip| !ip.is_empty())
            .or_else(|| header(headers, "x-real-ip"))
            .or_else(|| header(headers, "cf-connecting-ip"))
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new(KeyStrategy::IpAddress)
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Fingerprint of the caller's API key, read from `x-api-key` or the
/// `Authorization` credential.
fn api_key(headers: &HeaderMap) -> Result<String, ThrottlerError> {
    header(headers, "x-api-key")
        .or_else(|| header(headers, "authorization").map(|value| strip_scheme(&value)))
        .filter(|credential| !credential.is_empty())
        .map(|credential| fingerprint(&credential))
        .ok_or(ThrottlerError::MissingApiKey)
}

/// `Bearer abc` -> `abc`; a bare value is returned as is.
fn strip_scheme(value: &str) -> String {
    match value.split_once(' ') {
        Some((_scheme, credential)) => credential.trim().to_string(),
        None => value.to_string(),
    }
}

fn fingerprint(credential: &str) -> String {
    hex::encode(Sha256::digest(credential.as_bytes()))
}

fn user_id(headers: &HeaderMap) -> Result<String, ThrottlerError> {
    header(headers, "x-user-id").ok_or(ThrottlerError::MissingUserId)
}
