use serde::{Deserialize, Serialize};

/// Body of a 429 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitExceeded {
    pub error: String,
    #[serde(rename = "retryAfterSeconds")]
    pub retry_after_seconds: u64,
}

impl RateLimitExceeded {
    pub fn new(retry_after_seconds: u64) -> Self {
        Self {
            error: "rate_limit_exceeded".to_string(),
            retry_after_seconds,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PingResponse {
    pub status: String,
}

impl PingResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub store: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReadinessResponse {
    pub fn ready(store: &str) -> Self {
        Self {
            status: "ready".to_string(),
            store: store.to_string(),
            error: None,
        }
    }

    pub fn not_ready(store: &str, error: String) -> Self {
        Self {
            status: "not_ready".to_string(),
            store: store.to_string(),
            error: Some(error),
        }
    }
}
