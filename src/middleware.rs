use crate::key_generator::KeyGenerator;
use crate::rate_limiter::{Decision, RateLimiter};
use crate::response::RateLimitExceeded;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::net::SocketAddr;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// State for [`rate_limit_middleware`].
#[derive(Debug, Clone)]
pub struct RateLimitState {
    pub limiter: RateLimiter,
    pub keys: KeyGenerator,
}

impl RateLimitState {
    pub fn new(limiter: RateLimiter, keys: KeyGenerator) -> Self {
        Self { limiter, keys }
    }
}

/// Admission control in front of the wrapped routes.
///
/// The client key is derived from headers and the peer address only. Denied
/// requests never reach the next handler; they get a 429 with `Retry-After`.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let client_ip = KeyGenerator::extract_client_ip(request.headers(), peer_addr(&request));
    let key = state.keys.client_key(request.headers(), &client_ip);

    // The decision runs in its own task so the bucket update still lands if the
    // client goes away and this future is dropped mid-flight.
    let limiter = state.limiter.clone();
    let task_key = key.clone();
    let decision = match tokio::spawn(async move { limiter.decide(&task_key).await }).await {
        Ok(decision) => decision,
        Err(err) => {
            warn!(key = %key, error = %err, "Rate limit task failed, applying fallback policy");
            Decision::fallback(state.limiter.fallback())
        }
    };

    if !decision.allowed {
        debug!(
            key = %key,
            retry_after_ms = decision.retry_after.as_millis() as u64,
            "Request rejected by rate limiter"
        );
        return too_many_requests(&decision);
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        X_RATELIMIT_LIMIT,
        HeaderValue::from(state.limiter.config().capacity),
    );
    if let Some(remaining) = decision.remaining {
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
    }
    response
}

/// 429 response carrying the retry hint in the header and the body.
pub fn too_many_requests(decision: &Decision) -> Response {
    let retry_after = decision.retry_after_secs();
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(RateLimitExceeded::new(retry_after)),
    )
        .into_response();
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = KeyGenerator::extract_client_ip(request.headers(), peer_addr(&request));
    let request_id = request
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(
        target: "throttler::middleware",
        request_id = %request_id,
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "Incoming request"
    );

    let mut response = next.run(request).await;

    let status = response.status();
    info!(
        target: "throttler::middleware",
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = %status,
        "Request completed"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}

fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}
