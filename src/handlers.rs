use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::sync::Arc;

use crate::health::HealthChecker;
use crate::response::{PingResponse, ReadinessResponse};

/// Placeholder for the business routes that sit behind the limiter.
pub async fn ping() -> impl IntoResponse {
    Json(PingResponse::ok())
}

/// Health check endpoint
pub async fn health_check(State(health): State<Arc<HealthChecker>>) -> impl IntoResponse {
    Json(health.check_health().await)
}

/// Readiness check endpoint: ready only while the bucket store answers
pub async fn readiness_check(State(health): State<Arc<HealthChecker>>) -> impl IntoResponse {
    let store = health.check_store().await;

    if store.is_healthy() {
        (StatusCode::OK, Json(ReadinessResponse::ready(&store.backend)))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse::not_ready(
                &store.backend,
                store.error.unwrap_or_default(),
            )),
        )
    }
}
