use crate::config::Config;
use crate::error::ThrottlerResult;
use crate::handlers::{health_check, ping, readiness_check};
use crate::health::HealthChecker;
use crate::key_generator::KeyGenerator;
use crate::middleware::{logging_middleware, rate_limit_middleware, RateLimitState};
use crate::rate_limiter::RateLimiter;
use crate::store;
use axum::routing::get;
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Builds the router: health endpoints are exempt, everything else passes the limiter.
pub fn create_app(limiter: RateLimiter, keys: KeyGenerator) -> Router {
    let limited = Router::new()
        .route("/", get(ping))
        .route_layer(middleware::from_fn_with_state(
            RateLimitState::new(limiter.clone(), keys),
            rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .with_state(Arc::new(HealthChecker::new(limiter)))
        .merge(limited)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
    limiter: RateLimiter,
    sweep_interval: Duration,
}

impl Server {
    /// Validates the configuration and wires the selected store into the limiter.
    pub fn new(config: Config) -> ThrottlerResult<Self> {
        config.validate()?;

        let store = store::from_config(&config)?;
        let limiter = RateLimiter::new(store, config.limiter_config()?)?
            .with_fallback(config.fallback)
            .with_max_cas_attempts(config.max_cas_attempts);
        let keys = KeyGenerator::new(config.key_strategy.clone());

        Ok(Self {
            app: create_app(limiter.clone(), keys),
            bind_addr: config.bind_addr,
            limiter,
            sweep_interval: config.sweep_interval(),
        })
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        info!(
            "Throttler server listening on {} (store: {})",
            self.bind_addr,
            self.limiter.store().backend_name()
        );
        info!("Health check available at /health");
        info!("Readiness check available at /ready");

        let sweeper = self.limiter.spawn_sweeper(self.sweep_interval);

        let result = axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;

        sweeper.abort();
        result?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
