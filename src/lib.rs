pub mod clock;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod handlers;
pub mod health;
pub mod key_generator;
pub mod middleware;
pub mod rate_limiter;
pub mod response;
pub mod server;
pub mod store;
pub mod token_bucket;

pub use config::Config;
pub use error::{ThrottlerError, ThrottlerResult};
pub use rate_limiter::{Decision, FallbackPolicy, RateLimiter};
pub use server::{create_app, Server};
pub use store::BucketStore;
