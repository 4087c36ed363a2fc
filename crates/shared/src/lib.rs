//! Shared library for the FoodShare cache gateway
//!
//! This crate provides common functionality used by the gateway service:
//! - Error handling types
//! - Configuration management
//! - Logging infrastructure
//! - Secrets resolution
//! - Redis client and rate-limit counters

pub mod config;
pub mod error;
pub mod redis;
pub mod secrets;

// Re-export commonly used types
pub use config::{CacheConfig, Config, ServiceSecretNames};
pub use error::{Error, Result};
pub use redis::{InMemoryRateLimitCounter, RateLimitCounter, RedisRateLimitCounter};
pub use secrets::{EnvSecretResolver, SecretRequest, SecretResolver, SecretsError};

/// Initialize tracing subscriber for structured logging
///
/// Set `LOG_FORMAT=json` to emit JSON lines instead of the human-readable format.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "shared=debug,cache_gateway=debug,info".into());

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
