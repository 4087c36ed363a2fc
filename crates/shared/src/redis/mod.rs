//! Redis client and utilities
//!
//! This module provides Redis connection management and the fixed-window
//! counters used for rate limiting.

pub mod rate_limiter;

pub use rate_limiter::{InMemoryRateLimitCounter, RateLimitCounter, RedisRateLimitCounter};

use crate::error::{Error, Result};
use redis::{aio::ConnectionManager, Client};

/// Create a Redis client from configuration
pub async fn create_client(url: &str) -> Result<ConnectionManager> {
    let client = Client::open(url).map_err(|e| Error::config(format!("Invalid Redis URL: {}", e)))?;

    ConnectionManager::new(client)
        .await
        .map_err(|e| Error::internal(format!("Failed to connect to Redis: {}", e)))
}
