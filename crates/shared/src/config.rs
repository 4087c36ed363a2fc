//! Configuration management using environment variables
//!
//! # Security
//!
//! Backend credentials are never read here. The cache section only names the
//! secrets that the gateway resolves per request through
//! [`crate::secrets::SecretResolver`], so rotated credentials take effect
//! without a restart.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::env;
use std::str::FromStr;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,

    /// Redis configuration (rate-limit counter backend)
    pub redis: RedisConfig,

    /// Identity configuration
    pub auth: AuthConfig,

    /// Cache gateway behaviour
    pub cache: CacheConfig,

    /// Secret names for auxiliary services probed by the health sweep
    pub services: ServiceSecretNames,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,
}

/// Redis configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Direct Redis URL, supports both `redis://` and `rediss://` (TLS) schemes.
    ///
    /// When unset the gateway counts rate limits in process memory.
    pub url: Option<String>,
}

/// Identity configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret used to verify bearer tokens
    pub jwt_secret: String,
}

/// Cache gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Secret name holding the backend REST URL
    pub url_secret: String,

    /// Secret name holding the backend REST token
    pub token_secret: String,

    /// Values strictly larger than this many bytes are compressed
    pub compression_threshold: usize,

    /// Maximum number of keys accepted by batch operations
    pub max_batch_size: usize,

    /// TTL applied when a key-creating operation omits one (seconds)
    pub default_ttl: u64,

    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,

    /// Cooldown before an open circuit admits trial requests (seconds)
    pub recovery_timeout_secs: u64,

    /// Successful trial requests needed to close a half-open circuit
    pub half_open_requests: u32,

    /// How long a settled read stays joinable by late callers (milliseconds)
    pub coalesce_window_ms: u64,

    /// Backend HTTP timeout (seconds)
    pub request_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url_secret: "UPSTASH_REDIS_REST_URL".to_string(),
            token_secret: "UPSTASH_REDIS_REST_TOKEN".to_string(),
            compression_threshold: 1024,
            max_batch_size: 100,
            default_ttl: 900,
            failure_threshold: 5,
            recovery_timeout_secs: 30,
            half_open_requests: 3,
            coalesce_window_ms: 50,
            request_timeout_secs: 10,
        }
    }
}

/// Secret names (URL, token) for each auxiliary service
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSecretNames {
    pub vector: (String, String),
    pub queue: (String, String),
    pub search: (String, String),
}

impl Default for ServiceSecretNames {
    fn default() -> Self {
        Self {
            vector: (
                "UPSTASH_VECTOR_REST_URL".to_string(),
                "UPSTASH_VECTOR_REST_TOKEN".to_string(),
            ),
            queue: ("QSTASH_URL".to_string(), "QSTASH_TOKEN".to_string()),
            search: (
                "UPSTASH_SEARCH_REST_URL".to_string(),
                "UPSTASH_SEARCH_REST_TOKEN".to_string(),
            ),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let defaults = CacheConfig::default();
        let service_defaults = ServiceSecretNames::default();

        Ok(Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_var("SERVER_PORT", 8080)?,
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL").ok().filter(|u| !u.is_empty()),
            },
            auth: AuthConfig {
                jwt_secret: Self::load_jwt_secret()?,
            },
            cache: CacheConfig {
                url_secret: env::var("CACHE_URL_SECRET").unwrap_or(defaults.url_secret),
                token_secret: env::var("CACHE_TOKEN_SECRET").unwrap_or(defaults.token_secret),
                compression_threshold: parse_var(
                    "CACHE_COMPRESSION_THRESHOLD",
                    defaults.compression_threshold,
                )?,
                max_batch_size: parse_var("CACHE_MAX_BATCH_SIZE", defaults.max_batch_size)?,
                default_ttl: parse_var("CACHE_DEFAULT_TTL", defaults.default_ttl)?,
                failure_threshold: parse_var(
                    "CIRCUIT_FAILURE_THRESHOLD",
                    defaults.failure_threshold,
                )?,
                recovery_timeout_secs: parse_var(
                    "CIRCUIT_RECOVERY_TIMEOUT",
                    defaults.recovery_timeout_secs,
                )?,
                half_open_requests: parse_var(
                    "CIRCUIT_HALF_OPEN_REQUESTS",
                    defaults.half_open_requests,
                )?,
                coalesce_window_ms: parse_var(
                    "CACHE_COALESCE_WINDOW_MS",
                    defaults.coalesce_window_ms,
                )?,
                request_timeout_secs: parse_var(
                    "CACHE_REQUEST_TIMEOUT",
                    defaults.request_timeout_secs,
                )?,
            },
            services: ServiceSecretNames {
                vector: secret_pair("VECTOR", service_defaults.vector),
                queue: secret_pair("QUEUE", service_defaults.queue),
                search: secret_pair("SEARCH", service_defaults.search),
            },
        })
    }

    /// Load the bearer-token secret
    ///
    /// Release builds refuse to start without `JWT_SECRET` or with one shorter
    /// than 32 characters.
    fn load_jwt_secret() -> Result<String> {
        let secret = if cfg!(debug_assertions) {
            env::var("JWT_SECRET").unwrap_or_else(|_| {
                tracing::warn!(
                    "JWT_SECRET not set - using development default. \
                     DO NOT use in production!"
                );
                "dev_secret_change_in_production_32chars".to_string()
            })
        } else {
            env::var("JWT_SECRET").map_err(|_| {
                Error::config("JWT_SECRET environment variable must be set in production")
            })?
        };

        if !cfg!(debug_assertions) && secret.len() < 32 {
            return Err(Error::config(format!(
                "JWT_SECRET must be at least 32 characters (256 bits of entropy). \
                 Current length: {} characters",
                secret.len()
            )));
        }

        Ok(secret)
    }
}

/// Parse an optional environment variable, falling back to `default`
fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("Invalid {}: {}", name, e))),
        Err(_) => Ok(default),
    }
}

/// Read `<PREFIX>_URL_SECRET` / `<PREFIX>_TOKEN_SECRET` overrides
fn secret_pair(prefix: &str, default: (String, String)) -> (String, String) {
    (
        env::var(format!("{}_URL_SECRET", prefix)).unwrap_or(default.0),
        env::var(format!("{}_TOKEN_SECRET", prefix)).unwrap_or(default.1),
    )
}
