//! CORS policy for the cache endpoint
//!
//! Browser clients call the gateway directly with a bearer token, so the
//! policy allows `Authorization` plus the client-info headers sent by the
//! platform SDKs, and exposes `Retry-After` so clients can honour back-off.
//!
//! # Environment
//!
//! - `CORS_ALLOWED_ORIGINS`: comma-separated origin whitelist
//!   (development default: `http://localhost:3000,http://localhost:8080`)
//! - `ENVIRONMENT`: `production` enforces HTTPS-only origins

use actix_cors::Cors;
use actix_web::http::header::{self, HeaderName};
use std::env;
use tracing::{debug, warn};

const DEV_ORIGINS: &str = "http://localhost:3000,http://localhost:8080";

/// Build the CORS middleware from the environment
pub fn cors() -> Cors {
    let is_production = env::var("ENVIRONMENT")
        .map(|e| e.eq_ignore_ascii_case("production"))
        .unwrap_or(false);

    let raw = env::var("CORS_ALLOWED_ORIGINS").unwrap_or_else(|_| {
        if is_production {
            warn!("CORS_ALLOWED_ORIGINS not set in production, cross-origin requests will be blocked");
            String::new()
        } else {
            DEV_ORIGINS.to_string()
        }
    });

    cors_for(&parse_origins(&raw, is_production))
}

/// Build the CORS middleware for an explicit whitelist
pub fn cors_for(origins: &[String]) -> Cors {
    let mut cors = Cors::default();
    for origin in origins {
        cors = cors.allowed_origin(origin);
    }
    debug!(origins = origins.len(), "CORS middleware initialized");

    cors.allowed_methods(vec!["GET", "POST", "OPTIONS"])
        .allowed_headers(vec![
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static("apikey"),
            HeaderName::from_static("x-client-info"),
            HeaderName::from_static("x-request-id"),
        ])
        .expose_headers(vec![
            header::RETRY_AFTER,
            HeaderName::from_static("x-request-id"),
        ])
        .max_age(3600)
}

/// Split and validate a comma-separated origin list
///
/// Wildcards and scheme-less entries are dropped; production also drops
/// plain `http://` origins.
pub fn parse_origins(raw: &str, is_production: bool) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter(|origin| {
            if *origin == "*" {
                warn!("Wildcard CORS origin is not allowed, ignoring");
                return false;
            }
            if !origin.starts_with("http://") && !origin.starts_with("https://") {
                warn!(origin, "Invalid CORS origin, ignoring");
                return false;
            }
            if is_production && !origin.starts_with("https://") {
                warn!(origin, "Rejecting non-HTTPS CORS origin in production");
                return false;
            }
            true
        })
        .map(str::to_string)
        .collect()
}
