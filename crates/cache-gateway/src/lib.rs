//! Unified cache gateway
//!
//! HTTP proxy in front of a Redis-compatible REST store, adding key scoping,
//! tiered rate limiting, circuit breaking, read coalescing, value compression
//! and health diagnostics. The library exposes the pieces so integration tests
//! can assemble the app with in-memory collaborators.

pub mod gateway;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
