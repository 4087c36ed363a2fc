//! Request handlers for the cache endpoint

pub mod cache;
pub mod health;

pub use cache::execute_operation;
pub use health::{health_check, HealthQuery};
