//! Data Transfer Objects (DTOs) for API responses

pub mod cache;
pub mod common;

// Re-exports
pub use cache::*;
pub use common::*;
