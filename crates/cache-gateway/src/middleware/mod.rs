//! HTTP middleware and request-level helpers

pub mod client_ip;
pub mod cors;
pub mod identity;
pub mod metrics;
pub mod request_id;

pub use client_ip::{client_ip, TrustedProxies};
pub use cors::cors;
pub use identity::{IdentityResolver, JwtIdentityResolver};
pub use metrics::{init_metrics, metrics_handler, HttpMetrics};
pub use request_id::{request_id, RequestId};
