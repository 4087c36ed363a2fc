//! Unified cache gateway
//!
//! A proxy in front of a Redis-compatible REST store. Requests flow through
//! [`service::CacheGateway`]; the submodules are its building blocks, leaves
//! first: key scoping, compression, circuit breaking, coalescing, rate
//! limiting, command execution, dispatch and diagnostics.

pub mod circuit_breaker;
pub mod coalescer;
pub mod compression;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod health;
pub mod metrics;
pub mod operations;
pub mod rate_limit;
pub mod scope;
pub mod service;

pub use circuit_breaker::{CircuitBreaker, CircuitState, Clock, SystemClock};
pub use error::{GatewayError, GatewayResult};
pub use executor::{BackendCredentials, ExecutorFactory, HttpExecutorFactory, RedisExecutor};
pub use health::{HttpServiceProbe, ServiceProbe};
pub use operations::{CacheOperation, CacheOperationRequest, OperationClass, OperationOptions};
pub use rate_limit::{Tier, TieredRateLimiter};
pub use scope::CallerContext;
pub use service::{CacheGateway, GatewayDependencies};
