//! Fixed-window rate-limit counters
//!
//! A counter answers one question: may `actor` perform one more `operation`
//! given `max_requests` per `window_seconds`? Policy (tiers, operation
//! classes, what to do when the counter itself fails) lives with the caller.
//!
//! # Implementations
//!
//! - [`RedisRateLimitCounter`]: atomic `INCR` + `EXPIRE` via a Lua script,
//!   one key per actor/operation/window
//! - [`InMemoryRateLimitCounter`]: process-local `DashMap`, used when no Redis
//!   URL is configured and in tests
//!
//! # Example
//!
//! ```no_run
//! use shared::redis::{RateLimitCounter, RedisRateLimitCounter};
//!
//! # async fn example(redis_manager: redis::aio::ConnectionManager) -> shared::Result<()> {
//! let counter = RedisRateLimitCounter::new(redis_manager);
//! let allowed = counter.check_rate_limit("user_123", "cache:read", 100, 60).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use redis::{aio::ConnectionManager, Script};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// External request counter keyed by actor and operation label
#[async_trait]
pub trait RateLimitCounter: Send + Sync {
    /// Count one request and report whether it fits in the current window
    ///
    /// # Errors
    ///
    /// Returns an error when the counter backend is unreachable. Callers decide
    /// whether that blocks the request.
    async fn check_rate_limit(
        &self,
        actor_id: &str,
        operation: &str,
        max_requests: u64,
        window_seconds: u64,
    ) -> Result<bool>;
}

/// Lua script: increment the window bucket, arm its expiry on first use
const FIXED_WINDOW_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

fn unix_now() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| Error::internal(format!("System time error: {}", e)))
}

/// Start of the fixed window containing `now`
fn window_start(now: u64, window_seconds: u64) -> u64 {
    let window = window_seconds.max(1);
    (now / window) * window
}

/// Redis bucket key for an actor/operation/window triple
fn bucket_key(actor_id: &str, operation: &str, window_start: u64) -> String {
    format!("rl:{}:{}:{}", actor_id, operation, window_start)
}

/// Redis-backed fixed-window counter
#[derive(Clone)]
pub struct RedisRateLimitCounter {
    redis: ConnectionManager,
    script: Script,
}

impl RedisRateLimitCounter {
    /// Create a new counter over a Redis connection manager
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            script: Script::new(FIXED_WINDOW_SCRIPT),
        }
    }
}

#[async_trait]
impl RateLimitCounter for RedisRateLimitCounter {
    async fn check_rate_limit(
        &self,
        actor_id: &str,
        operation: &str,
        max_requests: u64,
        window_seconds: u64,
    ) -> Result<bool> {
        let now = unix_now()?;
        let key = bucket_key(actor_id, operation, window_start(now, window_seconds));

        let mut conn = self.redis.clone();
        let count: u64 = self
            .script
            .key(&key)
            .arg(window_seconds)
            .invoke_async(&mut conn)
            .await?;

        let allowed = count <= max_requests;
        if allowed {
            debug!(actor = %actor_id, operation, count, max_requests, "Rate limit check: ALLOWED");
        } else {
            warn!(actor = %actor_id, operation, count, max_requests, "Rate limit check: REJECTED");
        }

        Ok(allowed)
    }
}

/// Seconds between sweeps of stale in-memory buckets
const SWEEP_INTERVAL_SECS: u64 = 60;

/// One actor/operation window
#[derive(Debug, Clone, Copy)]
struct Bucket {
    start: u64,
    window: u64,
    count: u64,
}

/// Process-local fixed-window counter
///
/// Counts are per instance, so limits are only approximate behind a load
/// balancer. Buckets whose window has ended are swept out while counting,
/// at most once per [`SWEEP_INTERVAL_SECS`].
#[derive(Default)]
pub struct InMemoryRateLimitCounter {
    buckets: DashMap<String, Bucket>,
    /// Time of the last sweep (unix seconds)
    last_sweep: AtomicU64,
}

impl InMemoryRateLimitCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request at an explicit point in time
    pub fn check_at(
        &self,
        actor_id: &str,
        operation: &str,
        max_requests: u64,
        window_seconds: u64,
        now: u64,
    ) -> bool {
        // Must run before taking an entry guard on the map
        self.sweep_if_due(now);

        let start = window_start(now, window_seconds);
        let key = format!("{}:{}", actor_id, operation);

        let mut entry = self.buckets.entry(key).or_insert(Bucket {
            start,
            window: window_seconds,
            count: 0,
        });
        if entry.start != start || entry.window != window_seconds {
            *entry = Bucket {
                start,
                window: window_seconds,
                count: 0,
            };
        }
        entry.count += 1;

        entry.count <= max_requests
    }

    /// Number of live buckets
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop buckets whose window ended at or before `now`
    pub fn purge_expired(&self, now: u64) {
        let before = self.buckets.len();
        self.buckets.retain(|_, b| b.start + b.window > now);
        let dropped = before.saturating_sub(self.buckets.len());
        if dropped > 0 {
            debug!(dropped, "Purged expired rate-limit buckets");
        }
    }

    fn sweep_if_due(&self, now: u64) {
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now < last.saturating_add(SWEEP_INTERVAL_SECS) {
            return;
        }
        if self
            .last_sweep
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.purge_expired(now);
        }
    }
}

#[async_trait]
impl RateLimitCounter for InMemoryRateLimitCounter {
    async fn check_rate_limit(
        &self,
        actor_id: &str,
        operation: &str,
        max_requests: u64,
        window_seconds: u64,
    ) -> Result<bool> {
        let now = unix_now()?;
        Ok(self.check_at(actor_id, operation, max_requests, window_seconds, now))
    }
}
