//! Circuit Breaker for the cache backend
//!
//! One breaker guards every call to the backing store. State lives in
//! process memory for the lifetime of the gateway.
//!
//! # State Machine
//!
//! ```text
//! CLOSED (normal operation)
//!   ↓ (5 consecutive failures)
//! OPEN (backend calls rejected with 503)
//!   ↓ (after 30 seconds)
//! HALF-OPEN (trial calls allowed)
//!   ↓ (3 successes) → CLOSED
//!   ↓ (any failure) → OPEN
//! ```
//!
//! # Thread Safety
//!
//! State sits behind a `std::sync::Mutex`. No lock is held across an
//! `.await`, so each transition is applied as one step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::gateway::error::{GatewayError, GatewayResult};
use crate::gateway::metrics::GatewayMetrics;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Backend calls rejected immediately
    Open,
    /// Recovery test mode
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Cooldown before a half-open trial (seconds)
    pub recovery_timeout_seconds: u64,
    /// Successes required in half-open before closing
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_seconds: 30,
            half_open_requests: 3,
        }
    }
}

impl From<&shared::CacheConfig> for CircuitBreakerConfig {
    fn from(cfg: &shared::CacheConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold,
            recovery_timeout_seconds: cfg.recovery_timeout_secs,
            half_open_requests: cfg.half_open_requests,
        }
    }
}

/// Mutable breaker state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    /// Consecutive failure count
    pub failure_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    /// Remaining successes before a half-open breaker closes
    pub half_open_remaining: u32,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            opened_at: None,
            half_open_remaining: 0,
        }
    }
}

/// Time source, injectable for tests
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Circuit breaker guarding the cache backend
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
    clock: Arc<dyn Clock>,
    metrics: Arc<GatewayMetrics>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, metrics: Arc<GatewayMetrics>) -> Self {
        Self::with_clock(config, metrics, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: CircuitBreakerConfig,
        metrics: Arc<GatewayMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            state: Mutex::new(CircuitBreakerState::default()),
            clock,
            metrics,
        }
    }

    /// Whether backend calls must be rejected right now
    ///
    /// # State Transitions
    ///
    /// - **Closed**: never open
    /// - **Open**: after the cooldown, flips to Half-Open and admits calls
    /// - **Half-Open**: open only once the trial budget is used up
    pub fn is_open(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();

        match state.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                if self.cooldown_elapsed(&state, now) {
                    info!("Circuit breaker transitioning to half-open (cooldown elapsed)");
                    state.state = CircuitState::HalfOpen;
                    state.half_open_remaining = self.config.half_open_requests;
                    false
                } else {
                    true
                }
            }
            CircuitState::HalfOpen => state.half_open_remaining == 0,
        }
    }

    /// Record a successful backend call
    pub fn record_success(&self) {
        let mut state = self.lock();

        match state.state {
            CircuitState::Closed => {
                if state.failure_count > 0 {
                    debug!(
                        previous_failures = state.failure_count,
                        "Resetting failure count after success"
                    );
                }
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.half_open_remaining = state.half_open_remaining.saturating_sub(1);
                if state.half_open_remaining == 0 {
                    info!("Circuit breaker transitioning to closed (recovery successful)");
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.last_failure_time = None;
                    state.opened_at = None;
                }
            }
            CircuitState::Open => {
                debug!("Received success while open (call admitted before trip)");
            }
        }
    }

    /// Record a failed backend call
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let tripped = {
            let mut state = self.lock();
            state.failure_count += 1;
            state.last_failure_time = Some(now);

            let should_open = match state.state {
                CircuitState::HalfOpen => true,
                CircuitState::Closed => state.failure_count >= self.config.failure_threshold,
                CircuitState::Open => false,
            };

            if should_open {
                warn!(
                    failure_count = state.failure_count,
                    threshold = self.config.failure_threshold,
                    from = %state.state,
                    "Circuit breaker transitioning to open"
                );
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
                state.half_open_remaining = 0;
            } else {
                debug!(
                    failure_count = state.failure_count,
                    threshold = self.config.failure_threshold,
                    "Recorded backend failure"
                );
            }
            should_open
        };

        if tripped {
            self.metrics.record_circuit_trip();
        }
    }

    /// Current state, for responses and health checks
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Copy of the full state
    pub fn snapshot(&self) -> CircuitBreakerState {
        self.lock().clone()
    }

    /// Seconds until the cooldown elapses, at least 1
    pub fn retry_after_secs(&self) -> u64 {
        let now = self.clock.now();
        let state = self.lock();
        let cooldown = self.config.recovery_timeout_seconds as i64;
        let remaining = match state.opened_at {
            Some(opened_at) => cooldown - now.signed_duration_since(opened_at).num_seconds(),
            None => cooldown,
        };
        remaining.max(1) as u64
    }

    /// Run a backend call, recording its outcome
    ///
    /// Only [`GatewayError::is_backend_failure`] errors count as failures;
    /// the error is returned unchanged either way.
    pub async fn call<T, F>(&self, fut: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        let result = fut.await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.is_backend_failure() => self.record_failure(),
            Err(_) => {}
        }
        result
    }

    /// Fail fast with [`GatewayError::CircuitOpen`] while open
    pub fn check(&self) -> GatewayResult<()> {
        if self.is_open() {
            Err(GatewayError::CircuitOpen {
                retry_after: self.retry_after_secs(),
            })
        } else {
            Ok(())
        }
    }

    fn cooldown_elapsed(&self, state: &CircuitBreakerState, now: DateTime<Utc>) -> bool {
        match state.opened_at {
            Some(opened_at) => {
                let timeout =
                    chrono::Duration::seconds(self.config.recovery_timeout_seconds as i64);
                now.signed_duration_since(opened_at) >= timeout
            }
            None => {
                warn!("Open state missing opened_at timestamp");
                true
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Clock advanced by hand
    pub struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self {
                now: Mutex::new(Utc::now()),
            }
        }

        pub fn advance(&self, secs: i64) {
            let mut now = self.now.lock().unwrap();
            *now += chrono::Duration::seconds(secs);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }

    fn breaker() -> (CircuitBreaker, Arc<ManualClock>, Arc<GatewayMetrics>) {
        let clock = Arc::new(ManualClock::new());
        let metrics = Arc::new(GatewayMetrics::new());
        let cb = CircuitBreaker::with_clock(
            CircuitBreakerConfig::default(),
            metrics.clone(),
            clock.clone(),
        );
        (cb, clock, metrics)
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.recovery_timeout_seconds, 30);
        assert_eq!(config.half_open_requests, 3);
    }

    #[test]
    fn test_circuit_state_serialization() {
        assert_eq!(
            serde_json::to_value(CircuitState::HalfOpen).unwrap(),
            "half-open"
        );
        assert_eq!(CircuitState::Open.to_string(), "open");
    }

    #[test]
    fn test_opens_after_threshold() {
        let (cb, _clock, metrics) = breaker();

        for _ in 0..4 {
            cb.record_failure();
            assert!(!cb.is_open());
        }
        cb.record_failure();

        assert!(cb.is_open());
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(metrics.snapshot().circuit_breaker_trips, 1);
    }

    #[test]
    fn test_success_resets_failures_when_closed() {
        let (cb, _clock, _) = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[test]
    fn test_full_recovery_cycle() {
        let (cb, clock, _) = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        assert!(cb.is_open());

        clock.advance(29);
        assert!(cb.is_open());
        assert!(cb.retry_after_secs() >= 1);

        clock.advance(1);
        assert!(!cb.is_open());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();

        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (cb, clock, metrics) = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        clock.advance(30);
        assert!(!cb.is_open());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.is_open());
        assert_eq!(metrics.snapshot().circuit_breaker_trips, 2);
    }

    #[test]
    fn test_retry_after_counts_down() {
        let (cb, clock, _) = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.retry_after_secs(), 30);
        clock.advance(20);
        assert_eq!(cb.retry_after_secs(), 10);
        clock.advance(15);
        assert_eq!(cb.retry_after_secs(), 1);
    }

    #[tokio::test]
    async fn test_call_ignores_validation_errors() {
        let (cb, _clock, _) = breaker();
        for _ in 0..10 {
            let res: GatewayResult<()> =
                cb.call(async { Err(GatewayError::validation("bad key")) }).await;
            assert!(res.is_err());
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn test_call_records_backend_failures() {
        let (cb, _clock, _) = breaker();
        for _ in 0..5 {
            let _ = cb
                .call(async { Err::<(), _>(GatewayError::server("HTTP 500")) })
                .await;
        }
        assert!(matches!(
            cb.check(),
            Err(GatewayError::CircuitOpen { retry_after: 30 })
        ));
    }
}
