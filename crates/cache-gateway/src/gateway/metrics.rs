//! Process-lifetime request metrics
//!
//! [`GatewayMetrics`] keeps the snapshot served by `stats` and the health
//! report, and mirrors every record into the Prometheus recorder installed
//! by [`crate::middleware::metrics::init_metrics`]. Without an installed
//! recorder the `metrics` macros are no-ops, so unit tests need no setup.

use metrics::{counter, gauge, histogram};
use serde::Serialize;
use std::sync::Mutex;

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Incremental mean over every recorded request
    pub avg_latency_ms: f64,
    pub circuit_breaker_trips: u64,
    /// Bytes saved by compression; negative when encoding grew values
    pub compression_savings: i64,
    pub coalesced_requests: u64,
}

/// Shared accumulator
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    inner: Mutex<MetricsSnapshot>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one operation
    pub fn record_request(&self, operation: &str, success: bool, latency_ms: f64) {
        {
            let mut m = self.lock();
            m.total_requests += 1;
            if success {
                m.successful_requests += 1;
            } else {
                m.failed_requests += 1;
            }
            let n = m.total_requests as f64;
            m.avg_latency_ms += (latency_ms - m.avg_latency_ms) / n;
        }

        let status = if success { "success" } else { "error" };
        counter!(
            "cache_gateway_requests_total",
            "operation" => operation.to_string(),
            "status" => status
        )
        .increment(1);
        histogram!(
            "cache_gateway_request_duration_seconds",
            "operation" => operation.to_string()
        )
        .record(latency_ms / 1000.0);
    }

    pub fn record_compression_savings(&self, bytes: i64) {
        let total = {
            let mut m = self.lock();
            m.compression_savings += bytes;
            m.compression_savings
        };
        gauge!("cache_gateway_compression_saved_bytes").set(total as f64);
    }

    pub fn record_coalesced(&self) {
        self.lock().coalesced_requests += 1;
        counter!("cache_gateway_coalesced_total").increment(1);
    }

    pub fn record_circuit_trip(&self) {
        self.lock().circuit_breaker_trips += 1;
        counter!("cache_gateway_circuit_trips_total").increment(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsSnapshot> {
        // a panic while holding the lock leaves plain counters behind
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
