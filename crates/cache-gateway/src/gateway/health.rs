//! Health checks and diagnostics
//!
//! Two reports:
//!
//! - [`backend_report`]: detailed health of the cache backend (connectivity,
//!   latency, memory, hit rate, circuit state) with alerts
//! - [`services_report`]: parallel reachability sweep of the platform's
//!   auxiliary services plus the cache
//!
//! Classification is done by pure functions so thresholds are testable
//! without a backend.

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::gateway::circuit_breaker::CircuitState;
use crate::gateway::executor::{BackendCredentials, RedisExecutor};
use crate::gateway::metrics::MetricsSnapshot;
use crate::models::GATEWAY_VERSION;

/// Hit rate is not judged below this many lookups
const MIN_HIT_RATE_SAMPLES: u64 = 100;

/// Outcome of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

/// Overall backend status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl HealthStatus {
    /// Whether the endpoint should answer 200
    pub fn is_serving(self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub name: &'static str,
    pub status: CheckStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl HealthCheck {
    fn new(name: &'static str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name,
            status,
            message: message.into(),
            value: None,
        }
    }

    fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub check: &'static str,
    pub message: String,
}

/// Detailed backend health
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: String,
    pub version: &'static str,
    pub instance: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub checks: Vec<HealthCheck>,
    pub alerts: Vec<Alert>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_clients: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    pub circuit_breaker: CircuitState,
    pub metrics: MetricsSnapshot,
}

/// Round-trip latency: <100 ms pass, <500 ms warn
pub fn classify_latency(latency_ms: u64) -> HealthCheck {
    let status = match latency_ms {
        0..=99 => CheckStatus::Pass,
        100..=499 => CheckStatus::Warn,
        _ => CheckStatus::Fail,
    };
    HealthCheck::new("latency", status, format!("{}ms round trip", latency_ms))
        .with_value(latency_ms as f64)
}

/// Memory usage against `maxmemory`: <80 % pass, <95 % warn
///
/// A `maxmemory` of 0 means unbounded and always passes.
pub fn classify_memory(used: u64, max: u64) -> HealthCheck {
    if max == 0 {
        return HealthCheck::new("memory", CheckStatus::Pass, "No memory limit configured");
    }
    let pct = used as f64 / max as f64 * 100.0;
    let status = if pct < 80.0 {
        CheckStatus::Pass
    } else if pct < 95.0 {
        CheckStatus::Warn
    } else {
        CheckStatus::Fail
    };
    HealthCheck::new("memory", status, format!("{:.1}% of maxmemory used", pct)).with_value(pct)
}

/// Keyspace hit rate: >=70 % pass, >=50 % warn
///
/// With too few lookups the rate says nothing, so the check passes.
pub fn classify_hit_rate(hits: u64, misses: u64) -> HealthCheck {
    let samples = hits + misses;
    if samples <= MIN_HIT_RATE_SAMPLES {
        return HealthCheck::new(
            "hitRate",
            CheckStatus::Pass,
            format!("Not enough samples ({})", samples),
        );
    }
    let pct = hits as f64 / samples as f64 * 100.0;
    let status = if pct >= 70.0 {
        CheckStatus::Pass
    } else if pct >= 50.0 {
        CheckStatus::Warn
    } else {
        CheckStatus::Fail
    };
    HealthCheck::new("hitRate", status, format!("{:.1}% hit rate", pct)).with_value(pct)
}

pub fn classify_circuit(state: CircuitState) -> HealthCheck {
    let status = match state {
        CircuitState::Closed => CheckStatus::Pass,
        CircuitState::HalfOpen => CheckStatus::Warn,
        CircuitState::Open => CheckStatus::Fail,
    };
    HealthCheck::new("circuitBreaker", status, format!("Circuit {}", state))
}

/// Two or more failures are critical, one is unhealthy, any warning degrades
pub fn overall_status(checks: &[HealthCheck]) -> HealthStatus {
    let fails = checks.iter().filter(|c| c.status == CheckStatus::Fail).count();
    let warns = checks.iter().filter(|c| c.status == CheckStatus::Warn).count();
    match (fails, warns) {
        (f, _) if f >= 2 => HealthStatus::Critical,
        (1, _) => HealthStatus::Unhealthy,
        (0, w) if w > 0 => HealthStatus::Degraded,
        _ => HealthStatus::Healthy,
    }
}

/// One alert per check that did not pass
pub fn alerts_for(checks: &[HealthCheck]) -> Vec<Alert> {
    checks
        .iter()
        .filter_map(|c| {
            let severity = match c.status {
                CheckStatus::Pass => return None,
                CheckStatus::Warn => AlertSeverity::Warning,
                CheckStatus::Fail => AlertSeverity::Critical,
            };
            Some(Alert {
                severity,
                check: c.name,
                message: c.message.clone(),
            })
        })
        .collect()
}

/// Parse `INFO` output into `field -> value`
pub fn parse_info(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.trim().to_string()))
        .collect()
}

fn info_u64(info: &HashMap<String, String>, field: &str) -> Option<u64> {
    info.get(field).and_then(|v| v.parse().ok())
}

pub(crate) fn instance_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Build the detailed report for the cache backend
pub async fn backend_report(
    executor: &dyn RedisExecutor,
    circuit: CircuitState,
    metrics: MetricsSnapshot,
) -> HealthReport {
    let mut checks = Vec::with_capacity(5);
    let mut report = HealthReport {
        status: HealthStatus::Healthy,
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: GATEWAY_VERSION,
        instance: instance_name(),
        latency_ms: None,
        checks: Vec::new(),
        alerts: Vec::new(),
        connected_clients: None,
        server_version: None,
        uptime_seconds: None,
        circuit_breaker: circuit,
        metrics,
    };

    let started = Instant::now();
    match executor.execute(vec!["PING".to_string()]).await {
        Ok(_) => {
            let latency = started.elapsed().as_millis() as u64;
            report.latency_ms = Some(latency);
            checks.push(HealthCheck::new(
                "connectivity",
                CheckStatus::Pass,
                "Backend reachable",
            ));
            checks.push(classify_latency(latency));

            let sections = ["stats", "memory", "clients", "server"]
                .iter()
                .map(|s| vec!["INFO".to_string(), s.to_string()])
                .collect();
            match executor.pipeline(sections).await {
                Ok(replies) => {
                    let mut info = HashMap::new();
                    for reply in replies {
                        if let Some(text) = reply.as_str() {
                            info.extend(parse_info(text));
                        }
                    }
                    checks.push(classify_memory(
                        info_u64(&info, "used_memory").unwrap_or(0),
                        info_u64(&info, "maxmemory").unwrap_or(0),
                    ));
                    checks.push(classify_hit_rate(
                        info_u64(&info, "keyspace_hits").unwrap_or(0),
                        info_u64(&info, "keyspace_misses").unwrap_or(0),
                    ));
                    report.connected_clients = info_u64(&info, "connected_clients");
                    report.server_version = info.get("redis_version").cloned();
                    report.uptime_seconds = info_u64(&info, "uptime_in_seconds");
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read backend INFO");
                    checks.push(HealthCheck::new(
                        "info",
                        CheckStatus::Warn,
                        format!("INFO unavailable: {}", e),
                    ));
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "Backend ping failed");
            checks.push(HealthCheck::new(
                "connectivity",
                CheckStatus::Fail,
                format!("Backend unreachable: {}", e),
            ));
        }
    }

    checks.push(classify_circuit(circuit));

    report.status = overall_status(&checks);
    report.alerts = alerts_for(&checks);
    report.checks = checks;
    debug!(status = ?report.status, alerts = report.alerts.len(), "Built backend health report");
    report
}

/// Reachability probe of an auxiliary service
#[async_trait]
pub trait ServiceProbe: Send + Sync {
    async fn probe(&self, url: &str, token: &str) -> Result<(), String>;
}

/// HTTP `GET` probe with bearer auth; any 2xx is healthy
pub struct HttpServiceProbe {
    client: reqwest::Client,
}

impl HttpServiceProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceProbe for HttpServiceProbe {
    async fn probe(&self, url: &str, token: &str) -> Result<(), String> {
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", response.status().as_u16()))
        }
    }
}

/// One auxiliary service to probe
pub struct ServiceTarget {
    pub name: &'static str,
    /// Appended to the base URL
    pub path: &'static str,
    /// `None` when the service is not configured
    pub credentials: Option<BackendCredentials>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Unhealthy,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResult {
    pub name: &'static str,
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServicesSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServicesReport {
    pub success: bool,
    pub timestamp: String,
    pub summary: ServicesSummary,
    pub services: Vec<ServiceResult>,
}

fn timed_result(name: &'static str, started: Instant, outcome: Result<(), String>) -> ServiceResult {
    let latency_ms = Some(started.elapsed().as_millis() as u64);
    match outcome {
        Ok(()) => ServiceResult {
            name,
            status: ServiceStatus::Healthy,
            latency_ms,
            error: None,
        },
        Err(error) => ServiceResult {
            name,
            status: ServiceStatus::Unhealthy,
            latency_ms,
            error: Some(error),
        },
    }
}

fn skipped(name: &'static str) -> ServiceResult {
    ServiceResult {
        name,
        status: ServiceStatus::Skipped,
        latency_ms: None,
        error: None,
    }
}

/// Probe every service and the cache concurrently
///
/// Unconfigured services are skipped and do not affect `success`.
pub async fn services_report(
    probe: Arc<dyn ServiceProbe>,
    targets: Vec<ServiceTarget>,
    cache: Option<Arc<dyn RedisExecutor>>,
) -> ServicesReport {
    let service_checks = targets.into_iter().map(|target| {
        let probe = probe.clone();
        async move {
            let Some(creds) = target.credentials else {
                return skipped(target.name);
            };
            let url = format!("{}{}", creds.url.trim_end_matches('/'), target.path);
            let started = Instant::now();
            let outcome = probe.probe(&url, &creds.token).await;
            timed_result(target.name, started, outcome)
        }
    });

    let cache_check = async move {
        let Some(executor) = cache else {
            return skipped("cache");
        };
        let started = Instant::now();
        let outcome = executor
            .execute(vec!["PING".to_string()])
            .await
            .map(|_| ())
            .map_err(|e| e.to_string());
        timed_result("cache", started, outcome)
    };

    let (mut services, cache_result) =
        futures_util::join!(join_all(service_checks), cache_check);
    services.push(cache_result);

    let mut summary = ServicesSummary {
        total: services.len(),
        ..Default::default()
    };
    for s in &services {
        match s.status {
            ServiceStatus::Healthy => summary.healthy += 1,
            ServiceStatus::Unhealthy => summary.unhealthy += 1,
            ServiceStatus::Skipped => summary.skipped += 1,
        }
    }

    ServicesReport {
        success: summary.unhealthy == 0,
        timestamp: chrono::Utc::now().to_rfc3339(),
        summary,
        services,
    }
}
