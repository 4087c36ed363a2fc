//! Cache gateway service
//!
//! [`CacheGateway`] owns the process-wide state (circuit breaker, metrics,
//! coalescing registry, rate limiter) and runs the request pipeline:
//!
//! ```text
//! circuit gate → rate limit → [breaker: credentials → dispatch] → metrics
//! ```
//!
//! One instance is built at startup and shared with handlers through
//! `web::Data`.

use shared::{CacheConfig, RateLimitCounter, SecretRequest, SecretResolver, ServiceSecretNames};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::gateway::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Clock};
use crate::gateway::coalescer::RequestCoalescer;
use crate::gateway::dispatcher::{DispatchOutcome, DispatchSettings, Dispatcher};
use crate::gateway::error::{GatewayError, GatewayResult};
use crate::gateway::executor::{BackendCredentials, ExecutorFactory, RedisExecutor};
use crate::gateway::health::{self, HealthReport, ServiceProbe, ServiceTarget, ServicesReport};
use crate::gateway::metrics::GatewayMetrics;
use crate::gateway::operations::{CacheOperation, CacheOperationRequest, OperationClass, OperationOptions};
use crate::gateway::rate_limit::TieredRateLimiter;
use crate::gateway::scope::{scope_key, CallerContext};
use crate::models::{OperationResponse, PingResponse, ResponseMetadata, GATEWAY_VERSION};

/// Pluggable collaborators of the gateway
pub struct GatewayDependencies {
    pub secrets: Arc<dyn SecretResolver>,
    pub executors: Arc<dyn ExecutorFactory>,
    pub counter: Arc<dyn RateLimitCounter>,
    pub probe: Arc<dyn ServiceProbe>,
}

/// Resolves backend credentials and builds an executor for them
#[derive(Clone)]
struct BackendSource {
    secrets: Arc<dyn SecretResolver>,
    executors: Arc<dyn ExecutorFactory>,
    url_secret: String,
    token_secret: String,
}

impl BackendSource {
    async fn credentials(
        &self,
        caller_id: Option<&str>,
        purpose: &str,
        request_id: &str,
    ) -> GatewayResult<BackendCredentials> {
        let meta = SecretRequest::new(purpose).with_request_id(request_id);
        let url = self
            .secrets
            .get_secret(&self.url_secret, caller_id, &meta)
            .await?;
        let token = self
            .secrets
            .get_secret(&self.token_secret, caller_id, &meta)
            .await?;
        Ok(BackendCredentials { url, token })
    }

    async fn executor(
        &self,
        caller_id: Option<&str>,
        purpose: &str,
        request_id: &str,
    ) -> GatewayResult<Arc<dyn RedisExecutor>> {
        let creds = self.credentials(caller_id, purpose, request_id).await?;
        self.executors.executor(&creds)
    }
}

pub struct CacheGateway {
    backend: BackendSource,
    services: ServiceSecretNames,
    settings: DispatchSettings,
    breaker: CircuitBreaker,
    metrics: Arc<GatewayMetrics>,
    coalescer: RequestCoalescer<DispatchOutcome>,
    limiter: TieredRateLimiter,
    secrets: Arc<dyn SecretResolver>,
    probe: Arc<dyn ServiceProbe>,
}

impl CacheGateway {
    pub fn new(
        config: &CacheConfig,
        services: ServiceSecretNames,
        deps: GatewayDependencies,
    ) -> Self {
        let metrics = Arc::new(GatewayMetrics::new());
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::from(config), metrics.clone());
        Self::assemble(config, services, deps, metrics, breaker)
    }

    /// Same as [`CacheGateway::new`] with a custom breaker clock
    pub fn with_clock(
        config: &CacheConfig,
        services: ServiceSecretNames,
        deps: GatewayDependencies,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let metrics = Arc::new(GatewayMetrics::new());
        let breaker = CircuitBreaker::with_clock(
            CircuitBreakerConfig::from(config),
            metrics.clone(),
            clock,
        );
        Self::assemble(config, services, deps, metrics, breaker)
    }

    fn assemble(
        config: &CacheConfig,
        services: ServiceSecretNames,
        deps: GatewayDependencies,
        metrics: Arc<GatewayMetrics>,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            backend: BackendSource {
                secrets: deps.secrets.clone(),
                executors: deps.executors,
                url_secret: config.url_secret.clone(),
                token_secret: config.token_secret.clone(),
            },
            services,
            settings: DispatchSettings::from(config),
            breaker,
            coalescer: RequestCoalescer::new(
                Duration::from_millis(config.coalesce_window_ms),
                metrics.clone(),
            ),
            metrics,
            limiter: TieredRateLimiter::new(deps.counter),
            secrets: deps.secrets,
            probe: deps.probe,
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// Run one operation through the full pipeline
    pub async fn execute(
        &self,
        request: CacheOperationRequest,
        caller: &CallerContext,
        request_id: &str,
    ) -> GatewayResult<OperationResponse> {
        let operation = request.operation.name();
        let started = Instant::now();

        let result = self.process(request, caller, request_id).await;

        let elapsed = started.elapsed();
        self.metrics
            .record_request(operation, result.is_ok(), elapsed.as_secs_f64() * 1000.0);

        match result {
            Ok(outcome) => Ok(OperationResponse {
                success: true,
                operation,
                result: outcome.result,
                metadata: ResponseMetadata {
                    version: GATEWAY_VERSION,
                    compressed: outcome.compressed,
                    execution_ms: elapsed.as_millis() as u64,
                    circuit_breaker: self.breaker.state(),
                },
            }),
            Err(e) => {
                match &e {
                    GatewayError::Server { message, .. } => warn!(
                        request_id = %request_id,
                        operation,
                        error = %message,
                        "Cache operation failed"
                    ),
                    other => debug!(
                        request_id = %request_id,
                        operation,
                        code = other.code(),
                        "Cache operation rejected"
                    ),
                }
                Err(e)
            }
        }
    }

    async fn process(
        &self,
        request: CacheOperationRequest,
        caller: &CallerContext,
        request_id: &str,
    ) -> GatewayResult<DispatchOutcome> {
        let CacheOperationRequest { operation, options } = request;

        if options.encrypt == Some(true) {
            warn!(
                request_id = %request_id,
                operation = operation.name(),
                "Encryption requested but not supported, storing unencrypted"
            );
        }
        debug!(
            request_id = %request_id,
            operation = operation.name(),
            actor = %caller.actor_id,
            priority = ?options.priority,
            "Processing cache operation"
        );

        self.breaker.check()?;
        self.limiter
            .check_limit(&caller.actor_id, operation.class(), caller.tier)
            .await?;

        self.breaker
            .call(self.run(operation, options, caller.clone(), request_id))
            .await
    }

    async fn run(
        &self,
        operation: CacheOperation,
        options: OperationOptions,
        caller: CallerContext,
        request_id: &str,
    ) -> GatewayResult<DispatchOutcome> {
        let coalesce_key = self.coalescing_key(&operation, &options, &caller)?;

        let backend = self.backend.clone();
        let metrics = self.metrics.clone();
        let settings = self.settings.clone();
        let circuit = self.breaker.state();
        let request_id = request_id.to_string();
        let dispatch = async move {
            let executor = backend
                .executor(caller.user_id.as_deref(), "cache-backend", &request_id)
                .await?;
            Dispatcher::new(executor, metrics, settings, circuit)
                .dispatch(operation, &options, &caller)
                .await
        };

        match coalesce_key {
            Some(key) => self.coalescer.coalesce(key, dispatch).await,
            None => dispatch.await,
        }
    }

    fn coalescing_key(
        &self,
        operation: &CacheOperation,
        options: &OperationOptions,
        caller: &CallerContext,
    ) -> GatewayResult<Option<String>> {
        if operation.class() != OperationClass::Read || !options.coalescing_enabled() {
            return Ok(None);
        }
        let Some((key, detail)) = operation.coalescing_target() else {
            return Ok(None);
        };
        let scoped = scope_key(key, caller, false)?;
        Ok(Some(format!(
            "{}:{}:{}:{}{}",
            operation.name(),
            scoped.key,
            detail,
            u8::from(options.reverse),
            u8::from(options.with_scores),
        )))
    }

    /// Liveness answer; never touches the backend
    pub fn ping(&self) -> PingResponse {
        let circuit = self.breaker.state();
        PingResponse {
            success: true,
            status: if circuit == CircuitState::Closed {
                "healthy"
            } else {
                "degraded"
            },
            version: GATEWAY_VERSION,
            circuit_breaker: circuit,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Detailed backend report; runs even while the breaker is open
    pub async fn health_report(&self, request_id: &str) -> GatewayResult<HealthReport> {
        let executor = self
            .backend
            .executor(None, "health-check", request_id)
            .await?;
        let report = health::backend_report(
            executor.as_ref(),
            self.breaker.state(),
            self.metrics.snapshot(),
        )
        .await;
        info!(
            request_id = %request_id,
            status = ?report.status,
            alerts = report.alerts.len(),
            "Cache health check completed"
        );
        Ok(report)
    }

    /// Cross-service reachability sweep
    pub async fn services_report(&self, request_id: &str) -> ServicesReport {
        let mut targets = Vec::with_capacity(3);
        for (name, path, secrets) in [
            ("vector", "/info", &self.services.vector),
            ("queue", "/v2/queues", &self.services.queue),
            ("search", "/info", &self.services.search),
        ] {
            targets.push(ServiceTarget {
                name,
                path,
                credentials: self.optional_credentials(name, secrets, request_id).await,
            });
        }

        let cache = match self.backend.executor(None, "health-sweep", request_id).await {
            Ok(executor) => Some(executor),
            Err(e) => {
                debug!(error = %e, "Cache credentials unavailable, skipping cache probe");
                None
            }
        };

        health::services_report(self.probe.clone(), targets, cache).await
    }

    async fn optional_credentials(
        &self,
        service: &str,
        (url_name, token_name): &(String, String),
        request_id: &str,
    ) -> Option<BackendCredentials> {
        let meta = SecretRequest::new("health-sweep").with_request_id(request_id);
        let url = self.secrets.get_secret(url_name, None, &meta).await;
        let token = self.secrets.get_secret(token_name, None, &meta).await;
        match (url, token) {
            (Ok(url), Ok(token)) => Some(BackendCredentials { url, token }),
            (Err(e), _) | (_, Err(e)) => {
                if !e.is_not_found() {
                    warn!(service, error = %e, "Failed to resolve service credentials");
                }
                None
            }
        }
    }
}
