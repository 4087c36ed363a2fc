//! Prometheus export
//!
//! The gateway keeps its own accumulator (see [`crate::gateway::metrics`]) for
//! the `stats` operation and health reports; every record there is mirrored to
//! the `metrics` facade, and this module installs the Prometheus recorder that
//! renders those series on `GET /metrics`.
//!
//! # Series
//!
//! - `cache_gateway_requests_total{operation,status}`
//! - `cache_gateway_request_duration_seconds`
//! - `cache_gateway_circuit_trips_total`
//! - `cache_gateway_coalesced_total`
//! - `cache_gateway_compression_saved_bytes`
//! - `http_requests_total{method,route,status}` and
//!   `http_request_duration_seconds`, recorded by [`HttpMetrics`]

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpResponse,
};
use futures_util::future::LocalBoxFuture;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::future::{ready, Ready};
use std::time::Instant;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder once per process
///
/// Later calls return the handle installed by the first one.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    PROMETHEUS_HANDLE
        .get_or_try_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;
            describe();
            Ok(handle)
        })
        .cloned()
}

fn describe() {
    describe_counter!(
        "cache_gateway_requests_total",
        "Cache operations processed, by operation and outcome"
    );
    describe_histogram!(
        "cache_gateway_request_duration_seconds",
        "Cache operation latency in seconds"
    );
    describe_counter!(
        "cache_gateway_circuit_trips_total",
        "Times the backend circuit breaker opened"
    );
    describe_counter!(
        "cache_gateway_coalesced_total",
        "Reads served by joining an in-flight request"
    );
    describe_gauge!(
        "cache_gateway_compression_saved_bytes",
        "Cumulative bytes saved by value compression"
    );
    describe_counter!("http_requests_total", "Total number of HTTP requests processed");
    describe_histogram!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds"
    );
}

/// `GET /metrics`
pub async fn metrics_handler() -> HttpResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4; charset=utf-8")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

/// Per-route HTTP request metrics
///
/// Routes are labelled by their registered pattern, so the label set stays
/// bounded whatever the request path.
#[derive(Clone, Default)]
pub struct HttpMetrics;

impl<S, B> Transform<S, ServiceRequest> for HttpMetrics
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = HttpMetricsMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(HttpMetricsMiddleware { service }))
    }
}

pub struct HttpMetricsMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for HttpMetricsMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start = Instant::now();
        let method = req.method().to_string();
        let route = route_label(req.match_pattern());
        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let status = match &result {
                Ok(response) => response.status().as_u16(),
                Err(e) => e.as_response_error().status_code().as_u16(),
            };
            if route != "/metrics" {
                let status = status.to_string();
                counter!(
                    "http_requests_total",
                    "method" => method.clone(),
                    "route" => route.clone(),
                    "status" => status.clone()
                )
                .increment(1);
                histogram!(
                    "http_request_duration_seconds",
                    "method" => method,
                    "route" => route,
                    "status" => status
                )
                .record(start.elapsed().as_secs_f64());
            }
            result
        })
    }
}

fn route_label(pattern: Option<String>) -> String {
    pattern.unwrap_or_else(|| "unmatched".to_string())
}
