//! `GET` health endpoints

use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;

use crate::gateway::CacheGateway;
use crate::middleware::request_id;
use crate::models::HealthResponse;

/// `?check=` selector
#[derive(Debug, Default, Deserialize)]
pub struct HealthQuery {
    pub check: Option<String>,
}

/// Liveness, cross-service sweep, or detailed backend health
///
/// GET /api/v1/cache[?check=ping|services]
///
/// The detailed report answers 503 once the backend is unhealthy; the
/// sweep answers 503 when any configured service is down.
pub async fn health_check(
    gateway: web::Data<CacheGateway>,
    query: web::Query<HealthQuery>,
    req: HttpRequest,
) -> HttpResponse {
    let request_id = request_id(&req);

    match query.check.as_deref() {
        Some("ping") => HttpResponse::Ok().json(gateway.ping()),
        Some("services") => {
            let report = gateway.services_report(&request_id).await;
            if report.success {
                HttpResponse::Ok().json(report)
            } else {
                HttpResponse::ServiceUnavailable().json(report)
            }
        }
        _ => match gateway.health_report(&request_id).await {
            Ok(report) => {
                let success = report.status.is_serving();
                let body = HealthResponse { success, report };
                if success {
                    HttpResponse::Ok().json(body)
                } else {
                    HttpResponse::ServiceUnavailable().json(body)
                }
            }
            Err(e) => e.to_response(Some("health")),
        },
    }
}
