//! `POST` cache operations

use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use tracing::debug;

use crate::gateway::{CacheGateway, CacheOperationRequest};
use crate::middleware::{request_id, IdentityResolver};

/// Just the discriminant, used to echo the operation in parse errors
#[derive(Deserialize)]
struct OperationName {
    operation: Option<String>,
}

fn operation_hint(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<OperationName>(body)
        .ok()
        .and_then(|o| o.operation)
}

/// Execute one cache operation
///
/// POST /api/v1/cache
pub async fn execute_operation(
    gateway: web::Data<CacheGateway>,
    identity: web::Data<dyn IdentityResolver>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    let request_id = request_id(&req);

    let request = match CacheOperationRequest::from_json(&body) {
        Ok(request) => request,
        Err(e) => {
            let hint = operation_hint(&body);
            debug!(request_id = %request_id, error = %e, "Rejected malformed cache request");
            return e.to_response(hint.as_deref());
        }
    };

    let operation = request.operation.name();
    let caller = identity.resolve(&req);

    match gateway.execute(request, &caller, &request_id).await {
        Ok(response) => HttpResponse::Ok().json(response),
        Err(e) => e.to_response(Some(operation)),
    }
}
