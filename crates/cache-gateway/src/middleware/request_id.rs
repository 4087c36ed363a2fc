//! Request correlation ids
//!
//! Every request carries an id that is logged by the gateway, passed to the
//! secrets resolver for audit, and echoed in the `X-Request-ID` response
//! header. A well-formed id supplied by the client is kept so traces can span
//! services; anything else is replaced with a fresh UUID v4.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::{HeaderName, HeaderValue},
    Error, HttpMessage, HttpRequest,
};
use futures_util::future::LocalBoxFuture;
use std::future::{ready, Ready};
use std::rc::Rc;
use uuid::Uuid;

const HEADER: &str = "x-request-id";
const MAX_LEN: usize = 128;

/// Request id stored in request extensions
#[derive(Debug, Clone)]
pub struct RequestIdExt(pub String);

/// Id of the current request, or a fresh one when the middleware is absent
pub fn request_id(req: &HttpRequest) -> String {
    req.extensions()
        .get::<RequestIdExt>()
        .map(|ext| ext.0.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn accept_client_id(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= MAX_LEN
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
}

#[derive(Clone, Default)]
pub struct RequestId;

impl<S, B> Transform<S, ServiceRequest> for RequestId
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestIdMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestIdMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct RequestIdMiddleware<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for RequestIdMiddleware<S>
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
        let service = self.service.clone();

        Box::pin(async move {
            let id = req
                .headers()
                .get(HEADER)
                .and_then(|h| h.to_str().ok())
                .filter(|raw| accept_client_id(raw))
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string());

            req.extensions_mut().insert(RequestIdExt(id.clone()));

            let mut res = service.call(req).await?;
            if let Ok(value) = HeaderValue::try_from(id.as_str()) {
                res.headers_mut()
                    .insert(HeaderName::from_static(HEADER), value);
            }
            Ok(res)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test as actix_test, web, App, HttpResponse};

    async fn echo_id(req: HttpRequest) -> HttpResponse {
        HttpResponse::Ok().body(request_id(&req))
    }

    #[test]
    fn test_client_id_validation() {
        assert!(accept_client_id("req-123_abc.def:1"));
        assert!(!accept_client_id(""));
        assert!(!accept_client_id("has space"));
        assert!(!accept_client_id("<script>"));
        assert!(!accept_client_id(&"a".repeat(MAX_LEN + 1)));
    }

    #[actix_web::test]
    async fn test_id_generated_and_echoed() {
        let app = actix_test::init_service(
            App::new()
                .wrap(RequestId)
                .route("/t", web::get().to(echo_id)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/t").to_request();
        let resp = actix_test::call_service(&app, req).await;
        let header = resp
            .headers()
            .get("x-request-id")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(Uuid::parse_str(&header).is_ok());

        let body = actix_test::read_body(resp).await;
        assert_eq!(body, header.as_bytes());
    }

    #[actix_web::test]
    async fn test_client_id_preserved() {
        let app = actix_test::init_service(
            App::new()
                .wrap(RequestId)
                .route("/t", web::get().to(echo_id)),
        )
        .await;

        let req = actix_test::TestRequest::get()
            .uri("/t")
            .insert_header(("X-Request-ID", "trace-42"))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.headers().get("x-request-id").unwrap(), "trace-42");
    }

    #[actix_web::test]
    async fn test_malformed_client_id_replaced() {
        let app = actix_test::init_service(
            App::new()
                .wrap(RequestId)
                .route("/t", web::get().to(echo_id)),
        )
        .await;

        let req = actix_test::TestRequest::get()
            .uri("/t")
            .insert_header(("X-Request-ID", "bad id with spaces"))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        let header = resp.headers().get("x-request-id").unwrap().to_str().unwrap();
        assert!(Uuid::parse_str(header).is_ok());
    }
}
