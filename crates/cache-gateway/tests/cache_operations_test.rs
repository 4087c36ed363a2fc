//! End-to-end cache operations through the HTTP surface
//!
//! Every test wires the real routes, identity resolution and gateway to an
//! in-memory [`common::FakeRedis`].

mod common;

use actix_web::{http::StatusCode, test, App};
use serde_json::{json, Value};

use common::{create_service_jwt, create_test_jwt, TestState, CACHE_URI};

fn post(token: Option<&str>, body: Value) -> test::TestRequest {
    let req = test::TestRequest::post().uri(CACHE_URI).set_json(body);
    match token {
        Some(token) => req.insert_header(("Authorization", format!("Bearer {}", token))),
        None => req,
    }
}

#[actix_web::test]
async fn test_set_then_get_round_trip() {
    let state = TestState::new();
    let app = test::init_service(App::new().configure(|cfg| state.configure(cfg))).await;
    let token = create_test_jwt("alice");

    let req = post(
        Some(&token),
        json!({"operation": "set", "key": "pref", "value": "dark"}),
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["operation"], "set");
    assert_eq!(body["result"]["ttl"], 900);
    assert_eq!(body["metadata"]["compressed"], false);
    assert_eq!(body["metadata"]["circuitBreaker"], "closed");

    assert_eq!(state.redis.stored("user:alice:pref").as_deref(), Some("dark"));
    assert_eq!(state.redis.ttl_of("user:alice:pref"), Some(900));

    let req = post(Some(&token), json!({"operation": "get", "key": "pref"})).to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["result"], json!({"value": "dark"}));
}

#[actix_web::test]
async fn test_get_missing_key_is_null_success() {
    let state = TestState::new();
    let app = test::init_service(App::new().configure(|cfg| state.configure(cfg))).await;

    let req = post(
        Some(&create_test_jwt("alice")),
        json!({"operation": "get", "key": "user:alice:nothing"}),
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["result"]["value"], Value::Null);
}

#[actix_web::test]
async fn test_cross_user_read_is_rejected() {
    let state = TestState::new();
    let app = test::init_service(App::new().configure(|cfg| state.configure(cfg))).await;

    let req = post(
        Some(&create_test_jwt("alice")),
        json!({"operation": "get", "key": "user:bob:pref"}),
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "validation_error");
    assert_eq!(body["operation"], "get");
    assert!(state.redis.commands().is_empty());
}

#[actix_web::test]
async fn test_anonymous_unscoped_key_requires_auth() {
    let state = TestState::new();
    let app = test::init_service(App::new().configure(|cfg| state.configure(cfg))).await;

    let req = post(None, json!({"operation": "get", "key": "pref"})).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn test_global_write_rejected_even_for_service_role() {
    let state = TestState::new();
    let app = test::init_service(App::new().configure(|cfg| state.configure(cfg))).await;

    let req = post(
        Some(&create_service_jwt("svc")),
        json!({"operation": "set", "key": "global:banner", "value": "hi"}),
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // app keys are writable by privileged callers
    let req = post(
        Some(&create_service_jwt("svc")),
        json!({"operation": "set", "key": "app:banner", "value": "hi"}),
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(state.redis.stored("app:banner").as_deref(), Some("hi"));
}

#[actix_web::test]
async fn test_oversized_mdel_never_reaches_backend() {
    let state = TestState::new();
    let app = test::init_service(App::new().configure(|cfg| state.configure(cfg))).await;

    let keys: Vec<String> = (0..101).map(|i| format!("k{}", i)).collect();
    let req = post(
        Some(&create_test_jwt("alice")),
        json!({"operation": "mdel", "keys": keys}),
    )
    .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(state.redis.commands().is_empty());
}

#[actix_web::test]
async fn test_malformed_requests() {
    let state = TestState::new();
    let app = test::init_service(App::new().configure(|cfg| state.configure(cfg))).await;
    let token = create_test_jwt("alice");

    let req = post(Some(&token), json!({"key": "k"})).to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["message"], "Missing required field: operation");

    let req = post(Some(&token), json!({"operation": "frobnicate"})).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["operation"], "frobnicate");

    let req = post(Some(&token), json!({"operation": "set", "key": "k"})).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn test_large_values_are_compressed_transparently() {
    let state = TestState::new();
    let app = test::init_service(App::new().configure(|cfg| state.configure(cfg))).await;
    let token = create_test_jwt("alice");
    let big = "lorem ipsum ".repeat(200);

    let req = post(
        Some(&token),
        json!({"operation": "set", "key": "doc", "value": big.clone()}),
    )
    .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["metadata"]["compressed"], true);

    let stored = state.redis.stored("user:alice:doc").unwrap();
    assert!(stored.starts_with("gz:"));
    assert!(stored.len() < big.len());

    let req = post(Some(&token), json!({"operation": "get", "key": "doc"})).to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["result"]["value"], big);
    assert_eq!(body["metadata"]["compressed"], true);

    assert!(state.gateway.metrics().snapshot().compression_savings > 0);
}

#[actix_web::test]
async fn test_function_alias_route() {
    let state = TestState::new();
    let app = test::init_service(App::new().configure(|cfg| state.configure(cfg))).await;

    let req = test::TestRequest::post()
        .uri("/functions/v1/api-v1-cache")
        .insert_header(("Authorization", format!("Bearer {}", create_test_jwt("alice"))))
        .set_json(json!({"operation": "exists", "key": "k"}))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["success"], true);
    assert_eq!(state.redis.commands()[0], vec!["EXISTS", "user:alice:k"]);
}
