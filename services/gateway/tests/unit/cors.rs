//! CORS preflight and request correlation

use axum::{body::Body, http::StatusCode};
use wiremock::matchers::{header, method};
use wiremock::{Mock, ResponseTemplate};

use super::helpers::*;

fn preflight(uri: &str) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .method("OPTIONS")
        .uri(uri)
        .header("origin", "http://localhost:3000")
        .header("access-control-request-method", "GET")
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn preflight_short_circuits_with_204() {
    let upstreams = Upstreams::start().await;
    Mock::given(method("OPTIONS"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstreams.orders)
        .await;
    let app = build_app(upstreams.config());

    let response = send(&app, preflight("/api/v1/orders/5")).await;

    assert_eq!(response.status, StatusCode::NO_CONTENT);
    assert!(response.body.is_empty());
    assert_eq!(response.headers["access-control-allow-origin"], "*");
    assert_eq!(
        response.headers["access-control-allow-methods"],
        "GET, POST, PUT, DELETE"
    );
    assert!(
        response.headers["access-control-allow-headers"]
            .to_str()
            .unwrap()
            .contains("Authorization")
    );
    assert!(!response.headers.contains_key("x-ratelimit-limit"));
    assert!(response.headers.contains_key("x-request-id"));
}

#[tokio::test]
async fn preflight_does_not_consume_quota() {
    let upstreams = Upstreams::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstreams.orders)
        .await;
    let mut config = upstreams.config();
    config.rate_limiting.requests_per_window = 1;
    let app = build_app(config);

    for _ in 0..5 {
        assert_eq!(
            send(&app, preflight("/api/v1/orders")).await.status,
            StatusCode::NO_CONTENT
        );
    }

    let request = get("/api/v1/orders")
        .header("authorization", bearer(&create_test_jwt(1, &[])))
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.status, StatusCode::OK);
}

#[tokio::test]
async fn allow_list_echoes_known_origin_only() {
    let upstreams = Upstreams::start().await;
    let mut config = upstreams.config();
    config.cors.allowed_origins = vec!["http://localhost:3000".to_string()];
    let app = build_app(config);

    let allowed = send(&app, preflight("/api/v1/orders")).await;
    assert_eq!(
        allowed.headers["access-control-allow-origin"],
        "http://localhost:3000"
    );

    let request = axum::http::Request::builder()
        .method("OPTIONS")
        .uri("/api/v1/orders")
        .header("origin", "http://evil.example")
        .body(Body::empty())
        .unwrap();
    let denied = send(&app, request).await;
    assert_eq!(denied.status, StatusCode::NO_CONTENT);
    assert!(!denied.headers.contains_key("access-control-allow-origin"));
}

#[tokio::test]
async fn error_responses_carry_cors_headers() {
    let upstreams = Upstreams::start().await;
    let app = build_app(upstreams.config());

    let response = send(&app, get("/api/v1/orders").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers["access-control-allow-origin"], "*");
}

#[tokio::test]
async fn client_request_id_is_preserved_and_forwarded() {
    let upstreams = Upstreams::start().await;
    Mock::given(method("GET"))
        .and(header("x-request-id", "trace-abc-123"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstreams.orders)
        .await;
    let app = build_app(upstreams.config());

    let request = get("/api/v1/orders")
        .header("authorization", bearer(&create_test_jwt(1, &[])))
        .header("x-request-id", "trace-abc-123")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers["x-request-id"], "trace-abc-123");
}

#[tokio::test]
async fn request_ids_are_generated_and_distinct() {
    let upstreams = Upstreams::start().await;
    let app = build_app(upstreams.config());

    let first = send(&app, get("/api/v1/orders").body(Body::empty()).unwrap()).await;
    let second = send(&app, get("/api/v1/orders").body(Body::empty()).unwrap()).await;

    let first = first.headers["x-request-id"].to_str().unwrap().to_string();
    let second = second.headers["x-request-id"].to_str().unwrap().to_string();
    assert!(first.starts_with("req-"));
    assert_ne!(first, second);
}
