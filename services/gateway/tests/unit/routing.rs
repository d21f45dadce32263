//! Prefix routing and forwarding through the assembled pipeline

use axum::{body::Body, extract::ConnectInfo, http::StatusCode};
use rstest::rstest;
use std::net::SocketAddr;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use super::helpers::*;

#[tokio::test]
async fn orders_path_always_reaches_orders_upstream() {
    let upstreams = Upstreams::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/orders/42"))
        .respond_with(ResponseTemplate::new(200).set_body_string("order 42"))
        .expect(5)
        .mount(&upstreams.orders)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstreams.users)
        .await;
    let app = build_app(upstreams.config());
    let token = create_test_jwt(1, &["engineer"]);

    for _ in 0..5 {
        let request = get("/api/v1/orders/42")
            .header("authorization", bearer(&token))
            .body(Body::empty())
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text(), "order 42");
    }
}

#[tokio::test]
async fn admin_paths_reach_users_upstream_with_query() {
    let upstreams = Upstreams::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/v1/admin/users/9"))
        .and(query_param("hard", "true"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-upstream", "users")
                .set_body_json(serde_json::json!({"deleted": 9})),
        )
        .expect(1)
        .mount(&upstreams.users)
        .await;
    let app = build_app(upstreams.config());

    let request = axum::http::Request::builder()
        .method("DELETE")
        .uri("/api/v1/admin/users/9?hard=true")
        .header("authorization", bearer(&create_test_jwt(1, &["admin"])))
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers["x-upstream"], "users");
    assert_eq!(response.json()["deleted"], 9);
}

#[tokio::test]
async fn upstream_status_is_passed_through() {
    let upstreams = Upstreams::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({"error": "no order"})))
        .mount(&upstreams.orders)
        .await;
    let app = build_app(upstreams.config());

    let request = get("/api/v1/orders/404")
        .header("authorization", bearer(&create_test_jwt(1, &[])))
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;

    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.json(), serde_json::json!({"error": "no order"}));
}

#[tokio::test]
async fn unmatched_path_is_not_found_after_authentication() {
    let upstreams = Upstreams::start().await;
    let app = build_app(upstreams.config());

    let anonymous = send(&app, get("/api/v1/unknown").body(Body::empty()).unwrap()).await;
    assert_eq!(anonymous.status, StatusCode::UNAUTHORIZED);

    let request = get("/api/v1/unknown")
        .header("authorization", bearer(&create_test_jwt(1, &[])))
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.error().0, "not_found");
}

#[tokio::test]
async fn login_only_accepts_post() {
    let upstreams = Upstreams::start().await;
    let app = build_app(upstreams.config());

    let response = send(&app, get("/api/v1/auth/login").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let upstreams = Upstreams::start().await;
    let app = build_app(create_test_config(&upstreams.users.uri(), &closed_port_url()));

    let request = get("/api/v1/orders/5")
        .header("authorization", bearer(&create_test_jwt(1, &[])))
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;

    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert_eq!(
        response.error(),
        (
            "service_unavailable".to_string(),
            "Service unavailable".to_string()
        )
    );
    assert!(!response.text().contains("127.0.0.1"));
}

#[tokio::test]
async fn slow_upstream_is_gateway_timeout() {
    let upstreams = Upstreams::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(4)))
        .mount(&upstreams.orders)
        .await;
    let mut config = upstreams.config();
    config.server.upstream_timeout_seconds = 1;
    let app = build_app(config);

    let request = get("/api/v1/orders")
        .header("authorization", bearer(&create_test_jwt(1, &[])))
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;

    assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(response.error().1, "Service unavailable");
}

#[tokio::test]
async fn orders_down_is_logged_once_with_bad_gateway() {
    let upstreams = Upstreams::start().await;
    let app = build_app(create_test_config(&upstreams.users.uri(), &closed_port_url()));
    let (access_log, _guard) = AccessLog::capture();

    let request = get("/api/v1/orders/5")
        .header("authorization", bearer(&create_test_jwt(1, &[])))
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;

    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert_eq!(access_log.statuses(), vec![502]);
}

#[rstest]
#[case::parent_segments("/api/v1/auth/login/../../admin/users")]
#[case::encoded_parent_segments("/api/v1/auth/login/%2e%2e/%2E%2E/admin/users")]
#[case::mixed_encoding("/api/v1/auth/login/.%2e/.%2E/admin/users")]
#[case::current_segment("/api/v1/orders/./5")]
#[tokio::test]
async fn dot_segment_paths_are_rejected_before_routing(#[case] uri: &str) {
    let upstreams = Upstreams::start().await;
    for server in [&upstreams.users, &upstreams.orders] {
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("reached"))
            .expect(0)
            .mount(server)
            .await;
    }
    let app = build_app(upstreams.config());

    let request = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(r#"{"email":"a@b.c","password":"pw"}"#))
        .unwrap();
    let response = send(&app, request).await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.error().0, "bad_request");
}

#[tokio::test]
async fn login_sub_paths_are_not_public() {
    let upstreams = Upstreams::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstreams.users)
        .await;
    let app = build_app(upstreams.config());

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/api/v1/auth/login/anything")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[rstest]
#[case::declared_length(true)]
#[case::undeclared_length(false)]
#[tokio::test]
async fn oversized_body_gets_error_envelope(#[case] declare_length: bool) {
    let upstreams = Upstreams::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstreams.users)
        .await;
    let mut config = upstreams.config();
    config.server.max_body_size = 1024;
    let app = build_app(config);
    let (access_log, _guard) = AccessLog::capture();

    let body = vec![b'a'; 4096];
    let mut request = axum::http::Request::builder()
        .method("POST")
        .uri("/api/v1/auth/login");
    if declare_length {
        request = request.header("content-length", body.len());
    }
    let response = send(&app, request.body(Body::from(body)).unwrap()).await;

    assert_eq!(response.status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(
        response.error(),
        (
            "payload_too_large".to_string(),
            "Request body too large".to_string()
        )
    );
    assert!(response.headers.contains_key("x-request-id"));
    assert_eq!(access_log.statuses(), vec![413]);
}

#[tokio::test]
async fn forwarded_for_appends_socket_peer() {
    let upstreams = Upstreams::start().await;
    Mock::given(method("GET"))
        .and(|req: &wiremock::Request| {
            req.headers
                .get("x-forwarded-for")
                .is_some_and(|value| value == "203.0.113.7, 10.1.2.3")
        })
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstreams.orders)
        .await;
    let app = build_app(upstreams.config());

    let mut request = get("/api/v1/orders")
        .header("authorization", bearer(&create_test_jwt(1, &[])))
        .header("x-forwarded-for", "203.0.113.7")
        .body(Body::empty())
        .unwrap();
    let peer: SocketAddr = "10.1.2.3:40000".parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(peer));
    let response = send(&app, request).await;

    assert_eq!(response.status, StatusCode::OK);
}
