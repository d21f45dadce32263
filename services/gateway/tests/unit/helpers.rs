//! Test helpers and utilities

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{HeaderMap, Request, StatusCode},
};
use jsonwebtoken::{EncodingKey, Header, encode};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tower::ServiceExt;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use wiremock::MockServer;

use edge_gateway::{
    GatewayConfig, GatewayServer,
    config::{ORDERS_UPSTREAM, USERS_UPSTREAM},
    rate_limiter::{RateDecision, RateLimitError, RateLimitStore},
};

pub const TEST_SECRET: &str = "test-secret-key";

/// Gateway configuration pointing at the given upstreams
pub fn create_test_config(users_url: &str, orders_url: &str) -> GatewayConfig {
    crate::init_test_env();

    let mut config = GatewayConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.upstream_timeout_seconds = 2;
    config.server.connect_timeout_seconds = 1;
    config.auth.jwt_secret = TEST_SECRET.to_string();
    config
        .upstreams
        .insert(USERS_UPSTREAM.to_string(), users_url.to_string());
    config
        .upstreams
        .insert(ORDERS_UPSTREAM.to_string(), orders_url.to_string());
    config
}

/// Users and orders mock servers
pub struct Upstreams {
    pub users: MockServer,
    pub orders: MockServer,
}

impl Upstreams {
    pub async fn start() -> Self {
        Self {
            users: MockServer::start().await,
            orders: MockServer::start().await,
        }
    }

    pub fn config(&self) -> GatewayConfig {
        create_test_config(&self.users.uri(), &self.orders.uri())
    }
}

/// URL of a local port nothing listens on
pub fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}")
}

pub fn build_app(config: GatewayConfig) -> Router {
    GatewayServer::new(config).router().unwrap()
}

pub fn sign(claims: &Value) -> String {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .unwrap()
}

/// Token for `id` with `roles`, valid for an hour
pub fn create_test_jwt(id: impl Into<Value>, roles: &[&str]) -> String {
    sign(&json!({
        "id": id.into(),
        "roles": roles,
        "exp": chrono::Utc::now().timestamp() + 3600,
    }))
}

pub fn create_expired_jwt() -> String {
    sign(&json!({
        "id": 1,
        "roles": ["manager"],
        "exp": chrono::Utc::now().timestamp() - 3600,
    }))
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

/// Collected response parts
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// `(code, message)` from an error envelope
    pub fn error(&self) -> (String, String) {
        let body = self.json();
        assert_eq!(body["success"], false, "not an error envelope: {body}");
        (
            body["error"]["code"].as_str().unwrap().to_string(),
            body["error"]["message"].as_str().unwrap().to_string(),
        )
    }
}

pub async fn send(app: &Router, request: Request<Body>) -> TestResponse {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    TestResponse {
        status,
        headers,
        body: body.to_vec(),
    }
}

pub fn get(uri: &str) -> axum::http::request::Builder {
    Request::builder().method("GET").uri(uri)
}

/// Store that always fails
#[derive(Debug, Default)]
pub struct FailingStore {
    pub calls: AtomicUsize,
}

#[async_trait]
impl RateLimitStore for FailingStore {
    async fn check(&self, _key: &str) -> Result<RateDecision, RateLimitError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RateLimitError::Unavailable("backend offline".to_string()))
    }

    async fn purge_expired(&self) -> usize {
        0
    }

    fn tracked_keys(&self) -> usize {
        0
    }
}

pub fn failing_store() -> Arc<FailingStore> {
    Arc::new(FailingStore::default())
}

/// Access log records captured from the `logging_middleware`
#[derive(Debug, Clone, Default)]
pub struct AccessLog {
    statuses: Arc<Mutex<Vec<u64>>>,
}

impl AccessLog {
    /// Capture access records emitted on the current thread until the guard
    /// is dropped
    pub fn capture() -> (Self, tracing::subscriber::DefaultGuard) {
        let log = Self::default();
        let subscriber = tracing_subscriber::registry().with(log.clone());
        (log, tracing::subscriber::set_default(subscriber))
    }

    /// Status of every `Request processed` record, in order
    pub fn statuses(&self) -> Vec<u64> {
        self.statuses.lock().clone()
    }
}

#[derive(Default)]
struct AccessRecord {
    message: Option<String>,
    status: Option<u64>,
}

impl Visit for AccessRecord {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "status" {
            self.status = Some(value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for AccessLog {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut record = AccessRecord::default();
        event.record(&mut record);
        if let (Some("Request processed"), Some(status)) =
            (record.message.as_deref(), record.status)
        {
            self.statuses.lock().push(status);
        }
    }
}
