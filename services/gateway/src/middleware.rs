//! Request pipeline middleware
//!
//! Applied outermost first: request id, access logging, CORS, body size,
//! token verification, rate limiting. Each stage either rejects with a
//! [`GatewayError`] or hands the request on unchanged apart from the
//! extensions and headers it documents.

use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, info, info_span, warn};

use crate::config::CorsConfig;
use crate::error::GatewayError;
use crate::metrics::get_metrics;
use crate::rate_limiter::RateLimiter;
use crate::routing::{RouteTable, ensure_canonical_path};
use crate::token::{TokenVerifier, strip_identity_headers};

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
pub const RATE_LIMIT_LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING_HEADER: HeaderName =
    HeaderName::from_static("x-ratelimit-remaining");

const MAX_REQUEST_ID_LEN: usize = 128;

/// Correlation identifier of the current request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

/// Client identity resolved by the rate limiting stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Key the rate limiter buckets on
    pub key: String,
}

fn generate_request_id() -> String {
    format!("req-{}", uuid::Uuid::new_v4().simple())
}

fn acceptable_request_id(value: &HeaderValue) -> Option<String> {
    let value = value.to_str().ok()?.trim();
    let acceptable = !value.is_empty()
        && value.len() <= MAX_REQUEST_ID_LEN
        && value.bytes().all(|b| b.is_ascii_graphic());
    acceptable.then(|| value.to_string())
}

/// Keep a well-formed client `X-Request-ID` or assign a fresh one, and echo
/// it on the response
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(acceptable_request_id)
        .unwrap_or_else(generate_request_id);

    let header_value = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = &header_value {
        request.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
    }
    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let span = info_span!("request", request_id = %request_id);
    let mut response = next.run(request).instrument(span).await;

    if let Some(value) = header_value {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Access log state
#[derive(Debug, Clone, Copy)]
pub struct LoggingState {
    pub trust_forward_header: bool,
}

fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
}

fn resolve_client(request: &Request, trust_forward_header: bool) -> ClientIdentity {
    request
        .extensions()
        .get::<ClientIdentity>()
        .cloned()
        .unwrap_or_else(|| {
            client_identity(request.headers(), peer_addr(request), trust_forward_header)
        })
}

/// One access log record per request
pub async fn logging_middleware(
    State(state): State<LoggingState>,
    mut request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let client = resolve_client(&request, state.trust_forward_header);
    let client_ip = client.key.clone();
    request.extensions_mut().insert(client);

    let metrics = get_metrics();
    metrics.request_started();
    let response = next.run(request).await;
    metrics.request_finished();

    let duration = start.elapsed();
    let status = response.status();
    metrics.record_request(method.as_str(), status.as_u16(), duration);

    info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = duration.as_millis(),
        request_id = %request_id,
        client_ip = %client_ip,
        "Request processed"
    );

    response
}

/// CORS middleware state
#[derive(Debug, Clone)]
pub struct CorsState {
    enabled: bool,
    any_origin: bool,
    origins: Arc<Vec<HeaderValue>>,
    allow_methods: HeaderValue,
    allow_headers: HeaderValue,
    max_age: HeaderValue,
}

impl CorsState {
    pub fn from_config(config: &CorsConfig) -> Result<Self> {
        let origins = config
            .allowed_origins
            .iter()
            .filter(|origin| origin.as_str() != "*")
            .map(|origin| {
                HeaderValue::from_str(origin).with_context(|| format!("invalid CORS origin {origin}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            enabled: config.enabled,
            any_origin: config.allowed_origins.iter().any(|origin| origin == "*"),
            origins: Arc::new(origins),
            allow_methods: HeaderValue::from_str(&config.allowed_methods.join(", "))
                .context("invalid CORS method list")?,
            allow_headers: HeaderValue::from_str(&config.allowed_headers.join(", "))
                .context("invalid CORS header list")?,
            max_age: HeaderValue::from(config.max_age_seconds),
        })
    }

    fn allow_origin(&self, request_origin: Option<&HeaderValue>) -> Option<HeaderValue> {
        if self.any_origin {
            return Some(HeaderValue::from_static("*"));
        }
        request_origin
            .filter(|origin| self.origins.contains(*origin))
            .cloned()
    }

    fn apply(&self, headers: &mut HeaderMap, origin: Option<HeaderValue>) {
        let Some(origin) = origin else {
            return;
        };
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        if !self.any_origin {
            headers.append(header::VARY, HeaderValue::from_static("origin"));
        }
        headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, self.allow_methods.clone());
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, self.allow_headers.clone());
        headers.insert(header::ACCESS_CONTROL_MAX_AGE, self.max_age.clone());
    }
}

/// Answer preflight `OPTIONS` requests with 204 before authentication and
/// rate limiting; decorate every other response with CORS headers
pub async fn cors_middleware(
    State(cors): State<CorsState>,
    request: Request,
    next: Next,
) -> Response {
    if !cors.enabled {
        return next.run(request).await;
    }

    let origin = cors.allow_origin(request.headers().get(header::ORIGIN));

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        cors.apply(response.headers_mut(), origin);
        return response;
    }

    let mut response = next.run(request).await;
    cors.apply(response.headers_mut(), origin);
    response
}

/// Largest request body the pipeline accepts, in bytes
#[derive(Debug, Clone, Copy)]
pub struct BodyLimit(pub usize);

/// Refuse requests whose declared `Content-Length` exceeds the limit.
/// Bodies without one are bounded while the forwarder reads them.
pub async fn body_limit_middleware(
    State(BodyLimit(limit)): State<BodyLimit>,
    request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let declared = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());

    if declared.is_some_and(|length| length > u64::try_from(limit).unwrap_or(u64::MAX)) {
        warn!(limit, declared, "Request body too large");
        return Err(GatewayError::PayloadTooLarge { limit });
    }
    Ok(next.run(request).await)
}

/// Authentication middleware state
#[derive(Clone)]
pub struct AuthState {
    pub verifier: Arc<TokenVerifier>,
    pub routes: Arc<RouteTable>,
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("verifier", &self.verifier)
            .field("routes", &self.routes.routes().len())
            .finish()
    }
}

/// Verify the bearer token on protected routes and inject identity headers.
///
/// Identity headers sent by the client are always removed, so a value that
/// reaches an upstream was set here from a verified token.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    strip_identity_headers(request.headers_mut());
    ensure_canonical_path(request.uri().path())?;

    if !auth.routes.requires_auth(request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let claims = auth.verifier.verify_header(authorization).inspect_err(|e| {
        warn!(path = %request.uri().path(), error = %e, "Token rejected");
        if let GatewayError::Unauthenticated(failure) = e {
            get_metrics().record_auth_failure(failure.label());
        }
    })?;

    claims.apply_to(request.headers_mut())?;
    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}

/// Rate limiting middleware state
#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub trust_forward_header: bool,
}

impl std::fmt::Debug for RateLimitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitState")
            .field("limiter", &self.limiter)
            .field("trust_forward_header", &self.trust_forward_header)
            .finish()
    }
}

/// Count the request against its client key
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    mut request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let client = resolve_client(&request, state.trust_forward_header);

    let decision = state.limiter.check(&client.key).await.inspect_err(|e| {
        if matches!(e, GatewayError::RateLimitExceeded { .. }) {
            warn!(client = %client.key, "Rate limit exceeded");
            get_metrics().record_rate_limited();
        }
    })?;

    request.extensions_mut().insert(client);
    let mut response = next.run(request).await;

    if let Some(decision) = decision {
        let headers = response.headers_mut();
        headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(decision.limit));
        headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(decision.remaining));
    }
    Ok(response)
}

/// Resolve the rate limit key: first `X-Forwarded-For` hop, then
/// `X-Real-IP` (when trusted), then the socket peer
#[must_use]
pub fn client_identity(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forward_header: bool,
) -> ClientIdentity {
    if trust_forward_header {
        if let Some(forwarded) = headers.get("x-forwarded-for")
            && let Ok(forwarded) = forwarded.to_str()
            && let Some(first) = forwarded.split(',').map(str::trim).find(|hop| !hop.is_empty())
        {
            return ClientIdentity {
                key: first.to_string(),
            };
        }

        if let Some(real_ip) = headers.get("x-real-ip")
            && let Ok(real_ip) = real_ip.to_str()
            && !real_ip.trim().is_empty()
        {
            return ClientIdentity {
                key: real_ip.trim().to_string(),
            };
        }
    }

    match peer {
        Some(addr) => ClientIdentity {
            key: addr.ip().to_string(),
        },
        None => ClientIdentity {
            key: "unknown".to_string(),
        },
    }
}
