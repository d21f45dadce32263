//! Gateway error taxonomy and its HTTP rendering
//!
//! Every stage of the pipeline fails with a [`GatewayError`]. The variant
//! decides the canonical status code and the public `code`/`message` pair
//! written into the response envelope. Variant payloads carry internal
//! detail for the logs only and are never sent to the client.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::debug;

use crate::models::{ApiResponse, ErrorResponse};

/// Why a bearer credential was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// No `Authorization` header, or not the bearer scheme
    MissingToken,
    /// Signature checked out but `exp` is in the past
    Expired,
    /// Token header names an algorithm outside the HMAC family
    UnexpectedAlgorithm,
    /// Malformed token or bad signature
    Invalid(String),
    /// Claims cannot be carried as outbound header values
    UnrepresentableClaims,
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingToken => write!(f, "missing bearer token"),
            Self::Expired => write!(f, "token expired"),
            Self::UnexpectedAlgorithm => write!(f, "unexpected signing algorithm"),
            Self::Invalid(reason) => write!(f, "invalid token: {reason}"),
            Self::UnrepresentableClaims => write!(f, "claims not representable as headers"),
        }
    }
}

impl AuthFailure {
    /// Short label for metrics
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::Expired => "expired",
            Self::UnexpectedAlgorithm => "unexpected_algorithm",
            Self::Invalid(_) => "invalid",
            Self::UnrepresentableClaims => "unrepresentable_claims",
        }
    }
}

/// Errors produced while handling a gateway request
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(AuthFailure),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("rate limit exceeded for {key}")]
    RateLimitExceeded { key: String, retry_after_secs: u64 },

    #[error("no route for {method} {path}")]
    NotFound { method: String, path: String },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("upstream {upstream} unavailable: {reason}")]
    UpstreamUnavailable { upstream: String, reason: String },

    #[error("upstream {upstream} timed out: {reason}")]
    UpstreamTimeout { upstream: String, reason: String },

    #[error("api document from {upstream} unavailable: {reason}")]
    UpstreamDocUnavailable { upstream: String, reason: String },

    #[error("api document merge conflict on {kind} key {key}")]
    DocMergeConflict { kind: &'static str, key: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Canonical HTTP status for this error
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UpstreamUnavailable { .. } | Self::UpstreamDocUnavailable { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::DocMergeConflict { .. } | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Envelope error code
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::NotFound { .. } => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::UpstreamUnavailable { .. } => "service_unavailable",
            Self::UpstreamTimeout { .. } => "gateway_timeout",
            Self::UpstreamDocUnavailable { .. } => "upstream_doc_unavailable",
            Self::DocMergeConflict { .. } => "doc_merge_conflict",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Message shown to the client
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Unauthenticated(AuthFailure::MissingToken) => "Missing or invalid Bearer token",
            Self::Unauthenticated(AuthFailure::Expired) => "Token expired",
            Self::Unauthenticated(_) => "Invalid token",
            Self::Forbidden(_) => "forbidden",
            Self::RateLimitExceeded { .. } => "Too many requests",
            Self::NotFound { .. } => "Resource not found",
            Self::BadRequest(_) => "Malformed request",
            Self::PayloadTooLarge { .. } => "Request body too large",
            Self::UpstreamUnavailable { .. } | Self::UpstreamTimeout { .. } => "Service unavailable",
            Self::UpstreamDocUnavailable { .. } => "Failed to fetch upstream API documentation",
            Self::DocMergeConflict { .. } => "Conflicting upstream API documentation",
            Self::Internal(_) => "Internal server error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        // The access log line is written by the logging middleware
        debug!(code = self.code(), error = %self, "Rendering gateway error");

        let body = Json(ApiResponse::<()>::error(ErrorResponse::new(
            self.code(),
            self.public_message(),
        )));
        let mut response = (status, body).into_response();

        if let Self::RateLimitExceeded {
            retry_after_secs, ..
        } = self
        {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }

        response
    }
}
