//! Health check and monitoring handlers

use axum::{extract::State, response::Json};
use std::time::Instant;
use tracing::debug;

use crate::models::{ApiResponse, HealthCheckResponse};

/// Health check handlers
#[derive(Debug, Clone)]
pub struct HealthHandlers {
    start_time: Instant,
}

impl HealthHandlers {
    #[must_use]
    pub const fn new(start_time: Instant) -> Self {
        Self { start_time }
    }

    /// Liveness only; upstreams are not probed
    pub async fn health_check(
        State(handlers): State<Self>,
    ) -> Json<ApiResponse<HealthCheckResponse>> {
        debug!("Health check request");
        crate::metrics::get_metrics().update_system_metrics();

        Json(ApiResponse::success(HealthCheckResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: handlers.start_time.elapsed().as_secs(),
        }))
    }

    /// Prometheus text exposition
    #[cfg(feature = "monitoring")]
    pub async fn metrics(
        State(handle): State<metrics_exporter_prometheus::PrometheusHandle>,
    ) -> String {
        crate::metrics::get_metrics().update_system_metrics();
        handle.render()
    }
}
