//! Gateway metrics
//!
//! Recorded through the `metrics` facade. Without an installed recorder the
//! calls are no-ops; with the `monitoring` feature a Prometheus recorder is
//! installed at startup and rendered on the metrics endpoint.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Gateway metrics collector
#[derive(Debug)]
pub struct GatewayMetrics {
    start_time: u64,
    in_flight: AtomicU64,
}

impl GatewayMetrics {
    /// Create new metrics instance
    #[must_use]
    pub fn new() -> Self {
        Self::register_metrics();

        Self {
            start_time: u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default(),
            in_flight: AtomicU64::new(0),
        }
    }

    fn register_metrics() {
        describe_counter!(
            "edge_gateway_http_requests_total",
            "Total number of HTTP requests by method and status"
        );
        describe_histogram!(
            "edge_gateway_http_request_duration_seconds",
            "HTTP request duration in seconds"
        );
        describe_gauge!(
            "edge_gateway_requests_in_flight",
            "Requests currently being handled"
        );
        describe_counter!(
            "edge_gateway_auth_failures_total",
            "Requests rejected by token verification"
        );
        describe_counter!(
            "edge_gateway_rate_limit_exceeded_total",
            "Requests rejected by the rate limiter"
        );
        describe_counter!(
            "edge_gateway_upstream_failures_total",
            "Forwarded requests that failed before an upstream response"
        );
        describe_counter!(
            "edge_gateway_doc_aggregations_total",
            "API document aggregation attempts"
        );
        describe_gauge!("edge_gateway_uptime_seconds", "Gateway uptime in seconds");
    }

    /// Record one completed request
    pub fn record_request(&self, method: &str, status: u16, duration: Duration) {
        counter!("edge_gateway_http_requests_total",
            "method" => method.to_string(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!("edge_gateway_http_request_duration_seconds",
            "method" => method.to_string()
        )
        .record(duration.as_secs_f64());
    }

    pub fn request_started(&self) {
        let active = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        #[allow(clippy::cast_precision_loss)]
        gauge!("edge_gateway_requests_in_flight").set(active as f64);
    }

    pub fn request_finished(&self) {
        let previous = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)))
            .unwrap_or_default();
        #[allow(clippy::cast_precision_loss)]
        gauge!("edge_gateway_requests_in_flight").set(previous.saturating_sub(1) as f64);
    }

    pub fn record_auth_failure(&self, reason: &'static str) {
        counter!("edge_gateway_auth_failures_total", "reason" => reason).increment(1);
    }

    pub fn record_rate_limited(&self) {
        counter!("edge_gateway_rate_limit_exceeded_total").increment(1);
    }

    pub fn record_upstream_failure(&self, upstream: &str, code: &'static str) {
        counter!("edge_gateway_upstream_failures_total",
            "upstream" => upstream.to_string(),
            "code" => code
        )
        .increment(1);
    }

    pub fn record_doc_aggregation(&self, success: bool) {
        counter!("edge_gateway_doc_aggregations_total",
            "result" => if success { "success" } else { "failure" }
        )
        .increment(1);
    }

    /// Refresh gauges that are derived rather than event-driven
    pub fn update_system_metrics(&self) {
        let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
        #[allow(clippy::cast_precision_loss)]
        gauge!("edge_gateway_uptime_seconds").set(now.saturating_sub(self.start_time) as f64);
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<GatewayMetrics> = OnceLock::new();

/// Get global metrics instance
pub fn get_metrics() -> &'static GatewayMetrics {
    METRICS.get_or_init(GatewayMetrics::new)
}

/// Install the process-wide Prometheus recorder
#[cfg(feature = "monitoring")]
pub fn install_recorder() -> anyhow::Result<metrics_exporter_prometheus::PrometheusHandle> {
    use anyhow::Context;

    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install prometheus recorder")?;
    // Descriptions are only kept by a recorder that exists when they are registered
    GatewayMetrics::register_metrics();
    get_metrics();
    Ok(handle)
}
