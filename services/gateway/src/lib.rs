//! Edge gateway
//!
//! Single entry point in front of the identity and order services.
//! Features:
//! - Longest-prefix routing to upstream services
//! - HMAC JWT verification with identity header propagation
//! - Per-client rate limiting
//! - CORS preflight handling and request correlation ids
//! - Aggregated OpenAPI documentation

#![allow(missing_docs)]

use anyhow::Result;

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod openapi;
pub mod proxy;
pub mod rate_limiter;
pub mod routing;
pub mod server;
pub mod token;

pub use config::{
    AuthConfig, CorsConfig, DocsConfig, GatewayConfig, MergePolicy, RateLimitConfig,
    RateLimitStrategy, RouteAccess, RouteConfig, ServerConfig,
};
pub use error::{AuthFailure, GatewayError};
pub use server::GatewayServer;

/// Start the edge gateway server
pub async fn start_server(config: GatewayConfig) -> Result<()> {
    #[cfg(feature = "monitoring")]
    let metrics_handle = if config.monitoring.metrics_enabled {
        Some(metrics::install_recorder()?)
    } else {
        None
    };

    let server = GatewayServer::new(config);

    #[cfg(feature = "monitoring")]
    let server = match metrics_handle {
        Some(handle) => server.with_metrics(handle),
        None => server,
    };

    server.start().await
}
