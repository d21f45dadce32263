//! Edge gateway server implementation

use anyhow::{Context, Result};
use axum::{Router, middleware, routing::get};
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    config::GatewayConfig,
    handlers::{DocsHandlers, HealthHandlers, ProxyHandlers},
    middleware::{
        AuthState, BodyLimit, CorsState, LoggingState, RateLimitState, auth_middleware,
        body_limit_middleware, cors_middleware, logging_middleware, rate_limit_middleware,
        request_id_middleware,
    },
    openapi::DocAggregator,
    proxy::Forwarder,
    rate_limiter::{RateLimitStore, RateLimiter},
    routing::RouteTable,
    token::TokenVerifier,
};

/// Edge gateway server
pub struct GatewayServer {
    config: GatewayConfig,
    rate_limit_store: Option<Arc<dyn RateLimitStore>>,
    #[cfg(feature = "monitoring")]
    metrics_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
    start_time: Instant,
}

impl std::fmt::Debug for GatewayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayServer")
            .field("address", &self.config.server_address())
            .field("custom_rate_limit_store", &self.rate_limit_store.is_some())
            .finish_non_exhaustive()
    }
}

/// Everything built from configuration for one server instance
struct Components {
    app: Router,
    rate_limiter: Arc<RateLimiter>,
}

impl GatewayServer {
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            rate_limit_store: None,
            #[cfg(feature = "monitoring")]
            metrics_handle: None,
            start_time: Instant::now(),
        }
    }

    /// Use `store` for rate limit buckets instead of the configured strategy
    #[must_use]
    pub fn with_rate_limit_store(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.rate_limit_store = Some(store);
        self
    }

    /// Serve `handle` on the metrics endpoint
    #[cfg(feature = "monitoring")]
    #[must_use]
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Build the application router without binding a listener
    pub fn router(&self) -> Result<Router> {
        Ok(self.build()?.app)
    }

    fn build(&self) -> Result<Components> {
        let config = &self.config;
        config.validate()?;

        let routes = Arc::new(RouteTable::from_config(config)?);
        let verifier = Arc::new(TokenVerifier::new(&config.auth)?);
        let forwarder = Forwarder::new(
            config.upstream_timeout(),
            config.connect_timeout(),
            config.server.max_body_size,
        )?;
        let rate_limiter = Arc::new(match &self.rate_limit_store {
            Some(store) => RateLimiter::with_store(Arc::clone(store), config.rate_limiting.enabled),
            None => RateLimiter::new(&config.rate_limiting)?,
        });
        let aggregator = Arc::new(DocAggregator::from_config(
            config,
            forwarder.client().clone(),
        )?);

        let proxy = ProxyHandlers {
            routes: Arc::clone(&routes),
            forwarder,
            admin_roles: Arc::new(config.auth.admin_roles.clone()),
        };
        let auth_state = AuthState { verifier, routes };
        let rate_limit_state = RateLimitState {
            limiter: Arc::clone(&rate_limiter),
            trust_forward_header: config.rate_limiting.trust_forward_header,
        };
        let cors_state = CorsState::from_config(&config.cors)?;

        // Layers wrap outward: the last one added runs first
        let pipeline = Router::new()
            .fallback(ProxyHandlers::forward)
            .with_state(proxy)
            .layer(middleware::from_fn_with_state(
                rate_limit_state,
                rate_limit_middleware,
            ))
            .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
            .layer(middleware::from_fn_with_state(
                BodyLimit(config.server.max_body_size),
                body_limit_middleware,
            ))
            .layer(middleware::from_fn_with_state(cors_state, cors_middleware))
            .layer(middleware::from_fn_with_state(
                LoggingState {
                    trust_forward_header: config.rate_limiting.trust_forward_header,
                },
                logging_middleware,
            ))
            .layer(middleware::from_fn(request_id_middleware));

        let health = Router::new()
            .route(
                &config.monitoring.health_path,
                get(HealthHandlers::health_check),
            )
            .with_state(HealthHandlers::new(self.start_time));

        let docs = Router::new()
            .route("/docs", get(DocsHandlers::ui))
            .route("/docs/*rest", get(DocsHandlers::asset))
            .with_state(DocsHandlers::new(aggregator));

        let app = Router::new().merge(health).merge(docs);

        #[cfg(feature = "monitoring")]
        let app = match (&self.metrics_handle, config.monitoring.metrics_enabled) {
            (Some(handle), true) => app.merge(
                Router::new()
                    .route(
                        &config.monitoring.metrics_path,
                        get(HealthHandlers::metrics),
                    )
                    .with_state(handle.clone()),
            ),
            _ => app,
        };

        let app = app
            .fallback_service(pipeline)
            .layer(TraceLayer::new_for_http());

        Ok(Components { app, rate_limiter })
    }

    /// Bind, serve until Ctrl-C or SIGTERM, then drain
    pub async fn start(self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .server_address()
            .parse()
            .with_context(|| format!("invalid server address {}", self.config.server_address()))?;

        let Components { app, rate_limiter } = self.build()?;
        let cleanup = rate_limiter.spawn_cleanup(std::time::Duration::from_secs(
            self.config.rate_limiting.cleanup_interval_seconds.max(1),
        ));

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind to address {addr}"))?;
        info!("Edge gateway listening on {}", addr);

        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;
        cleanup.abort();

        if let Err(e) = served {
            error!("Server encountered a fatal error: {}", e);
            return Err(anyhow::anyhow!("Server error: {e}"));
        }

        info!("Edge gateway stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received, draining connections");
}

/// Print the route table for `config`
pub fn print_routes(config: &GatewayConfig) {
    println!("Edge Gateway Routes:");
    println!("====================");
    println!();
    println!("Gateway endpoints (outside the pipeline):");
    println!("  GET  {:<28} - Health check", config.monitoring.health_path);
    if config.monitoring.metrics_enabled {
        println!("  GET  {:<28} - Prometheus metrics", config.monitoring.metrics_path);
    }
    println!("  GET  {:<28} - Aggregated API document", "/docs/doc.json");
    println!("  GET  {:<28} - API documentation UI", "/docs");
    println!();
    println!("Proxied prefixes (longest match wins):");
    for route in &config.routes {
        let methods = if route.methods.is_empty() {
            "ANY".to_string()
        } else {
            route.methods.join(",")
        };
        let upstream = config
            .upstreams
            .get(&route.upstream)
            .map_or("<unknown>", String::as_str);
        println!(
            "  {:<8} {:<28} -> {} ({}, {:?})",
            methods, route.prefix, route.upstream, upstream, route.access
        );
    }
    println!();
    println!("All proxied requests pass through:");
    println!("- Request ID assignment");
    println!("- CORS preflight handling");
    println!("- Request body size limit");
    println!("- JWT verification (protected prefixes)");
    println!("- Rate limiting");
}
