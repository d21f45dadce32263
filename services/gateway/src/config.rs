//! Configuration for the edge gateway

use anyhow::{Context, Result, bail};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Upstream name used for the identity service
pub const USERS_UPSTREAM: &str = "users";
/// Upstream name used for the order service
pub const ORDERS_UPSTREAM: &str = "orders";

/// Edge gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Upstream base URLs keyed by logical name
    pub upstreams: FxHashMap<String, String>,
    /// Static prefix table used by the router
    pub routes: Vec<RouteConfig>,
    /// Token verification configuration
    pub auth: AuthConfig,
    /// Rate limiting configuration
    pub rate_limiting: RateLimitConfig,
    /// CORS configuration
    pub cors: CorsConfig,
    /// Aggregated API documentation
    pub docs: DocsConfig,
    /// Monitoring configuration
    pub monitoring: MonitoringConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    /// Upper bound for a whole upstream exchange
    pub upstream_timeout_seconds: u64,
    /// Upper bound for establishing an upstream connection
    pub connect_timeout_seconds: u64,
}

/// Whether a route requires a verified bearer token
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteAccess {
    Public,
    #[default]
    Protected,
}

/// One entry of the prefix table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Path prefix, matched on segment boundaries
    pub prefix: String,
    /// Match `prefix` as a whole path only, never its sub-paths
    #[serde(default)]
    pub exact: bool,
    /// Name of the upstream in [`GatewayConfig::upstreams`]
    pub upstream: String,
    #[serde(default)]
    pub access: RouteAccess,
    /// Allowed methods; empty means any
    #[serde(default)]
    pub methods: Vec<String>,
    /// Roles of which the caller must hold at least one; empty means no check
    #[serde(default)]
    pub required_roles: Vec<String>,
}

impl RouteConfig {
    fn new(prefix: &str, upstream: &str, access: RouteAccess, methods: &[&str]) -> Self {
        Self {
            prefix: prefix.to_string(),
            exact: false,
            upstream: upstream.to_string(),
            access,
            methods: methods.iter().map(ToString::to_string).collect(),
            required_roles: Vec::new(),
        }
    }
}

/// Token verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared HMAC secret used by the identity service to sign tokens
    pub jwt_secret: String,
    /// Accepted token algorithms (HMAC family only)
    pub allowed_algorithms: Vec<String>,
    /// Clock skew tolerated when checking `exp`
    pub leeway_seconds: u64,
    /// Roles that satisfy any route role requirement
    pub admin_roles: Vec<String>,
}

/// Bucket store used by the rate limiter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    /// Counter reset at the end of each window
    #[default]
    FixedWindow,
    /// GCRA token bucket, quota spread evenly over the window
    TokenBucket,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    pub strategy: RateLimitStrategy,
    /// Requests allowed per client key per window
    pub requests_per_window: u32,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Take the client key from `X-Forwarded-For` / `X-Real-IP` when present
    pub trust_forward_header: bool,
    /// How often expired buckets are swept
    pub cleanup_interval_seconds: u64,
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Enable CORS
    pub enabled: bool,
    /// Allowed origins
    pub allowed_origins: Vec<String>,
    /// Allowed methods
    pub allowed_methods: Vec<String>,
    /// Allowed headers
    pub allowed_headers: Vec<String>,
    /// Max age for preflight requests
    pub max_age_seconds: u64,
}

/// Collision policy when two upstream documents define the same key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Later source overwrites earlier
    #[default]
    LastWins,
    /// Earlier source is kept
    FirstWins,
    /// Any collision fails the aggregation
    Reject,
}

/// Aggregated API documentation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DocsConfig {
    pub title: String,
    pub version: String,
    /// Server URL advertised in the merged document
    pub server_url: String,
    /// Path of each upstream's own document, relative to its base URL
    pub upstream_doc_path: String,
    /// Upstreams to merge, in merge order
    pub sources: Vec<String>,
    pub merge_policy: MergePolicy,
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Enable Prometheus metrics
    pub metrics_enabled: bool,
    /// Metrics endpoint path
    pub metrics_path: String,
    /// Health check endpoint path
    pub health_path: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let mut upstreams = FxHashMap::default();
        upstreams.insert(
            USERS_UPSTREAM.to_string(),
            "http://service-users:8082".to_string(),
        );
        upstreams.insert(
            ORDERS_UPSTREAM.to_string(),
            "http://service-orders:8081".to_string(),
        );

        Self {
            server: ServerConfig::default(),
            upstreams,
            routes: vec![
                RouteConfig {
                    exact: true,
                    ..RouteConfig::new(
                        "/api/v1/auth/login",
                        USERS_UPSTREAM,
                        RouteAccess::Public,
                        &["POST"],
                    )
                },
                RouteConfig::new("/api/v1/admin", USERS_UPSTREAM, RouteAccess::Protected, &[]),
                RouteConfig::new("/api/v1/orders", ORDERS_UPSTREAM, RouteAccess::Protected, &[]),
            ],
            auth: AuthConfig::default(),
            rate_limiting: RateLimitConfig::default(),
            cors: CorsConfig::default(),
            docs: DocsConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_body_size: 1024 * 1024, // 1MB
            upstream_timeout_seconds: 30,
            connect_timeout_seconds: 5,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "your-default-secret".to_string(),
            allowed_algorithms: vec![
                "HS256".to_string(),
                "HS384".to_string(),
                "HS512".to_string(),
            ],
            leeway_seconds: 0,
            admin_roles: vec!["admin".to_string(), "superadmin".to_string()],
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: RateLimitStrategy::FixedWindow,
            requests_per_window: 100,
            window_seconds: 60,
            trust_forward_header: true,
            cleanup_interval_seconds: 60,
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: vec!["*".to_string()],
            allowed_methods: vec![
                "GET".to_string(),
                "POST".to_string(),
                "PUT".to_string(),
                "DELETE".to_string(),
            ],
            allowed_headers: vec![
                "Authorization".to_string(),
                "Content-Type".to_string(),
                "X-Request-ID".to_string(),
            ],
            max_age_seconds: 86400, // 24 hours
        }
    }
}

impl Default for DocsConfig {
    fn default() -> Self {
        Self {
            title: "Control System API".to_string(),
            version: "1.0".to_string(),
            server_url: "/api/v1".to_string(),
            upstream_doc_path: "/swagger/doc.json".to_string(),
            sources: vec![USERS_UPSTREAM.to_string(), ORDERS_UPSTREAM.to_string()],
            merge_policy: MergePolicy::LastWins,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_path: "/metrics".to_string(),
            health_path: "/health".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from an optional file layered under `GATEWAY__*`
    /// environment variables, then apply the flat legacy variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to assemble configuration sources")?;

        let mut config: Self = settings
            .try_deserialize()
            .context("failed to deserialize gateway configuration")?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `GATEWAY_PORT`, `USERS_SERVICE_URL`, `ORDERS_SERVICE_URL` and
    /// `TOKEN_SECRET`, which older deployments set instead of nested keys.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(port) = non_empty("GATEWAY_PORT").and_then(|p| p.trim().parse().ok()) {
            self.server.port = port;
        }
        if let Some(url) = non_empty("USERS_SERVICE_URL") {
            self.upstreams.insert(USERS_UPSTREAM.to_string(), url);
        }
        if let Some(url) = non_empty("ORDERS_SERVICE_URL") {
            self.upstreams.insert(ORDERS_UPSTREAM.to_string(), url);
        }
        if let Some(secret) = non_empty("TOKEN_SECRET") {
            self.auth.jwt_secret = secret;
        }
    }

    /// Reject configurations the gateway cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.is_empty() {
            bail!("auth.jwt_secret must not be empty");
        }
        if self.auth.allowed_algorithms.is_empty() {
            bail!("auth.allowed_algorithms must list at least one algorithm");
        }
        for name in &self.auth.allowed_algorithms {
            let algorithm = jsonwebtoken::Algorithm::from_str(name)
                .with_context(|| format!("unknown token algorithm {name}"))?;
            if !matches!(
                algorithm,
                jsonwebtoken::Algorithm::HS256
                    | jsonwebtoken::Algorithm::HS384
                    | jsonwebtoken::Algorithm::HS512
            ) {
                bail!("token algorithm {name} is not in the HMAC family");
            }
        }

        for (name, url) in &self.upstreams {
            let parsed = reqwest::Url::parse(url)
                .with_context(|| format!("upstream {name} has an invalid url {url}"))?;
            if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
                bail!("upstream {name} must be an absolute http(s) url, got {url}");
            }
        }

        let mut prefixes = FxHashSet::default();
        for route in &self.routes {
            if !route.prefix.starts_with('/') {
                bail!("route prefix {} must start with '/'", route.prefix);
            }
            if !prefixes.insert(route.prefix.trim_end_matches('/')) {
                bail!("duplicate route prefix {}", route.prefix);
            }
            if !self.upstreams.contains_key(&route.upstream) {
                bail!(
                    "route {} references unknown upstream {}",
                    route.prefix,
                    route.upstream
                );
            }
            for method in &route.methods {
                axum::http::Method::from_str(method)
                    .with_context(|| format!("route {} lists invalid method {method}", route.prefix))?;
            }
        }

        for source in &self.docs.sources {
            if !self.upstreams.contains_key(source) {
                bail!("docs source {source} is not a configured upstream");
            }
        }

        if self.rate_limiting.requests_per_window == 0 {
            bail!("rate_limiting.requests_per_window must be greater than zero");
        }
        if self.rate_limiting.window_seconds == 0 {
            bail!("rate_limiting.window_seconds must be greater than zero");
        }
        if self.server.upstream_timeout_seconds == 0 {
            bail!("server.upstream_timeout_seconds must be greater than zero");
        }
        if self.server.connect_timeout_seconds == 0 {
            bail!("server.connect_timeout_seconds must be greater than zero");
        }

        Ok(())
    }

    /// Get server address
    #[must_use]
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    #[must_use]
    pub const fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.server.upstream_timeout_seconds)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.server.connect_timeout_seconds)
    }
}

impl RateLimitConfig {
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}
