//! Static prefix table mapping inbound paths to upstream targets
//!
//! The table is built once from configuration. Lookups pick the longest
//! prefix that matches on a path-segment boundary, so `/api/v1/orders`
//! covers `/api/v1/orders` and `/api/v1/orders/42` but not `/api/v1/ordersX`.
//! Exact routes match their own path only.
//!
//! Paths with dot segments are refused before any lookup: the upstream URL
//! parser would collapse them after routing, so the path that was matched
//! would not be the path that gets forwarded.

use anyhow::{Context, Result};
use axum::http::{HeaderValue, Method};
use std::str::FromStr;
use std::sync::Arc;

use crate::config::{GatewayConfig, RouteAccess};
use crate::error::GatewayError;

/// Immutable description of one upstream service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    /// Logical name, e.g. `orders`
    pub name: String,
    /// `scheme://authority[/base]` without a trailing slash
    pub base_url: String,
    pub scheme: String,
    /// `host[:port]`, used as the outbound `Host` header
    pub host: String,
    /// Path component of the base URL, empty when the URL has none
    pub base_path: String,
}

impl UpstreamTarget {
    /// Parse an absolute http(s) URL into a target
    pub fn parse(name: &str, url: &str) -> Result<Self> {
        let parsed =
            reqwest::Url::parse(url).with_context(|| format!("invalid upstream url {url}"))?;
        let host_name = parsed
            .host_str()
            .with_context(|| format!("upstream url {url} has no host"))?;
        let host = match parsed.port() {
            Some(port) => format!("{host_name}:{port}"),
            None => host_name.to_string(),
        };
        let base_path = parsed.path().trim_end_matches('/').to_string();
        let scheme = parsed.scheme().to_string();

        Ok(Self {
            name: name.to_string(),
            base_url: format!("{scheme}://{host}{base_path}"),
            scheme,
            host,
            base_path,
        })
    }

    /// Outbound URL for an inbound path and query: `target.path + original.path`
    #[must_use]
    pub fn url_for(&self, path: &str, query: Option<&str>) -> String {
        match query {
            Some(query) if !query.is_empty() => format!("{}{path}?{query}", self.base_url),
            _ => format!("{}{path}", self.base_url),
        }
    }

    /// `Host` header value for outbound requests
    pub fn host_header(&self) -> Result<HeaderValue, GatewayError> {
        HeaderValue::from_str(&self.host).map_err(|e| {
            GatewayError::Internal(format!("upstream {} host is not a header value: {e}", self.name))
        })
    }
}

/// A resolved entry of the prefix table
#[derive(Debug, Clone)]
pub struct Route {
    pub prefix: String,
    pub exact: bool,
    pub target: Arc<UpstreamTarget>,
    pub access: RouteAccess,
    /// Empty means every method is accepted
    pub methods: Vec<Method>,
    pub required_roles: Vec<String>,
}

impl Route {
    fn matches(&self, path: &str) -> bool {
        if self.exact {
            path == self.prefix
        } else {
            prefix_matches(&self.prefix, path)
        }
    }

    fn allows(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }
}

/// Refuse paths an upstream would not see verbatim: `.` or `..` segments,
/// literal or percent-encoded, and backslashes, which URL parsers treat as
/// separators
pub fn ensure_canonical_path(path: &str) -> Result<(), GatewayError> {
    let dot_segment = path.split('/').any(|segment| {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        decoded == "." || decoded == ".."
    });
    let backslash = path.contains('\\') || path.to_ascii_lowercase().contains("%5c");

    if dot_segment || backslash {
        return Err(GatewayError::BadRequest(format!(
            "path {path} is not in canonical form"
        )));
    }
    Ok(())
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

/// Longest-match prefix table
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Build the table from configuration; targets are shared between routes
    /// pointing at the same upstream.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let mut routes = Vec::with_capacity(config.routes.len());
        for entry in &config.routes {
            let url = config.upstreams.get(&entry.upstream).with_context(|| {
                format!(
                    "route {} references unknown upstream {}",
                    entry.prefix, entry.upstream
                )
            })?;
            let target = routes
                .iter()
                .map(|route: &Route| &route.target)
                .find(|target| target.name == entry.upstream)
                .map_or_else(
                    || UpstreamTarget::parse(&entry.upstream, url).map(Arc::new),
                    |target| Ok(Arc::clone(target)),
                )?;
            let methods = entry
                .methods
                .iter()
                .map(|method| Method::from_str(&method.to_ascii_uppercase()))
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("route {} lists an invalid method", entry.prefix))?;

            routes.push(Route {
                prefix: normalize_prefix(&entry.prefix),
                exact: entry.exact,
                target,
                access: entry.access,
                methods,
                required_roles: entry.required_roles.clone(),
            });
        }

        Ok(Self::new(routes))
    }

    #[must_use]
    pub fn new(mut routes: Vec<Route>) -> Self {
        // Longest prefix first so the first hit is the most specific one
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { routes }
    }

    /// Most specific route covering `path`, regardless of method
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.matches(path))
    }

    /// Route for `method` + `path`, or `NotFound`
    pub fn resolve(&self, method: &Method, path: &str) -> Result<&Route, GatewayError> {
        ensure_canonical_path(path)?;
        self.lookup(path)
            .filter(|route| route.allows(method))
            .ok_or_else(|| GatewayError::NotFound {
                method: method.to_string(),
                path: path.to_string(),
            })
    }

    /// Whether a request to `path` must carry a valid token. Paths outside
    /// the table are treated as protected.
    #[must_use]
    pub fn requires_auth(&self, path: &str) -> bool {
        self.lookup(path)
            .is_none_or(|route| route.access == RouteAccess::Protected)
    }

    #[must_use]
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}
