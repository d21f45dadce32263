//! Terminal pipeline stage: route, role check, forward

use axum::{
    extract::{ConnectInfo, Request, State},
    response::Response,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use crate::error::GatewayError;
use crate::metrics::get_metrics;
use crate::proxy::Forwarder;
use crate::routing::RouteTable;
use crate::token::Claims;

/// Proxy handler state
#[derive(Debug, Clone)]
pub struct ProxyHandlers {
    pub routes: Arc<RouteTable>,
    pub forwarder: Forwarder,
    pub admin_roles: Arc<Vec<String>>,
}

impl ProxyHandlers {
    /// Match the request against the prefix table and forward it
    pub async fn forward(
        State(handlers): State<Self>,
        request: Request,
    ) -> Result<Response, GatewayError> {
        let route = handlers
            .routes
            .resolve(request.method(), request.uri().path())?;

        if !route.required_roles.is_empty() {
            let permitted = request
                .extensions()
                .get::<Claims>()
                .is_some_and(|claims| claims.has_any_role(&route.required_roles, &handlers.admin_roles));
            if !permitted {
                return Err(GatewayError::Forbidden(format!(
                    "route {} requires one of {:?}",
                    route.prefix, route.required_roles
                )));
            }
        }

        let peer_ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip());
        debug!(prefix = %route.prefix, upstream = %route.target.name, "Route matched");

        handlers
            .forwarder
            .forward(&route.target, request, peer_ip)
            .await
            .inspect_err(|e| {
                if matches!(
                    e,
                    GatewayError::UpstreamUnavailable { .. } | GatewayError::UpstreamTimeout { .. }
                ) {
                    get_metrics().record_upstream_failure(&route.target.name, e.code());
                }
            })
    }
}
