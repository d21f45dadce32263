//! Reverse proxy forwarding to upstream services
//!
//! The inbound path is appended to the upstream base URL unchanged, the
//! `Host` header is rewritten to the upstream authority and hop-by-hop
//! headers are dropped in both directions. Request bodies are buffered up to
//! the configured limit; upstream responses are streamed back without
//! buffering. Every exchange is bounded by the client timeout;
//! dropping the returned future aborts the upstream call.

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, HeaderName, HeaderValue, header},
    response::Response,
};
use futures_util::StreamExt;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::GatewayError;
use crate::routing::UpstreamTarget;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// HTTP client shared by every forwarded request
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    max_body_size: usize,
}

impl Forwarder {
    pub fn new(timeout: Duration, connect_timeout: Duration, max_body_size: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build upstream http client")?;

        Ok(Self {
            client,
            max_body_size,
        })
    }

    /// Underlying client, shared with the document aggregator
    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Send `request` to `target` and stream the upstream response back.
    ///
    /// `peer_ip` is the socket peer of the inbound connection; it is appended
    /// to `X-Forwarded-For` as the hop this gateway saw.
    pub async fn forward(
        &self,
        target: &UpstreamTarget,
        request: Request,
        peer_ip: Option<IpAddr>,
    ) -> Result<Response, GatewayError> {
        let (parts, body) = request.into_parts();
        let url = target.url_for(parts.uri.path(), parts.uri.query());

        let mut headers = parts.headers;
        let original_host = headers.remove(header::HOST);
        strip_hop_by_hop(&mut headers);
        headers.remove(header::CONTENT_LENGTH);
        headers.insert(header::HOST, target.host_header()?);
        append_forwarded_for(&mut headers, peer_ip);
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST, host);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

        let body = read_body(body, self.max_body_size).await?;

        debug!(upstream = %target.name, method = %parts.method, %url, "Forwarding request");

        let upstream = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                error!(upstream = %target.name, %url, error = %e, "Upstream request failed");
                if e.is_timeout() {
                    GatewayError::UpstreamTimeout {
                        upstream: target.name.clone(),
                        reason: e.to_string(),
                    }
                } else {
                    GatewayError::UpstreamUnavailable {
                        upstream: target.name.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

/// Buffer a request body, refusing it once it grows past `limit` bytes
pub async fn read_body(body: Body, limit: usize) -> Result<Vec<u8>, GatewayError> {
    let mut stream = body.into_data_stream();
    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|e| GatewayError::BadRequest(format!("failed to read request body: {e}")))?;
        if buffer.len() + chunk.len() > limit {
            return Err(GatewayError::PayloadTooLarge { limit });
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}

fn append_forwarded_for(headers: &mut HeaderMap, peer_ip: Option<IpAddr>) {
    let Some(ip) = peer_ip else {
        return;
    };
    let chain = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{existing}, {ip}"),
        _ => ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
