use async_trait::async_trait;
use axum::{
    body::Body,
    response::Response,
};
use http::header::HeaderName;
use std::time::Duration;

use crate::{
    config::UpstreamConfig,
    context::RequestContext,
    error::{ServiceError, ServiceResult},
};

/// Where requests go once every middleware has let them through.
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn dispatch(&self, ctx: &RequestContext) -> ServiceResult<Response<Body>>;
}

/// Forwards requests to the church-management API.
pub struct UpstreamForwarder {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl UpstreamForwarder {
    pub fn new(cfg: &UpstreamConfig) -> ServiceResult<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| ServiceError::Internal(e.to_string()))?;

        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            timeout: cfg.timeout,
        })
    }

    fn target_url(&self, ctx: &RequestContext) -> String {
        let path_and_query = ctx
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or(ctx.uri.path());
        format!("{}{}", self.base_url, path_and_query)
    }
}

#[async_trait]
impl Downstream for UpstreamForwarder {
    async fn dispatch(&self, ctx: &RequestContext) -> ServiceResult<Response<Body>> {
        let mut request = self
            .client
            .request(ctx.method.clone(), self.target_url(ctx))
            .timeout(self.timeout)
            .body(ctx.body.clone());

        for (name, value) in &ctx.headers {
            if is_end_to_end(name) && name.as_str() != "x-forwarded-for" {
                request = request.header(name, value);
            }
        }

        request = request
            .header("x-request-id", ctx.request_id.clone())
            .header("x-forwarded-for", forwarded_for(ctx));

        let upstream = request.send().await?;
        let status = upstream.status();
        let headers = upstream.headers().clone();
        let body = upstream.bytes().await?;

        let mut builder = Response::builder().status(status);
        for (name, value) in &headers {
            if is_end_to_end(name) {
                builder = builder.header(name, value);
            }
        }

        builder
            .body(Body::from(body))
            .map_err(|e| ServiceError::Internal(e.to_string()))
    }
}

/// Appends the peer to any chain the client already sent.
fn forwarded_for(ctx: &RequestContext) -> String {
    let existing = ctx
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match (existing, ctx.client_ip) {
        (Some(chain), Some(ip)) => format!("{chain}, {ip}"),
        (Some(chain), None) => chain.to_string(),
        (None, Some(ip)) => ip.to_string(),
        (None, None) => "unknown".to_string(),
    }
}

fn is_end_to_end(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue, Method};

    use super::*;

    fn ctx(uri: &str, headers: HeaderMap) -> RequestContext {
        RequestContext::new(
            "req-9".to_string(),
            Method::GET,
            uri.parse().unwrap(),
            headers,
            Bytes::new(),
            Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10))),
        )
    }

    #[test]
    fn keeps_path_and_query() {
        let forwarder = UpstreamForwarder::new(&UpstreamConfig {
            base_url: "http://church-api:3066/".to_string(),
            timeout: Duration::from_secs(1),
        })
        .unwrap();

        let url = forwarder.target_url(&ctx("/api/events?page=2", HeaderMap::new()));
        assert_eq!(url, "http://church-api:3066/api/events?page=2");
    }

    #[test]
    fn appends_peer_to_forwarded_chain() {
        assert_eq!(forwarded_for(&ctx("/", HeaderMap::new())), "192.0.2.10");

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.4"));
        assert_eq!(forwarded_for(&ctx("/", headers)), "198.51.100.4, 192.0.2.10");
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        assert!(!is_end_to_end(&HeaderName::from_static("connection")));
        assert!(!is_end_to_end(&HeaderName::from_static("transfer-encoding")));
        assert!(is_end_to_end(&HeaderName::from_static("authorization")));
    }
}
