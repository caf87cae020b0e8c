use std::{
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

use crate::{
    context::RequestContext,
    error::{LimiterConfigError, ServiceError, ServiceResult},
    middleware::{ControlFlow, GatewayMiddleware},
    ratelimit::{CounterSnapshot, store::RateLimitStore},
};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

pub type KeyGenerator = Arc<dyn Fn(&RequestContext) -> anyhow::Result<String> + Send + Sync>;

/// Keys on the socket peer address.
pub fn client_ip_key() -> KeyGenerator {
    Arc::new(|ctx: &RequestContext| {
        ctx.client_ip
            .map(|ip| ip.to_string())
            .ok_or_else(|| anyhow!("client address unavailable"))
    })
}

/// Keys on the first `X-Forwarded-For` hop, for deployments behind a trusted
/// proxy. Falls back to the peer address.
pub fn forwarded_ip_key() -> KeyGenerator {
    Arc::new(|ctx: &RequestContext| {
        let forwarded = ctx
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        match forwarded {
            Some(raw) => raw
                .parse::<IpAddr>()
                .map(|ip| ip.to_string())
                .map_err(|_| anyhow!("malformed x-forwarded-for entry")),
            None => ctx
                .client_ip
                .map(|ip| ip.to_string())
                .ok_or_else(|| anyhow!("client address unavailable")),
        }
    })
}

#[derive(Clone)]
pub struct RateLimitOptions {
    /// Also the key namespace, so limiters with different names never share
    /// counters.
    pub name: String,
    pub window: Duration,
    pub max: u64,
    /// Empty means every path.
    pub path_prefixes: Vec<String>,
    pub key_generator: KeyGenerator,
    pub message: String,
    pub status: u16,
    pub skip_successful_requests: bool,
    pub skip_failed_requests: bool,
}

impl RateLimitOptions {
    pub fn new(name: impl Into<String>, window: Duration, max: u64) -> Self {
        Self {
            name: name.into(),
            window,
            max,
            path_prefixes: Vec::new(),
            key_generator: client_ip_key(),
            message: "Too many requests, please try again later.".to_string(),
            status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
            skip_successful_requests: false,
            skip_failed_requests: false,
        }
    }
}

pub struct RateLimitMiddleware {
    name: String,
    window: Duration,
    max: u64,
    path_prefixes: Vec<String>,
    key_generator: KeyGenerator,
    message: String,
    status: StatusCode,
    skip_successful_requests: bool,
    skip_failed_requests: bool,
    store: Arc<RateLimitStore>,
}

impl RateLimitMiddleware {
    pub fn new(
        options: RateLimitOptions,
        store: Arc<RateLimitStore>,
    ) -> Result<Self, LimiterConfigError> {
        let name = options.name.trim().to_string();
        if name.is_empty() {
            return Err(LimiterConfigError::EmptyName);
        }
        if options.window.as_millis() == 0 {
            return Err(LimiterConfigError::ZeroWindow(name));
        }
        if options.max == 0 {
            return Err(LimiterConfigError::ZeroMax(name));
        }
        let status = StatusCode::from_u16(options.status).map_err(|_| {
            LimiterConfigError::InvalidStatus {
                name: name.clone(),
                status: options.status,
            }
        })?;

        Ok(Self {
            name,
            window: options.window,
            max: options.max,
            path_prefixes: options.path_prefixes,
            key_generator: options.key_generator,
            message: options.message,
            status,
            skip_successful_requests: options.skip_successful_requests,
            skip_failed_requests: options.skip_failed_requests,
            store,
        })
    }

    fn applies_to(&self, path: &str) -> bool {
        self.path_prefixes.is_empty()
            || self
                .path_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
    }

    fn meta(&self, field: &str) -> String {
        format!("ratelimit.{}.{field}", self.name)
    }

    fn same_window(&self, ctx: &RequestContext) -> bool {
        ctx.metadata
            .get(&self.meta("window_ends_ms"))
            .and_then(|v| v.parse::<u128>().ok())
            .is_some_and(|ends_ms| ctx.started_at.elapsed().as_millis() < ends_ms)
    }

    fn write_headers(&self, headers: &mut HeaderMap, remaining: u64, reset_secs: u64) {
        for (name, value) in [
            (X_RATELIMIT_LIMIT, self.max),
            (X_RATELIMIT_REMAINING, remaining),
            (X_RATELIMIT_RESET, reset_secs),
        ] {
            if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
                headers.insert(name, value);
            }
        }
    }

    fn limited_response(&self, snapshot: CounterSnapshot) -> Response<Body> {
        let mut response = ServiceError::RateLimited {
            status: self.status,
            message: self.message.clone(),
            retry_after_secs: snapshot.ttl_secs,
        }
        .into_response();
        self.write_headers(response.headers_mut(), 0, snapshot.ttl_secs);
        response
    }
}

#[async_trait]
impl GatewayMiddleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> ServiceResult<ControlFlow> {
        if !self.applies_to(ctx.uri.path()) {
            return Ok(ControlFlow::Continue);
        }

        // Fail open: an infrastructure or key-extraction fault must not lock
        // out legitimate traffic. Availability wins over strict enforcement
        // here; switching this to a rejection changes behaviour during
        // outages.
        let client_key = match (self.key_generator)(ctx) {
            Ok(key) if !key.trim().is_empty() => key,
            Ok(_) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    limiter = %self.name,
                    "rate limit key was empty; allowing request"
                );
                return Ok(ControlFlow::Continue);
            }
            Err(err) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    limiter = %self.name,
                    error = %err,
                    "could not derive rate limit key; allowing request"
                );
                return Ok(ControlFlow::Continue);
            }
        };

        let key = format!("{}:{}", self.name, client_key);
        let snapshot = self.store.increment(&key, self.window).await;

        if snapshot.count > self.max {
            tracing::debug!(
                request_id = %ctx.request_id,
                limiter = %self.name,
                count = snapshot.count,
                retry_after_secs = snapshot.ttl_secs,
                "request throttled"
            );
            return Ok(ControlFlow::ShortCircuit(self.limited_response(snapshot)));
        }

        let remaining = self.max.saturating_sub(snapshot.count);
        ctx.metadata.insert(self.meta("key"), key);
        ctx.metadata.insert(self.meta("remaining"), remaining.to_string());
        ctx.metadata
            .insert(self.meta("reset"), snapshot.ttl_secs.to_string());
        // Window end relative to request start, so the response hook can tell
        // whether the counter it would decrement still belongs to this window.
        let window_ends_ms = ctx
            .started_at
            .elapsed()
            .saturating_add(snapshot.reset_in)
            .as_millis();
        ctx.metadata
            .insert(self.meta("window_ends_ms"), window_ends_ms.to_string());

        Ok(ControlFlow::Continue)
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) -> ServiceResult<()> {
        let Some(key) = ctx.metadata.get(&self.meta("key")) else {
            return Ok(());
        };

        let failed = response.status().as_u16() >= 400;
        if (failed && self.skip_failed_requests) || (!failed && self.skip_successful_requests) {
            if self.same_window(ctx) {
                self.store.decrement(key).await;
            } else {
                tracing::debug!(
                    request_id = %ctx.request_id,
                    limiter = %self.name,
                    "window rolled over during request; not uncounting"
                );
            }
        }

        // Response hooks run innermost first, so the most specific limiter
        // has already written its headers by the time outer ones get here.
        if response.headers().contains_key(X_RATELIMIT_LIMIT) {
            return Ok(());
        }
        let remaining = ctx
            .metadata
            .get(&self.meta("remaining"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let reset = ctx
            .metadata
            .get(&self.meta("reset"))
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| self.window.as_secs());
        self.write_headers(response.headers_mut(), remaining, reset);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use axum::body::to_bytes;
    use bytes::Bytes;
    use http::{Method, header};

    use super::*;
    use crate::ratelimit::store::tests::{FlakyRemote, store_config};

    fn request(ip: [u8; 4], path: &str) -> RequestContext {
        RequestContext::new(
            "req-1".to_string(),
            Method::GET,
            path.parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            Some(IpAddr::V4(Ipv4Addr::from(ip))),
        )
    }

    fn local_store() -> Arc<RateLimitStore> {
        Arc::new(RateLimitStore::with_backends(None, &store_config()))
    }

    fn limiter(store: &Arc<RateLimitStore>, options: RateLimitOptions) -> RateLimitMiddleware {
        RateLimitMiddleware::new(options, store.clone()).unwrap()
    }

    fn ok_response(status: StatusCode) -> Response<Body> {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = status;
        response
    }

    fn header_value(response: &Response<Body>, name: &HeaderName) -> String {
        response.headers()[name].to_str().unwrap().to_string()
    }

    /// Runs one request through the limiter and returns the response a
    /// client would see, using `status` for requests that are let through.
    async fn pass(
        limiter: &RateLimitMiddleware,
        ip: [u8; 4],
        status: StatusCode,
    ) -> Response<Body> {
        let mut ctx = request(ip, "/api/members");
        match limiter.on_request(&mut ctx).await.unwrap() {
            ControlFlow::ShortCircuit(response) => response,
            ControlFlow::Continue => {
                let mut response = ok_response(status);
                limiter.on_response(&ctx, &mut response).await.unwrap();
                response
            }
        }
    }

    async fn assert_five_then_throttled(store: Arc<RateLimitStore>) {
        let limiter = limiter(&store, RateLimitOptions::new("api", Duration::from_secs(60), 5));

        for expected_remaining in [4, 3, 2, 1, 0] {
            let response = pass(&limiter, [10, 0, 0, 1], StatusCode::OK).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(header_value(&response, &X_RATELIMIT_LIMIT), "5");
            assert_eq!(
                header_value(&response, &X_RATELIMIT_REMAINING),
                expected_remaining.to_string()
            );
        }

        let response = pass(&limiter, [10, 0, 0, 1], StatusCode::OK).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header_value(&response, &X_RATELIMIT_REMAINING), "0");
        let retry_after: u64 = header_value(&response, &header::RETRY_AFTER).parse().unwrap();
        assert!(retry_after <= 60);

        let body = to_bytes(response.into_body(), 4096).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Too Many Requests");
        assert_eq!(json["message"], "Too many requests, please try again later.");
        assert_eq!(json["retryAfter"], retry_after);
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_request_in_window_is_rejected() {
        assert_five_then_throttled(local_store()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn broken_remote_backend_gives_identical_results() {
        let remote = FlakyRemote::broken();
        let store = Arc::new(RateLimitStore::with_backends(Some(remote), &store_config()));
        assert_five_then_throttled(store).await;
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_lets_requests_through_again() {
        let store = local_store();
        let limiter = limiter(&store, RateLimitOptions::new("api", Duration::from_millis(1_000), 3));

        for _ in 0..3 {
            let response = pass(&limiter, [10, 0, 0, 2], StatusCode::OK).await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        tokio::time::advance(Duration::from_millis(1_100)).await;
        let response = pass(&limiter, [10, 0, 0, 2], StatusCode::OK).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_value(&response, &X_RATELIMIT_REMAINING), "2");
    }

    #[tokio::test(start_paused = true)]
    async fn independent_limiters_do_not_share_counts() {
        let store = local_store();
        let login = limiter(&store, RateLimitOptions::new("login", Duration::from_secs(900), 10));
        let api = limiter(&store, RateLimitOptions::new("api", Duration::from_secs(60), 300));

        for _ in 0..10 {
            pass(&login, [10, 0, 0, 3], StatusCode::OK).await;
        }
        let throttled = pass(&login, [10, 0, 0, 3], StatusCode::OK).await;
        assert_eq!(throttled.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = pass(&api, [10, 0, 0, 3], StatusCode::OK).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_value(&response, &X_RATELIMIT_REMAINING), "299");
    }

    #[tokio::test(start_paused = true)]
    async fn clients_are_counted_separately() {
        let store = local_store();
        let limiter = limiter(&store, RateLimitOptions::new("api", Duration::from_secs(60), 1));

        assert_eq!(pass(&limiter, [10, 0, 0, 4], StatusCode::OK).await.status(), StatusCode::OK);
        assert_eq!(pass(&limiter, [10, 0, 0, 5], StatusCode::OK).await.status(), StatusCode::OK);
        assert_eq!(
            pass(&limiter, [10, 0, 0, 4], StatusCode::OK).await.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test(start_paused = true)]
    async fn custom_status_and_message_are_used() {
        let store = local_store();
        let mut options = RateLimitOptions::new("login", Duration::from_secs(60), 1);
        options.status = 503;
        options.message = "Too many login attempts".to_string();
        let limiter = limiter(&store, options);

        pass(&limiter, [10, 0, 0, 6], StatusCode::OK).await;
        let response = pass(&limiter, [10, 0, 0, 6], StatusCode::OK).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = to_bytes(response.into_body(), 4096).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["message"], "Too many login attempts");
    }

    // Fail-open is intentional: a broken key generator must let traffic
    // through rather than block every caller.
    #[tokio::test(start_paused = true)]
    async fn key_generator_errors_fail_open() {
        let store = local_store();
        let mut options = RateLimitOptions::new("api", Duration::from_secs(60), 1);
        options.key_generator = Arc::new(|_: &RequestContext| Err(anyhow!("boom")));
        let limiter = limiter(&store, options);

        for _ in 0..5 {
            let response = pass(&limiter, [10, 0, 0, 7], StatusCode::OK).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key(X_RATELIMIT_LIMIT));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_keys_fail_open() {
        let store = local_store();
        let mut options = RateLimitOptions::new("api", Duration::from_secs(60), 1);
        options.key_generator = Arc::new(|_: &RequestContext| Ok("  ".to_string()));
        let limiter = limiter(&store, options);

        for _ in 0..3 {
            let response = pass(&limiter, [10, 0, 0, 8], StatusCode::OK).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(store.get("api:  ").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn skip_successful_requests_only_counts_failures() {
        let store = local_store();
        let mut options = RateLimitOptions::new("login", Duration::from_secs(60), 2);
        options.skip_successful_requests = true;
        let limiter = limiter(&store, options);

        for _ in 0..5 {
            let response = pass(&limiter, [10, 0, 0, 9], StatusCode::OK).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(store.get("login:10.0.0.9").await, Some(0));

        pass(&limiter, [10, 0, 0, 9], StatusCode::UNAUTHORIZED).await;
        pass(&limiter, [10, 0, 0, 9], StatusCode::UNAUTHORIZED).await;
        let response = pass(&limiter, [10, 0, 0, 9], StatusCode::OK).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test(start_paused = true)]
    async fn skip_failed_requests_only_counts_successes() {
        let store = local_store();
        let mut options = RateLimitOptions::new("api", Duration::from_secs(60), 2);
        options.skip_failed_requests = true;
        let limiter = limiter(&store, options);

        pass(&limiter, [10, 0, 0, 10], StatusCode::INTERNAL_SERVER_ERROR).await;
        pass(&limiter, [10, 0, 0, 10], StatusCode::OK).await;
        assert_eq!(store.get("api:10.0.0.10").await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_request_does_not_uncount_the_next_window() {
        let store = local_store();
        let mut options = RateLimitOptions::new("login", Duration::from_millis(1_000), 5);
        options.skip_successful_requests = true;
        let limiter = limiter(&store, options);

        let mut slow = request([10, 0, 0, 14], "/api/auth/login");
        assert!(matches!(
            limiter.on_request(&mut slow).await.unwrap(),
            ControlFlow::Continue
        ));

        tokio::time::advance(Duration::from_millis(1_100)).await;
        pass(&limiter, [10, 0, 0, 14], StatusCode::UNAUTHORIZED).await;
        assert_eq!(store.get("login:10.0.0.14").await, Some(1));

        let mut response = ok_response(StatusCode::OK);
        limiter.on_response(&slow, &mut response).await.unwrap();
        assert_eq!(store.get("login:10.0.0.14").await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn paths_outside_scope_are_not_counted() {
        let store = local_store();
        let mut options = RateLimitOptions::new("login", Duration::from_secs(60), 1);
        options.path_prefixes = vec!["/api/auth/login".to_string()];
        let limiter = limiter(&store, options);

        let mut ctx = request([10, 0, 0, 11], "/api/members");
        assert!(matches!(
            limiter.on_request(&mut ctx).await.unwrap(),
            ControlFlow::Continue
        ));
        assert!(ctx.metadata.is_empty());
        assert_eq!(store.get("login:10.0.0.11").await, None);
    }

    #[tokio::test]
    async fn invalid_configuration_is_rejected_at_setup() {
        let store = local_store();
        let build = |options| RateLimitMiddleware::new(options, store.clone()).err();

        assert_eq!(
            build(RateLimitOptions::new("api", Duration::ZERO, 5)),
            Some(LimiterConfigError::ZeroWindow("api".to_string()))
        );
        assert_eq!(
            build(RateLimitOptions::new("api", Duration::from_secs(1), 0)),
            Some(LimiterConfigError::ZeroMax("api".to_string()))
        );
        assert_eq!(
            build(RateLimitOptions::new(" ", Duration::from_secs(1), 1)),
            Some(LimiterConfigError::EmptyName)
        );

        let mut options = RateLimitOptions::new("api", Duration::from_secs(1), 1);
        options.status = 42;
        assert!(matches!(
            build(options),
            Some(LimiterConfigError::InvalidStatus { status: 42, .. })
        ));
    }

    #[test]
    fn forwarded_key_prefers_first_hop() {
        let mut ctx = request([10, 0, 0, 12], "/api");
        ctx.headers
            .insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        assert_eq!(forwarded_ip_key()(&ctx).unwrap(), "203.0.113.7");

        ctx.headers
            .insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        assert!(forwarded_ip_key()(&ctx).is_err());

        ctx.headers.remove("x-forwarded-for");
        assert_eq!(forwarded_ip_key()(&ctx).unwrap(), "10.0.0.12");
    }
}
