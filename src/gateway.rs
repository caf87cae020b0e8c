use std::{
    net::IpAddr,
    sync::Arc,
};

use axum::{
    Json,
    body::{
        Body,
        to_bytes,
    },
    http::{
        HeaderName,
        HeaderValue,
        Request,
    },
    response::{
        IntoResponse,
        Response,
    },
};
use serde_json::json;
use uuid::Uuid;

use crate::{
    config::ServiceConfig,
    context::RequestContext,
    error::{ServiceError, ServiceResult},
    middleware::{
        ControlFlow,
        GatewayMiddleware,
        logging::RequestLoggingMiddleware,
        rate_limit::{
            RateLimitMiddleware,
            RateLimitOptions,
            client_ip_key,
            forwarded_ip_key,
        },
    },
    ratelimit::store::RateLimitStore,
    upstream::{Downstream, UpstreamForwarder},
};

const HEALTH_PATH: &str = "/health";

pub struct Gateway {
    middlewares: Vec<Arc<dyn GatewayMiddleware>>,
    downstream: Arc<dyn Downstream>,
    store: Arc<RateLimitStore>,
    max_body_bytes: usize,
}

impl Gateway {
    pub fn from_config(config: &ServiceConfig, store: Arc<RateLimitStore>) -> ServiceResult<Self> {
        let mut middlewares: Vec<Arc<dyn GatewayMiddleware>> =
            vec![Arc::new(RequestLoggingMiddleware)];

        // General limiters first: response hooks run in reverse, which lets
        // the narrower limiter's headers win.
        let mut limiters = config.limiters.clone();
        limiters.sort_by_key(|l| {
            l.path_prefixes
                .iter()
                .map(String::len)
                .max()
                .unwrap_or(0)
        });

        for limiter in limiters {
            let mut options = RateLimitOptions::new(limiter.name, limiter.window, limiter.max);
            options.path_prefixes = limiter.path_prefixes;
            options.message = limiter.message;
            options.key_generator = if config.trust_proxy {
                forwarded_ip_key()
            } else {
                client_ip_key()
            };

            let middleware = RateLimitMiddleware::new(options, store.clone())
                .map_err(|e| ServiceError::Internal(e.to_string()))?;
            tracing::info!(limiter = middleware.name(), "rate limiter registered");
            middlewares.push(Arc::new(middleware));
        }

        let downstream = Arc::new(UpstreamForwarder::new(&config.upstream)?);

        Ok(Self::new(middlewares, downstream, store, config.max_body_bytes))
    }

    pub fn new(
        middlewares: Vec<Arc<dyn GatewayMiddleware>>,
        downstream: Arc<dyn Downstream>,
        store: Arc<RateLimitStore>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            middlewares,
            downstream,
            store,
            max_body_bytes,
        }
    }

    pub async fn handle_http(
        &self,
        request: Request<Body>,
        client_ip: Option<IpAddr>,
    ) -> Response<Body> {
        let (parts, body) = request.into_parts();

        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty() && v.len() <= 128)
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let body = match to_bytes(body, self.max_body_bytes).await {
            Ok(body) => body,
            Err(_) => {
                let mut response = ServiceError::PayloadTooLarge.into_response();
                attach_hardening_headers(&request_id, &mut response);
                return response;
            }
        };

        let mut ctx = RequestContext::new(
            request_id,
            parts.method,
            parts.uri,
            parts.headers,
            body,
            client_ip,
        );

        if ctx.uri.path() == HEALTH_PATH {
            let mut response = self.health();
            attach_hardening_headers(&ctx.request_id, &mut response);
            return response;
        }

        let mut executed = Vec::new();

        for (idx, middleware) in self.middlewares.iter().enumerate() {
            match middleware.on_request(&mut ctx).await {
                Ok(ControlFlow::Continue) => executed.push(idx),
                Ok(ControlFlow::ShortCircuit(response)) => {
                    return self.finish(&executed, &ctx, response).await;
                }
                Err(err) => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        middleware = middleware.name(),
                        error = %err.detail(),
                        "middleware rejected request"
                    );
                    return self.finish(&executed, &ctx, err.into_response()).await;
                }
            }
        }

        let response = match self.downstream.dispatch(&ctx).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    error = %err.detail(),
                    "downstream call failed"
                );
                err.into_response()
            }
        };

        self.finish(&executed, &ctx, response).await
    }

    fn health(&self) -> Response<Body> {
        Json(json!({
            "ok": true,
            "counterBackend": self.store.counter_backend(),
        }))
        .into_response()
    }

    async fn finish(
        &self,
        executed: &[usize],
        ctx: &RequestContext,
        mut response: Response<Body>,
    ) -> Response<Body> {
        for idx in executed.iter().rev() {
            let middleware = &self.middlewares[*idx];
            if let Err(err) = middleware.on_response(ctx, &mut response).await {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    middleware = middleware.name(),
                    error = %err.detail(),
                    "middleware post-response hook failed"
                );
            }
        }

        attach_hardening_headers(&ctx.request_id, &mut response);
        response
    }
}

fn attach_hardening_headers(request_id: &str, response: &mut Response<Body>) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }

    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
}
