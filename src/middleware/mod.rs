pub mod logging;
pub mod rate_limit;

use async_trait::async_trait;
use axum::{
    body::Body,
    response::Response,
};

use crate::{
    context::RequestContext,
    error::ServiceResult,
};

pub enum ControlFlow {
    Continue,
    ShortCircuit(Response<Body>),
}

/// A pipeline stage. `on_response` runs in reverse order, and only for stages
/// whose `on_request` returned `Continue`.
#[async_trait]
pub trait GatewayMiddleware: Send + Sync {
    fn name(&self) -> &str;

    async fn on_request(&self, ctx: &mut RequestContext) -> ServiceResult<ControlFlow>;

    async fn on_response(
        &self,
        _ctx: &RequestContext,
        _response: &mut Response<Body>,
    ) -> ServiceResult<()> {
        Ok(())
    }
}
