mod config;
mod context;
mod error;
mod gateway;
mod middleware;
mod ratelimit;
mod upstream;

use std::{
    net::SocketAddr,
    sync::Arc,
};

use anyhow::Context;
use axum::{
    Router,
    body::Body,
    extract::{
        ConnectInfo,
        State,
    },
    http::Request,
    routing::any,
};
use gateway::Gateway;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, ServiceConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = ServiceConfig::from_env().context("failed to build service config")?;
    init_tracing(cfg.log_format);

    let bind_addr = cfg.bind_addr;
    let store = ratelimit::store::shared(&cfg.store).await;
    tracing::info!(
        backend = store.counter_backend(),
        health = store.health().as_str(),
        "rate limit store ready"
    );

    let gateway = Arc::new(
        Gateway::from_config(&cfg, store)
            .map_err(|e| anyhow::anyhow!(e.detail()))
            .context("failed to build gateway")?,
    );

    let app = Router::new().fallback(any(proxy_handler)).with_state(gateway);

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("failed to bind listener")?;

    tracing::info!(addr = %bind_addr, upstream = %cfg.upstream.base_url, "church gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server error")?;

    ratelimit::store::close_shared().await;
    tracing::info!("church gateway stopped");

    Ok(())
}

async fn proxy_handler(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> axum::response::Response {
    gateway.handle_http(request, Some(addr.ip())).await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn,redis=warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}
