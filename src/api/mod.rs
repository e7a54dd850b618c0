//! HTTP surfaces of a node: the peer-facing "bt" listener and the admin listener.

use std::{future::Future, net::SocketAddr, sync::Arc};

use crate::{engine::Registry, tracker::TrackerClient};

pub(crate) mod error;
mod handlers;
mod router;


#[derive(Clone)]
pub struct ApiState {
    registry: Arc<Registry>,
    tracker: Option<TrackerClient>,
}

impl ApiState {
    pub fn new(registry: Arc<Registry>, tracker: Option<TrackerClient>) -> Self {
        Self { registry, tracker }
    }
}

pub fn bt_router(state: ApiState) -> axum::Router {
    router::build_bt_app(state)
}

pub fn admin_router(state: ApiState) -> axum::Router {
    router::build_admin_app(state)
}

pub fn bind_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let bind_ip: std::net::IpAddr = host
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen host '{host}': {e}"))?;
    Ok(SocketAddr::new(bind_ip, port))
}

/// Binds `addr` and serves `app` until `shutdown` resolves.
pub async fn serve(
    name: &'static str,
    addr: SocketAddr,
    app: axum::Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(server = name, addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!(server = name, "http server stopped");
    Ok(())
}
