//! Dashboard module.
//!
//! HTTP + websocket control surface for the operator dashboard. Thin
//! by design: every mutation maps onto a registry or session method.

mod api;
mod types;
mod websocket;

pub use api::create_router;
pub use types::*;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::registry::Registry;

/// Serve the dashboard API until `shutdown` resolves.
pub async fn serve(
    registry: Arc<Registry>,
    listen_addr: &str,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = format!("{listen_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "dashboard API listening");

    axum::serve(listener, create_router(registry))
        .with_graceful_shutdown(shutdown)
        .await
        .context("dashboard server error")
}
