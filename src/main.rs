//! spikebot server entrypoint.
//!
//! Loads the bootstrap config, materializes persisted bots (never
//! auto-starting them), and serves the dashboard API until SIGINT.
//! With `killswitch_on_shutdown` enabled, every running bot is asked
//! to close its position before the process exits.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use spikebot::broadcast::Broadcaster;
use spikebot::config::{ServerConfig, SettingsHandle};
use spikebot::dashboard;
use spikebot::persistence::Store;
use spikebot::registry::Registry;

#[tokio::main]
async fn main() -> Result<()> {
    let server_cfg = ServerConfig::load(None)?;
    let store = Store::new(server_cfg.data_dir.clone());
    let settings = store.load_settings().context("failed to load settings")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %server_cfg.data_dir.display(),
        "spikebot starting"
    );

    let settings = SettingsHandle::new(settings);
    let bus = Broadcaster::new();
    let registry = Arc::new(Registry::bootstrap(
        server_cfg.clone(),
        store,
        settings,
        bus,
    )?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = {
        let registry = registry.clone();
        tokio::spawn(async move {
            dashboard::serve(registry, &server_cfg.listen_addr, server_cfg.port, async {
                let _ = shutdown_rx.await;
            })
            .await
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    warn!("shutdown signal received");

    registry.shutdown_all().await;
    let _ = shutdown_tx.send(());
    match server.await {
        Ok(result) => result?,
        Err(e) => warn!(error = %e, "server task aborted"),
    }

    info!("spikebot stopped");
    Ok(())
}
