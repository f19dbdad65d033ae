//! Configuration management for spikebot
//!
//! Three layers:
//! - `ServerConfig`: process bootstrap, loaded once from `config.yaml`
//!   plus `SPIKEBOT_*` environment overrides.
//! - `GlobalSettings`: process-wide runtime-mutable settings, persisted
//!   as JSON and swapped atomically (read-copy-update).
//! - `BotConfig`: per-bot persisted configuration (see `bot.rs`).

mod bot;
mod profiles;

pub use bot::*;
pub use profiles::{all_profiles, TradingProfile};

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Process bootstrap configuration. Not mutable at runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the dashboard API binds to.
    pub listen_addr: String,
    /// Dashboard API port.
    pub port: u16,
    /// Root directory for bot configs, settlement records, and logs.
    pub data_dir: PathBuf,
    /// CLOB REST endpoint.
    pub clob_host: String,
    /// CLOB market websocket endpoint.
    pub clob_ws_host: String,
    /// Gamma (market metadata) endpoint.
    pub gamma_host: String,
    /// EVM chain id used for order signing.
    pub chain_id: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            port: 8000,
            data_dir: PathBuf::from("data"),
            clob_host: "https://clob.polymarket.com".to_string(),
            clob_ws_host: "wss://ws-subscriptions-clob.polymarket.com/ws".to_string(),
            gamma_host: "https://gamma-api.polymarket.com".to_string(),
            chain_id: 137,
        }
    }
}

impl ServerConfig {
    /// Load from `config.yaml` (if present) with `SPIKEBOT_*` env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("listen_addr", "127.0.0.1")?
            .set_default("port", 8000)?
            .set_default("data_dir", "data")?
            .set_default("clob_host", "https://clob.polymarket.com")?
            .set_default(
                "clob_ws_host",
                "wss://ws-subscriptions-clob.polymarket.com/ws",
            )?
            .set_default("gamma_host", "https://gamma-api.polymarket.com")?
            .set_default("chain_id", 137)?;

        if let Some(p) = path {
            builder = builder.add_source(File::from(p).required(false));
        } else {
            builder = builder.add_source(File::with_name("config").required(false));
        }

        builder
            .add_source(Environment::with_prefix("SPIKEBOT"))
            .build()
            .context("failed to assemble server configuration")?
            .try_deserialize()
            .context("invalid server configuration")
    }
}

/// Process-wide settings, mutable from the dashboard at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Allowed deviation of the expected fill from the reference price
    /// (fraction, e.g. 0.06 = 6%).
    pub slippage_tolerance: f64,
    /// Default order-book depth floors, overridable per bot.
    pub min_bid_liquidity_usd: f64,
    pub min_ask_liquidity_usd: f64,
    /// Maximum spread as a percentage of best bid.
    pub max_spread_pct: f64,
    /// Master switch for the market websocket; when off, bots poll REST.
    pub stream_enabled: bool,
    pub stream_reconnect_min_seconds: f64,
    pub stream_reconnect_max_seconds: f64,
    /// Close all open positions during graceful shutdown.
    pub killswitch_on_shutdown: bool,
    /// tracing filter directive applied at startup.
    pub log_level: String,
    /// Cumulative realized loss across all bots that halts new entries
    /// for the rest of the UTC day. 0 disables.
    pub daily_loss_limit_usd: f64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            slippage_tolerance: 0.06,
            min_bid_liquidity_usd: 5.0,
            min_ask_liquidity_usd: 5.0,
            max_spread_pct: 1.0,
            stream_enabled: true,
            stream_reconnect_min_seconds: 1.0,
            stream_reconnect_max_seconds: 60.0,
            killswitch_on_shutdown: false,
            log_level: "info".to_string(),
            daily_loss_limit_usd: 0.0,
        }
    }
}

/// Read-copy-update handle for [`GlobalSettings`].
///
/// Readers grab one immutable snapshot per decision and keep it for the
/// duration of that decision; writers swap in a whole new snapshot.
#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Arc<GlobalSettings>>>,
}

impl SettingsHandle {
    pub fn new(settings: GlobalSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(settings))),
        }
    }

    /// Current snapshot. Cheap; clones an Arc.
    pub fn current(&self) -> Arc<GlobalSettings> {
        self.inner.read().expect("settings lock poisoned").clone()
    }

    /// Replace the snapshot. In-flight readers keep the old one.
    pub fn replace(&self, settings: GlobalSettings) {
        *self.inner.write().expect("settings lock poisoned") = Arc::new(settings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_rcu_snapshot_isolation() {
        let handle = SettingsHandle::new(GlobalSettings::default());
        let before = handle.current();

        let mut updated = GlobalSettings::default();
        updated.max_spread_pct = 2.5;
        handle.replace(updated);

        // The old snapshot is untouched; new readers see the new value.
        assert!((before.max_spread_pct - 1.0).abs() < f64::EPSILON);
        assert!((handle.current().max_spread_pct - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_server_config_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.chain_id, 137);
    }
}
