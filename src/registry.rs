//! Bot registry.
//!
//! Process-wide map of bot sessions plus the durable config store.
//! The registry is the only component that creates, starts, and
//! deletes sessions; the dashboard is a thin layer over it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{error, info, warn};

use crate::broadcast::{Broadcaster, BusEvent, EventKind};
use crate::clob::{ClobClient, ExchangeApi, OrderSigner, RestClient, StreamConfig};
use crate::config::{
    BotConfig, BotConfigPatch, GlobalSettings, ServerConfig, SettingsHandle, TradingProfile,
};
use crate::persistence::{secrets, Store};
use crate::session::{BotSession, BotSnapshot, ProcessControls, SessionDeps};

pub struct Registry {
    sessions: RwLock<HashMap<String, Arc<BotSession>>>,
    pub store: Store,
    pub bus: Broadcaster,
    pub settings: SettingsHandle,
    pub controls: Arc<ProcessControls>,
    rest: Arc<RestClient>,
    server_cfg: ServerConfig,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl Registry {
    /// Materialize sessions for every persisted bot config. Bots are
    /// never auto-started; recovered open positions are surfaced in
    /// their activity feeds.
    pub fn bootstrap(
        server_cfg: ServerConfig,
        store: Store,
        settings: SettingsHandle,
        bus: Broadcaster,
    ) -> anyhow::Result<Self> {
        let rest = Arc::new(RestClient::new(&server_cfg.clob_host, &server_cfg.gamma_host));
        let registry = Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            bus,
            settings,
            controls: Arc::new(ProcessControls::new()),
            rest,
            server_cfg,
            started_at: chrono::Utc::now(),
        };

        for config in registry.store.load_all_configs()? {
            let bot_id = config.id.clone();
            let invalid = config.validate().err();
            let session = BotSession::materialize(config, &registry.store, &registry.bus);
            if let Some(e) = invalid {
                error!(bot_id, error = %e, "bot config invalid; parked in error");
                session.mark_config_error(e.to_string());
            }
            registry
                .sessions
                .write()
                .expect("sessions lock")
                .insert(bot_id.clone(), Arc::new(session));
            info!(bot_id, "bot session materialized");
        }
        Ok(registry)
    }

    pub fn get(&self, bot_id: &str) -> Option<Arc<BotSession>> {
        self.sessions.read().expect("sessions lock").get(bot_id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<BotSession>> {
        let mut sessions: Vec<_> = self
            .sessions
            .read()
            .expect("sessions lock")
            .values()
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.shared.config().created_at);
        sessions
    }

    pub fn snapshots(&self) -> Vec<BotSnapshot> {
        self.list().iter().map(|s| s.shared.snapshot()).collect()
    }

    pub fn uptime_seconds(&self) -> f64 {
        (chrono::Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    // ── CRUD ───────────────────────────────────────────────────────

    /// Create and persist a new bot. The wallet secret is sealed
    /// before it ever reaches disk.
    pub fn create_bot(
        &self,
        wallet_secret: &str,
        profile: Option<&str>,
        patch: &BotConfigPatch,
    ) -> Result<BotSnapshot, String> {
        if wallet_secret.trim().is_empty() {
            return Err("wallet_secret is required".to_string());
        }
        let name = patch
            .name
            .clone()
            .ok_or_else(|| "name is required".to_string())?;

        let mut config = BotConfig::new(name, secrets::seal(wallet_secret.trim()));
        if let Some(profile_name) = profile {
            let profile = TradingProfile::get(profile_name)
                .ok_or_else(|| format!("unknown profile '{profile_name}'"))?;
            profile.apply_to(&mut config);
        }
        patch.apply_to(&mut config);
        config.validate().map_err(|e| e.to_string())?;
        self.store.save_config(&config).map_err(|e| e.to_string())?;

        let bot_id = config.id.clone();
        let session = Arc::new(BotSession::materialize(config, &self.store, &self.bus));
        let snapshot = session.shared.snapshot();
        self.sessions
            .write()
            .expect("sessions lock")
            .insert(bot_id.clone(), session);

        info!(bot_id, "bot created");
        self.bus
            .publish(BusEvent::for_bot(EventKind::BotCreated, bot_id, &snapshot));
        Ok(snapshot)
    }

    /// Update a stopped bot's config. Rejected while running.
    pub fn update_bot(
        &self,
        bot_id: &str,
        patch: &BotConfigPatch,
        wallet_secret: Option<&str>,
    ) -> Result<BotSnapshot, String> {
        let session = self.get(bot_id).ok_or_else(|| format!("bot {bot_id} not found"))?;
        if session.is_running() {
            return Err("stop the bot before updating its configuration".to_string());
        }

        let mut config = session.shared.config();
        patch.apply_to(&mut config);
        if let Some(secret) = wallet_secret {
            if !secret.trim().is_empty() {
                config.wallet_secret_encrypted = secrets::seal(secret.trim());
            }
        }
        config.validate().map_err(|e| e.to_string())?;
        self.store.save_config(&config).map_err(|e| e.to_string())?;
        session.shared.set_config(config);

        let snapshot = session.shared.snapshot();
        info!(bot_id, "bot config updated");
        self.bus.publish(BusEvent::for_bot(
            EventKind::BotUpdated,
            bot_id.to_string(),
            &snapshot,
        ));
        Ok(snapshot)
    }

    /// Delete a bot. Rejected while running unless `force`, which
    /// stops the session first. The settlement record stays on disk.
    pub async fn delete_bot(&self, bot_id: &str, force: bool) -> Result<(), String> {
        let session = self.get(bot_id).ok_or_else(|| format!("bot {bot_id} not found"))?;
        if session.is_running() {
            if !force {
                return Err("stop the bot before deleting it".to_string());
            }
            session.stop().await?;
        }

        self.store.delete_config(bot_id).map_err(|e| e.to_string())?;
        self.sessions.write().expect("sessions lock").remove(bot_id);
        info!(bot_id, "bot deleted");
        self.bus.publish(BusEvent::for_bot(
            EventKind::BotDeleted,
            bot_id.to_string(),
            serde_json::json!({ "bot_id": bot_id }),
        ));
        Ok(())
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    fn stream_cfg(&self) -> StreamConfig {
        let settings = self.settings.current();
        StreamConfig {
            ws_host: self.server_cfg.clob_ws_host.clone(),
            reconnect_min: Duration::from_secs_f64(settings.stream_reconnect_min_seconds.max(0.1)),
            reconnect_max: Duration::from_secs_f64(
                settings
                    .stream_reconnect_max_seconds
                    .max(settings.stream_reconnect_min_seconds.max(0.1)),
            ),
        }
    }

    /// Build the per-bot exchange client and start the session task.
    pub async fn start_bot(&self, bot_id: &str) -> Result<BotSnapshot, String> {
        let session = self.get(bot_id).ok_or_else(|| format!("bot {bot_id} not found"))?;
        if session.is_running() {
            return Ok(session.shared.snapshot());
        }
        let config = session.shared.config();

        let signer = match secrets::open(&config.wallet_secret_encrypted)
            .and_then(|secret| {
                OrderSigner::new(
                    &secret,
                    self.server_cfg.chain_id,
                    config.signature_mode,
                    config.funder_address.as_deref(),
                )
            }) {
            Ok(signer) => Some(signer),
            Err(e) if config.dry_run => {
                warn!(bot_id, error = %e, "wallet unusable; dry-run continues unsigned");
                None
            }
            Err(e) => return Err(format!("wallet configuration error: {e}")),
        };

        let client = Arc::new(ClobClient::new(self.rest.clone(), signer));
        let wallet_address = client.wallet_address();
        let user_stream_creds = if config.dry_run {
            None
        } else {
            match client.user_stream_creds().await {
                Ok(creds) => Some(creds),
                Err(e) => {
                    warn!(bot_id, error = %e, "user stream unavailable; relying on order responses");
                    None
                }
            }
        };
        let exchange: Arc<dyn ExchangeApi> = client;

        let deps = SessionDeps {
            exchange,
            wallet_address,
            settings: self.settings.clone(),
            bus: self.bus.clone(),
            store: self.store.clone(),
            controls: self.controls.clone(),
            stream_cfg: self.stream_cfg(),
            user_stream_creds,
        };
        session.start(deps)?;
        Ok(session.shared.snapshot())
    }

    /// Start with an injected exchange (tests and replay tooling).
    pub fn start_bot_with_exchange(
        &self,
        bot_id: &str,
        exchange: Arc<dyn ExchangeApi>,
    ) -> Result<(), String> {
        let session = self.get(bot_id).ok_or_else(|| format!("bot {bot_id} not found"))?;
        let deps = SessionDeps {
            exchange,
            wallet_address: None,
            settings: self.settings.clone(),
            bus: self.bus.clone(),
            store: self.store.clone(),
            controls: self.controls.clone(),
            stream_cfg: self.stream_cfg(),
            user_stream_creds: None,
        };
        session.start(deps)
    }

    pub async fn stop_bot(&self, bot_id: &str) -> Result<BotSnapshot, String> {
        let session = self.get(bot_id).ok_or_else(|| format!("bot {bot_id} not found"))?;
        session.stop().await?;
        Ok(session.shared.snapshot())
    }

    /// Current order book for a bot's token, truncated to `depth`.
    /// Works for stopped bots too by resolving from the config.
    pub async fn orderbook(
        &self,
        bot_id: &str,
        depth: usize,
    ) -> Result<crate::clob::OrderBook, String> {
        let session = self.get(bot_id).ok_or_else(|| format!("bot {bot_id} not found"))?;
        let token_id = match session.shared.token_id() {
            Some(token) => token,
            None => {
                let config = session.shared.config();
                match (config.token_id, config.market_slug) {
                    (Some(token), _) => token,
                    (None, Some(slug)) => self
                        .rest
                        .resolve_token_id(&slug, config.outcome_index)
                        .await
                        .map_err(|e| e.to_string())?,
                    (None, None) => return Err("bot has no market binding".to_string()),
                }
            }
        };
        self.rest
            .get_order_book(&token_id)
            .await
            .map(|book| book.truncated(depth))
            .map_err(|e| e.to_string())
    }

    // ── Settings & killswitch ──────────────────────────────────────

    pub fn update_settings(&self, settings: GlobalSettings) -> Result<GlobalSettings, String> {
        self.store.save_settings(&settings).map_err(|e| e.to_string())?;
        self.settings.replace(settings.clone());
        self.bus
            .publish(BusEvent::global(EventKind::SettingsUpdated, &settings));
        info!("global settings updated");
        Ok(settings)
    }

    /// Engage the global killswitch: all new opening decisions are
    /// rejected until it is cleared.
    pub fn engage_killswitch(&self) {
        self.controls.set_killswitch(true);
        warn!("killswitch engaged");
        self.bus.publish(BusEvent::global(
            EventKind::Error,
            serde_json::json!({ "message": "killswitch engaged", "recoverable": true }),
        ));
    }

    /// Graceful shutdown: optionally close every open position, in
    /// parallel, bounded per bot by the session's grace period.
    pub async fn shutdown_all(&self) {
        let close_positions = self.settings.current().killswitch_on_shutdown;
        if close_positions {
            self.controls.set_killswitch(true);
        }
        let sessions = self.list();
        info!(
            bots = sessions.len(),
            close_positions, "shutting down all sessions"
        );
        join_all(
            sessions
                .iter()
                .filter(|s| s.is_running())
                .map(|s| s.shutdown(close_positions)),
        )
        .await;
    }

    /// Count of sessions currently in each status, for /api/status.
    pub fn status_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for session in self.list() {
            *counts
                .entry(session.shared.status().to_string())
                .or_insert(0) += 1;
        }
        counts
    }

}
