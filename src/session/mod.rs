//! Bot session: one isolated trading bot.
//!
//! Each session owns its price feed, strategy engine, executor, and
//! activity feed, and runs one decision task. That task is the sole
//! writer of strategy state (target, position, counters); everything
//! else talks to it through the command channel or reads the shared
//! snapshot. Exchange calls happen outside the strategy mutation path
//! and a new decision is never evaluated while an earlier one is in
//! flight.

pub mod activity;

pub use activity::ActivityLog;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broadcast::{Broadcaster, BusEvent, EventKind};
use crate::clob::{ApiCreds, ExchangeApi, MarketInfo, OrderEvent, StreamConfig};
use crate::config::{BotConfig, GlobalSettings, SettingsHandle};
use crate::executor::{ExecutionOutcome, OrderExecutor};
use crate::persistence::{ClosedTradeRecord, RuntimeState, SettlementRecord, Store};
use crate::price::{PriceFeed, PriceShared, PriceUpdate};
use crate::risk::{self, RiskLimits, RiskSnapshot};
use crate::spike::{self, SpikeParams, SpikeReport};
use crate::strategy::{EngineState, StrategyEngine, TradeDecision};
use crate::types::{
    Activity, ActivityDetails, ActivityKind, BotStatus, ExitReason, OrderSide, Position, Target,
};

/// Activity ring capacity per bot.
const ACTIVITY_RING_SIZE: usize = 1000;
/// Wait for an in-flight close before a stop gives up.
const EXIT_GRACE: Duration = Duration::from_secs(15);
/// Minimum spacing between spike activities for the same bot.
const SPIKE_ACTIVITY_THROTTLE_MS: i64 = 10_000;
/// Consecutive signature failures that park the bot in `error`.
const MAX_SIGNATURE_FAILURES: u32 = 3;

/// Process-wide controls shared by every session: the killswitch and
/// the cross-bot daily P&L used by the daily loss limit.
pub struct ProcessControls {
    killswitch: AtomicBool,
    daily: StdMutex<(NaiveDate, f64)>,
}

impl ProcessControls {
    pub fn new() -> Self {
        Self {
            killswitch: AtomicBool::new(false),
            daily: StdMutex::new((Utc::now().date_naive(), 0.0)),
        }
    }

    pub fn killswitch(&self) -> bool {
        self.killswitch.load(Ordering::SeqCst)
    }

    pub fn set_killswitch(&self, on: bool) {
        self.killswitch.store(on, Ordering::SeqCst);
    }

    pub fn add_realized(&self, pnl_usd: f64) {
        let mut guard = self.daily.lock().expect("daily pnl lock poisoned");
        let today = Utc::now().date_naive();
        if guard.0 != today {
            *guard = (today, 0.0);
        }
        guard.1 += pnl_usd;
    }

    /// Realized P&L across all bots for the current UTC day.
    pub fn daily_realized_pnl(&self) -> f64 {
        let mut guard = self.daily.lock().expect("daily pnl lock poisoned");
        let today = Utc::now().date_naive();
        if guard.0 != today {
            *guard = (today, 0.0);
        }
        guard.1
    }
}

impl Default for ProcessControls {
    fn default() -> Self {
        Self::new()
    }
}

/// Commands accepted by a running session.
pub enum SessionCommand {
    Pause,
    Resume,
    Stop,
    ManualTrade {
        side: OrderSide,
        amount_usd: f64,
        reply: oneshot::Sender<Result<serde_json::Value, String>>,
    },
    ClosePosition {
        reply: oneshot::Sender<Result<serde_json::Value, String>>,
    },
    /// Graceful process shutdown; optionally close the position first.
    Shutdown { close_position: bool },
}

/// Session counters, updated only by the decision task.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SessionStats {
    pub realized_pnl_usd: f64,
    /// Opening fills since this session started.
    pub trades_this_session: u32,
    /// Closed trades over the bot's lifetime (persisted).
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub spikes_detected: u32,
    pub last_signal_time_ms: Option<i64>,
    pub last_exit_time_ms: Option<i64>,
}

/// Strategy state mirrored for readers outside the decision task.
#[derive(Debug, Clone, Default)]
struct EngineView {
    state: Option<EngineState>,
    position: Option<Position>,
    target: Option<Target>,
}

/// Position plus live P&L for snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct PositionView {
    #[serde(flatten)]
    pub position: Position,
    pub current_price: f64,
    pub pnl_usd: f64,
    pub pnl_pct: f64,
    pub age_seconds: f64,
}

/// Target plus live distance for snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct TargetView {
    #[serde(flatten)]
    pub target: Target,
    pub distance_pct: Option<f64>,
}

/// Full bot snapshot for the dashboard (`init` frame, `GET /bots`).
#[derive(Debug, Clone, Serialize)]
pub struct BotSnapshot {
    pub bot_id: String,
    pub name: String,
    pub description: String,
    pub status: BotStatus,
    pub created_at: DateTime<Utc>,
    pub dry_run: bool,
    pub strategy_mode: crate::config::StrategyMode,
    pub trading_profile: Option<String>,
    pub market_slug: Option<String>,
    pub token_id: Option<String>,
    pub market_name: Option<String>,
    pub market_status: Option<String>,
    pub wallet_address: Option<String>,
    pub current_price: Option<f64>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub last_price_time_ms: Option<i64>,
    pub price_24h_ago: Option<f64>,
    pub price_24h_change_pct: Option<f64>,
    pub stream_connected: bool,
    pub uptime_seconds: Option<f64>,
    pub engine_state: Option<EngineState>,
    pub position: Option<PositionView>,
    pub target: Option<TargetView>,
    pub stats: SessionStats,
    pub spike: Option<SpikeReport>,
    pub spike_threshold_pct: f64,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub trade_size_usd: f64,
    pub last_error: Option<String>,
}

/// State shared between the decision task and HTTP/WS readers.
pub struct SessionShared {
    pub bot_id: String,
    status: RwLock<BotStatus>,
    config: RwLock<BotConfig>,
    stats: RwLock<SessionStats>,
    view: RwLock<EngineView>,
    price: RwLock<Option<Arc<PriceShared>>>,
    token_id: RwLock<Option<String>>,
    wallet_address: RwLock<Option<String>>,
    market_info: RwLock<Option<MarketInfo>>,
    last_error: RwLock<Option<String>>,
    activity: RwLock<ActivityLog>,
    runtime: RwLock<RuntimeState>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    stream_connected: RwLock<bool>,
}

impl SessionShared {
    fn new(config: BotConfig) -> Self {
        Self {
            bot_id: config.id.clone(),
            status: RwLock::new(BotStatus::Created),
            config: RwLock::new(config),
            stats: RwLock::new(SessionStats::default()),
            view: RwLock::new(EngineView::default()),
            price: RwLock::new(None),
            token_id: RwLock::new(None),
            wallet_address: RwLock::new(None),
            market_info: RwLock::new(None),
            last_error: RwLock::new(None),
            activity: RwLock::new(ActivityLog::new(ACTIVITY_RING_SIZE)),
            runtime: RwLock::new(RuntimeState::default()),
            started_at: RwLock::new(None),
            stream_connected: RwLock::new(false),
        }
    }

    pub fn status(&self) -> BotStatus {
        *self.status.read().expect("status lock")
    }

    fn set_status(&self, status: BotStatus) {
        *self.status.write().expect("status lock") = status;
    }

    pub fn config(&self) -> BotConfig {
        self.config.read().expect("config lock").clone()
    }

    pub fn set_config(&self, config: BotConfig) {
        *self.config.write().expect("config lock") = config;
    }

    pub fn stats(&self) -> SessionStats {
        *self.stats.read().expect("stats lock")
    }

    pub fn activities(
        &self,
        limit: usize,
        kind: Option<ActivityKind>,
    ) -> Vec<Activity> {
        self.activity.read().expect("activity lock").list(limit, kind)
    }

    pub fn price_shared(&self) -> Option<Arc<PriceShared>> {
        self.price.read().expect("price lock").clone()
    }

    pub fn token_id(&self) -> Option<String> {
        self.token_id.read().expect("token lock").clone()
    }

    pub fn target(&self) -> Option<Target> {
        self.view.read().expect("view lock").target.clone()
    }

    pub fn position(&self) -> Option<Position> {
        self.view.read().expect("view lock").position.clone()
    }

    fn log_activity(
        &self,
        kind: ActivityKind,
        message: impl Into<String>,
        details: ActivityDetails,
    ) -> Activity {
        let activity = Activity::new(self.bot_id.clone(), kind, message, details);
        self.activity.write().expect("activity lock").add(activity.clone());
        activity
    }

    /// Spike detector output against the current ring, on demand.
    pub fn spike_status(&self) -> Option<SpikeReport> {
        let price = self.price_shared()?;
        let latest = price.latest()?;
        let cfg = self.config();
        let params = SpikeParams {
            windows_seconds: cfg.spike_windows_seconds.clone(),
            threshold_pct: cfg.spike_threshold_pct,
            min_strength_pct: cfg.min_spike_strength,
            use_volatility_filter: cfg.use_volatility_filter,
            max_volatility_cv: cfg.max_volatility_cv,
        };
        Some(price.with_history(|h| spike::detect(h, latest.ts_ms, latest.price, &params)))
    }

    pub fn snapshot(&self) -> BotSnapshot {
        let cfg = self.config();
        let view = self.view.read().expect("view lock").clone();
        let latest = self.price_shared().and_then(|p| p.latest());
        let runtime = self.runtime.read().expect("runtime lock").clone();

        let position = view.position.as_ref().map(|p| {
            let price = latest.map(|u| u.price).unwrap_or(p.entry_price);
            let pnl = p.pnl_at(price);
            PositionView {
                position: p.clone(),
                current_price: price,
                pnl_usd: pnl.pnl_usd,
                pnl_pct: pnl.pnl_pct,
                age_seconds: p.age_seconds(Utc::now().timestamp_millis()),
            }
        });
        let target = view.target.as_ref().map(|t| TargetView {
            target: t.clone(),
            distance_pct: latest.map(|u| t.distance_pct(u.price)),
        });

        let price_24h = runtime.price_24h_ago;
        let change_24h = match (price_24h, latest) {
            (Some(old), Some(now)) if old > 0.0 => Some((now.price - old) / old * 100.0),
            _ => None,
        };

        let market_info = self.market_info.read().expect("market lock").clone();
        BotSnapshot {
            bot_id: self.bot_id.clone(),
            name: cfg.name.clone(),
            description: cfg.description.clone(),
            status: self.status(),
            created_at: cfg.created_at,
            dry_run: cfg.dry_run,
            strategy_mode: cfg.strategy_mode,
            trading_profile: cfg.trading_profile.clone(),
            market_slug: cfg.market_slug.clone(),
            token_id: self.token_id(),
            market_name: market_info.as_ref().map(|m| m.question.clone()),
            market_status: market_info.as_ref().map(|m| m.status().to_string()),
            wallet_address: self.wallet_address.read().expect("wallet lock").clone(),
            current_price: latest.map(|u| u.price),
            best_bid: latest.and_then(|u| u.best_bid),
            best_ask: latest.and_then(|u| u.best_ask),
            last_price_time_ms: latest.map(|u| u.ts_ms),
            price_24h_ago: price_24h,
            price_24h_change_pct: change_24h,
            stream_connected: *self.stream_connected.read().expect("stream lock"),
            uptime_seconds: self
                .started_at
                .read()
                .expect("started lock")
                .map(|t| (Utc::now() - t).num_milliseconds() as f64 / 1000.0)
                .filter(|_| self.status() == BotStatus::Running),
            engine_state: view.state,
            position,
            target,
            stats: self.stats(),
            spike: self.spike_status(),
            spike_threshold_pct: cfg.spike_threshold_pct,
            take_profit_pct: cfg.take_profit_pct,
            stop_loss_pct: cfg.stop_loss_pct,
            trade_size_usd: cfg.trade_size_usd,
            last_error: self.last_error.read().expect("error lock").clone(),
        }
    }
}

/// Everything a session needs from the process around it.
pub struct SessionDeps {
    pub exchange: Arc<dyn ExchangeApi>,
    pub wallet_address: Option<String>,
    pub settings: SettingsHandle,
    pub bus: Broadcaster,
    pub store: Store,
    pub controls: Arc<ProcessControls>,
    pub stream_cfg: StreamConfig,
    /// Credentials for the optional user confirmation stream.
    pub user_stream_creds: Option<ApiCreds>,
}

/// Handle owned by the registry. The actual work happens in the
/// spawned decision task.
pub struct BotSession {
    pub shared: Arc<SessionShared>,
    command_tx: StdMutex<Option<mpsc::Sender<SessionCommand>>>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl BotSession {
    /// Materialize a session from its persisted config and settlement
    /// record. A persisted open position is surfaced as an activity
    /// and left untouched until the operator starts the bot.
    pub fn materialize(config: BotConfig, store: &Store, bus: &Broadcaster) -> Self {
        let shared = Arc::new(SessionShared::new(config));

        match store.load_settlement(&shared.bot_id) {
            Ok(Some(record)) => {
                {
                    let mut stats = shared.stats.write().expect("stats lock");
                    stats.realized_pnl_usd = record.realized_pnl_usd;
                    stats.total_trades = record.total_trades;
                    stats.winning_trades = record.winning_trades;
                    stats.losing_trades = record.losing_trades;
                    stats.last_exit_time_ms =
                        record.last_exit_time.map(|t| t.timestamp_millis());
                }
                if let Some(position) = record.open_position {
                    warn!(
                        bot_id = %shared.bot_id,
                        side = %position.side,
                        entry_price = position.entry_price,
                        "recovered open position from settlement record"
                    );
                    let activity = shared.log_activity(
                        ActivityKind::System,
                        format!(
                            "recovered-open-position: {} ${:.2} @ {:.4}",
                            position.side, position.amount_usd, position.entry_price
                        ),
                        ActivityDetails::Recovery {
                            position: position.clone(),
                        },
                    );
                    bus.publish(BusEvent::for_bot(
                        EventKind::Activity,
                        shared.bot_id.clone(),
                        &activity,
                    ));
                    shared.view.write().expect("view lock").position = Some(position);
                }
            }
            Ok(None) => {}
            Err(e) => error!(bot_id = %shared.bot_id, error = %e, "failed to load settlement record"),
        }

        *shared.runtime.write().expect("runtime lock") = store.load_runtime(&shared.bot_id);

        Self {
            shared,
            command_tx: StdMutex::new(None),
            task: StdMutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.shared.status(), BotStatus::Running | BotStatus::Paused)
    }

    /// Park the bot in `error` with a reason (invalid config at load).
    /// It will not start until the config is repaired.
    pub fn mark_config_error(&self, reason: String) {
        self.shared.set_status(BotStatus::Error);
        *self.shared.last_error.write().expect("error lock") = Some(reason.clone());
        self.shared
            .log_activity(ActivityKind::Error, reason, ActivityDetails::None {});
    }

    /// Spawn the decision task. No-op when already running.
    pub fn start(&self, deps: SessionDeps) -> Result<(), String> {
        if self.is_running() {
            return Ok(());
        }
        let config = self.shared.config();
        config.validate().map_err(|e| {
            self.shared.set_status(BotStatus::Error);
            *self.shared.last_error.write().expect("error lock") = Some(e.to_string());
            e.to_string()
        })?;

        let (tx, rx) = mpsc::channel(32);
        *self.command_tx.lock().expect("command lock") = Some(tx);
        self.shared.set_status(BotStatus::Running);
        *self.shared.started_at.write().expect("started lock") = Some(Utc::now());
        {
            // Session counters restart; lifetime counters persist.
            let mut stats = self.shared.stats.write().expect("stats lock");
            stats.trades_this_session = 0;
            stats.spikes_detected = 0;
        }
        *self.shared.last_error.write().expect("error lock") = None;
        self.shared.wallet_address.write().expect("wallet lock").clone_from(&deps.wallet_address);

        let shared = self.shared.clone();
        let handle = tokio::spawn(run_session(shared, deps, rx));
        *self.task.lock().expect("task lock") = Some(handle);
        info!(bot_id = %self.shared.bot_id, "bot session started");
        Ok(())
    }

    async fn send(&self, cmd: SessionCommand) -> Result<(), String> {
        let tx = self
            .command_tx
            .lock()
            .expect("command lock")
            .clone()
            .ok_or_else(|| "bot is not running".to_string())?;
        tx.send(cmd).await.map_err(|_| "bot task is gone".to_string())
    }

    pub async fn stop(&self) -> Result<(), String> {
        if !self.is_running() {
            return Ok(());
        }
        self.send(SessionCommand::Stop).await?;
        let handle = self.task.lock().expect("task lock").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(EXIT_GRACE + Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!(bot_id = %self.shared.bot_id, "session task did not stop in time");
            }
        }
        *self.command_tx.lock().expect("command lock") = None;
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), String> {
        if self.shared.status() != BotStatus::Running {
            return Err("bot is not running".to_string());
        }
        self.send(SessionCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<(), String> {
        if self.shared.status() != BotStatus::Paused {
            return Err("bot is not paused".to_string());
        }
        self.send(SessionCommand::Resume).await
    }

    pub async fn manual_trade(
        &self,
        side: OrderSide,
        amount_usd: f64,
    ) -> Result<serde_json::Value, String> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::ManualTrade { side, amount_usd, reply })
            .await?;
        rx.await.map_err(|_| "bot task is gone".to_string())?
    }

    pub async fn close_position(&self) -> Result<serde_json::Value, String> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::ClosePosition { reply }).await?;
        rx.await.map_err(|_| "bot task is gone".to_string())?
    }

    /// Graceful shutdown path; waits for the task to finish.
    pub async fn shutdown(&self, close_position: bool) {
        if !self.is_running() {
            return;
        }
        let _ = self.send(SessionCommand::Shutdown { close_position }).await;
        let handle = self.task.lock().expect("task lock").take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(EXIT_GRACE + Duration::from_secs(5), handle).await;
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

enum Flow {
    Continue,
    Break,
}

/// The per-bot decision task.
async fn run_session(
    shared: Arc<SessionShared>,
    deps: SessionDeps,
    mut commands: mpsc::Receiver<SessionCommand>,
) {
    let cfg = shared.config();
    let bot_id = shared.bot_id.clone();
    let bus = deps.bus.clone();

    // Resolve the outcome token.
    let token_id = match &cfg.token_id {
        Some(token) => token.clone(),
        None => {
            let slug = cfg.market_slug.clone().unwrap_or_default();
            match deps.exchange.resolve_token_id(&slug, cfg.outcome_index).await {
                Ok(token) => token,
                Err(e) => {
                    let message = format!("failed to resolve market '{slug}': {e}");
                    fail_session(&shared, &bus, message);
                    return;
                }
            }
        }
    };
    *shared.token_id.write().expect("token lock") = Some(token_id.clone());

    if let Some(slug) = &cfg.market_slug {
        if let Ok(info) = deps.exchange.get_market_info(slug).await {
            *shared.market_info.write().expect("market lock") = Some(info);
        }
    }

    // Price feed.
    let settings = deps.settings.current();
    let mut feed = PriceFeed::spawn(
        deps.exchange.clone(),
        token_id.clone(),
        cfg.price_history_size,
        settings.stream_enabled,
        deps.stream_cfg.clone(),
    );
    *shared.price.write().expect("price lock") = Some(feed.shared.clone());

    // Optional user confirmation stream.
    let mut user_rx = deps.user_stream_creds.clone().map(|creds| {
        let (tx, rx) = mpsc::channel(64);
        crate::clob::spawn_user_stream(deps.stream_cfg.clone(), creds, vec![], tx);
        rx
    });

    // Strategy engine, restoring a recovered position if one exists.
    let mut engine = StrategyEngine::new(cfg.clone());
    if let Some(position) = shared.view.read().expect("view lock").position.clone() {
        engine.restore_position(position);
    }
    let executor = OrderExecutor::new(deps.exchange.clone(), token_id.clone(), cfg.dry_run);

    let mut runner = Runner {
        shared: shared.clone(),
        bus: bus.clone(),
        store: deps.store.clone(),
        settings: deps.settings.clone(),
        controls: deps.controls.clone(),
        exchange: deps.exchange.clone(),
        engine,
        executor,
        token_id,
        cfg,
        last_spike_activity_ms: 0,
        signature_failures: 0,
        paused: false,
    };

    runner.activity(
        ActivityKind::System,
        "bot started",
        ActivityDetails::None {},
    );
    bus.publish(BusEvent::for_bot(
        EventKind::BotStarted,
        bot_id.clone(),
        shared.snapshot(),
    ));
    runner.sync_view();

    let mut stream_was_connected = *feed.stream_connected.borrow();
    let mut stream_watch_alive = true;

    loop {
        let timer_target = runner.engine.next_timer_ms();

        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                match runner.handle_command(cmd).await {
                    Flow::Continue => {}
                    Flow::Break => break,
                }
            }

            update = feed.updates.recv() => {
                let Some(update) = update else {
                    fail_session(&shared, &bus, "price feed terminated".to_string());
                    break;
                };
                if runner.process_update(update).await.is_err() {
                    break;
                }
            }

            changed = feed.stream_connected.changed(), if stream_watch_alive => {
                match changed {
                    Ok(()) => {
                        let connected = *feed.stream_connected.borrow();
                        if connected != stream_was_connected {
                            stream_was_connected = connected;
                            runner.on_stream_status(connected);
                        }
                    }
                    Err(_) => stream_watch_alive = false,
                }
            }

            event = recv_opt(&mut user_rx) => {
                if let Some(event) = event {
                    runner.on_user_event(event);
                }
            }

            _ = sleep_until_ms(timer_target) => {
                if runner.on_timer().await.is_err() {
                    break;
                }
            }
        }
    }

    // Final persistence; an open position stays in the settlement
    // record for recovery.
    runner.persist_settlement();
    feed.shutdown();

    if shared.status() != BotStatus::Error {
        shared.set_status(BotStatus::Stopped);
    }
    runner.activity(ActivityKind::System, "bot stopped", ActivityDetails::None {});
    bus.publish(BusEvent::for_bot(
        EventKind::BotStopped,
        bot_id.clone(),
        shared.snapshot(),
    ));
    info!(bot_id = %bot_id, "bot session stopped");
}

fn fail_session(shared: &Arc<SessionShared>, bus: &Broadcaster, message: String) {
    error!(bot_id = %shared.bot_id, %message, "bot session failed");
    shared.set_status(BotStatus::Error);
    *shared.last_error.write().expect("error lock") = Some(message.clone());
    let activity = shared.log_activity(ActivityKind::Error, message.clone(), ActivityDetails::None {});
    bus.publish(BusEvent::for_bot(
        EventKind::Activity,
        shared.bot_id.clone(),
        &activity,
    ));
    bus.publish(BusEvent::for_bot(
        EventKind::Error,
        shared.bot_id.clone(),
        json!({ "message": message, "recoverable": false }),
    ));
}

async fn recv_opt(rx: &mut Option<mpsc::Receiver<OrderEvent>>) -> Option<OrderEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_ms(target: Option<i64>) {
    match target {
        Some(ms) => {
            // 250ms floor keeps an overdue timer from spinning the loop.
            let delta = (ms - now_ms()).max(250) as u64;
            tokio::time::sleep(Duration::from_millis(delta)).await;
        }
        None => std::future::pending().await,
    }
}

/// Decision-task state. Only this struct mutates the engine.
struct Runner {
    shared: Arc<SessionShared>,
    bus: Broadcaster,
    store: Store,
    settings: SettingsHandle,
    controls: Arc<ProcessControls>,
    exchange: Arc<dyn ExchangeApi>,
    engine: StrategyEngine,
    executor: OrderExecutor,
    token_id: String,
    cfg: BotConfig,
    last_spike_activity_ms: i64,
    signature_failures: u32,
    paused: bool,
}

impl Runner {
    fn activity(&self, kind: ActivityKind, message: impl Into<String>, details: ActivityDetails) {
        let activity = self.shared.log_activity(kind, message, details);
        self.bus.publish(BusEvent::for_bot(
            EventKind::Activity,
            self.shared.bot_id.clone(),
            &activity,
        ));
    }

    fn sync_view(&self) {
        let mut view = self.shared.view.write().expect("view lock");
        view.state = Some(self.engine.state());
        view.position = self.engine.position().cloned();
        view.target = self.engine.target().cloned();
    }

    fn spike_params(&self) -> SpikeParams {
        SpikeParams {
            windows_seconds: self.cfg.spike_windows_seconds.clone(),
            threshold_pct: self.cfg.spike_threshold_pct,
            min_strength_pct: self.cfg.min_spike_strength,
            use_volatility_filter: self.cfg.use_volatility_filter,
            max_volatility_cv: self.cfg.max_volatility_cv,
        }
    }

    fn risk_limits(&self, settings: &GlobalSettings) -> RiskLimits {
        RiskLimits {
            max_trades_per_session: self.cfg.max_trades_per_session,
            session_loss_limit_usd: self.cfg.session_loss_limit_usd,
            daily_loss_limit_usd: settings.daily_loss_limit_usd,
            cooldown_seconds: self.cfg.cooldown_seconds,
            settlement_delay_seconds: self.cfg.settlement_delay_seconds,
            max_balance_usd: self.cfg.max_balance_usd,
            min_bid_liquidity_usd: self.cfg.min_bid_liquidity_usd,
            min_ask_liquidity_usd: self.cfg.min_ask_liquidity_usd,
            max_spread_pct: self.cfg.max_spread_pct,
            slippage_tolerance: settings.slippage_tolerance,
        }
    }

    fn update_24h_baseline(&self, price: f64) {
        let mut runtime = self.shared.runtime.write().expect("runtime lock");
        let now = Utc::now();
        let roll = match runtime.price_24h_timestamp {
            None => true,
            Some(at) => now - at >= chrono::Duration::hours(24),
        };
        if roll {
            runtime.price_24h_ago = Some(price);
            runtime.price_24h_timestamp = Some(now);
            self.store.save_runtime(&self.shared.bot_id, &runtime);
        }
    }

    fn record_last_trade(&self, side: OrderSide) {
        let mut runtime = self.shared.runtime.write().expect("runtime lock");
        runtime.last_trade_time = Some(Utc::now());
        runtime.last_trade_side = Some(side.to_string());
        self.store.save_runtime(&self.shared.bot_id, &runtime);
    }

    fn persist_settlement(&self) {
        let stats = self.shared.stats();
        let record = SettlementRecord {
            realized_pnl_usd: stats.realized_pnl_usd,
            total_trades: stats.total_trades,
            winning_trades: stats.winning_trades,
            losing_trades: stats.losing_trades,
            last_exit_time: stats
                .last_exit_time_ms
                .and_then(DateTime::from_timestamp_millis),
            open_position: self.engine.position().cloned(),
        };
        if let Err(e) = self.store.save_settlement(&self.shared.bot_id, &record) {
            error!(bot_id = %self.shared.bot_id, error = %e, "failed to persist settlement record");
        }
    }

    fn on_stream_status(&mut self, connected: bool) {
        *self.shared.stream_connected.write().expect("stream lock") = connected;
        if connected {
            self.activity(
                ActivityKind::System,
                "stream_reconnected",
                ActivityDetails::None {},
            );
        } else {
            self.activity(
                ActivityKind::System,
                "stream_disconnected: continuing on REST fallback",
                ActivityDetails::None {},
            );
            self.bus.publish(BusEvent::for_bot(
                EventKind::Error,
                self.shared.bot_id.clone(),
                json!({ "message": "market stream disconnected", "recoverable": true }),
            ));
        }
    }

    fn on_user_event(&mut self, event: OrderEvent) {
        let status = event.status.to_lowercase();
        if matches!(status.as_str(), "matched" | "filled" | "trade") {
            self.activity(
                ActivityKind::Confirm,
                format!(
                    "fill confirmed via user stream: {} @ {}",
                    crate::truncate_id(&event.order_id),
                    event
                        .avg_fill_price
                        .map(|p| format!("{p:.4}"))
                        .unwrap_or_else(|| "n/a".to_string()),
                ),
                ActivityDetails::None {},
            );
        }
    }

    /// One price tick through detection and strategy.
    async fn process_update(&mut self, update: PriceUpdate) -> Result<(), ()> {
        self.update_24h_baseline(update.price);

        self.bus.publish(BusEvent::for_bot(
            EventKind::PriceUpdate,
            self.shared.bot_id.clone(),
            json!({
                "price": update.price,
                "best_bid": update.best_bid,
                "best_ask": update.best_ask,
            }),
        ));

        let price_shared = self.shared.price_shared().expect("feed attached");
        let report = price_shared
            .with_history(|h| spike::detect(h, update.ts_ms, update.price, &self.spike_params()));

        let crossed = report.max_change_pct.abs() >= self.cfg.spike_threshold_pct
            && report.max_change_window_sec > 0;
        if crossed && update.ts_ms - self.last_spike_activity_ms >= SPIKE_ACTIVITY_THROTTLE_MS {
            self.last_spike_activity_ms = update.ts_ms;
            if report.is_spike {
                self.shared.stats.write().expect("stats lock").spikes_detected += 1;
            }
            let arrow = if report.max_change_pct >= 0.0 { "up" } else { "down" };
            let suffix = if report.is_volatility_filtered {
                " (volatility filtered)"
            } else {
                ""
            };
            self.activity(
                ActivityKind::Spike,
                format!(
                    "spike {arrow} {:+.2}% over {}s{suffix}",
                    report.max_change_pct, report.max_change_window_sec
                ),
                ActivityDetails::Spike {
                    max_change_pct: report.max_change_pct,
                    window_sec: report.max_change_window_sec,
                    volatility_cv: report.volatility_cv,
                    volatility_filtered: report.is_volatility_filtered,
                },
            );
            if report.is_spike {
                self.bus.publish(BusEvent::for_bot(
                    EventKind::SpikeDetected,
                    self.shared.bot_id.clone(),
                    json!({
                        "max_change_pct": report.max_change_pct,
                        "window_sec": report.max_change_window_sec,
                        "direction": report.direction,
                    }),
                ));
            }
        }

        if self.paused {
            self.sync_view();
            return Ok(());
        }

        if let Some(decision) = self.engine.on_price(&update, &report, update.ts_ms) {
            let result = self.handle_decision(decision).await;
            self.sync_view();
            return result.map(|_| ());
        }
        self.sync_view();
        Ok(())
    }

    async fn on_timer(&mut self) -> Result<(), ()> {
        if self.paused {
            return Ok(());
        }
        let latest = self.shared.price_shared().and_then(|p| p.latest());
        if let Some(decision) = self.engine.on_timer(now_ms(), latest) {
            let result = self.handle_decision(decision).await.map(|_| ());
            self.sync_view();
            return result;
        }
        self.sync_view();
        Ok(())
    }

    /// Validate and execute one decision. `Err(())` means the session
    /// must move to `error`.
    async fn handle_decision(
        &mut self,
        decision: TradeDecision,
    ) -> Result<Option<serde_json::Value>, ()> {
        let settings = self.settings.current();
        let limits = self.risk_limits(&settings);

        // Snapshot inputs for the validator.
        let balance = if !self.cfg.dry_run && !decision.closes_position {
            match self.exchange.get_balance_allowance().await {
                Ok(balance) => Some(balance),
                Err(e) => {
                    warn!(error = %e, "balance fetch failed before decision");
                    None
                }
            }
        } else {
            None
        };
        let book = match self.exchange.get_order_book(&self.token_id).await {
            Ok(book) => Some(book),
            Err(e) => {
                warn!(error = %e, "book fetch failed before decision");
                None
            }
        };

        let stats = self.shared.stats();
        let snapshot = RiskSnapshot {
            now_ms: now_ms(),
            killswitch: self.controls.killswitch(),
            trades_this_session: stats.trades_this_session,
            realized_pnl_usd: stats.realized_pnl_usd,
            daily_realized_pnl_usd: self.controls.daily_realized_pnl(),
            last_signal_time_ms: stats.last_signal_time_ms,
            last_exit_time_ms: stats.last_exit_time_ms,
            has_position: self.engine.position().is_some(),
            balance,
            book: book.as_ref(),
            dry_run: self.cfg.dry_run,
        };

        if let Err(rejection) = risk::validate(&decision, &limits, &snapshot) {
            let kind = match rejection.rule() {
                "cooldown" | "settlement_delay" => ActivityKind::Cooldown,
                _ => ActivityKind::Error,
            };
            self.activity(
                kind,
                format!("PRE_CHECK_FAILED: {} ({rejection})", rejection.rule()),
                ActivityDetails::PreCheck {
                    rule: rejection.rule().to_string(),
                },
            );
            self.engine.on_decision_failed(&decision);
            return Ok(None);
        }

        self.activity(
            ActivityKind::Order,
            format!(
                "{} ${:.2} submitted ({})",
                decision.side, decision.amount_usd, decision.reason
            ),
            ActivityDetails::Order {
                side: decision.side,
                amount_usd: decision.amount_usd,
                order_id: None,
                simulated: self.cfg.dry_run,
                fallback_pricing: decision.fallback_pricing,
            },
        );

        match self.executor.execute(&decision, settings.slippage_tolerance).await {
            ExecutionOutcome::Filled(fill) => {
                self.signature_failures = 0;
                self.apply_fill(&decision, fill).map(Some)
            }
            ExecutionOutcome::Rejected { reason_code, message } => {
                self.activity(
                    ActivityKind::Error,
                    format!("ORDER_REJECTED: {message}"),
                    ActivityDetails::PreCheck {
                        rule: reason_code.to_string(),
                    },
                );
                self.engine.on_decision_failed(&decision);
                if reason_code == "invalid_signature" {
                    self.signature_failures += 1;
                    if self.signature_failures >= MAX_SIGNATURE_FAILURES {
                        fail_session(
                            &self.shared,
                            &self.bus,
                            "repeated signature failures; check wallet configuration".to_string(),
                        );
                        return Err(());
                    }
                } else {
                    self.signature_failures = 0;
                }
                Ok(None)
            }
            ExecutionOutcome::TransientFailure { message, attempts } => {
                self.activity(
                    ActivityKind::Error,
                    format!("ORDER_TRANSIENT_FAIL after {attempts} attempts: {message}"),
                    ActivityDetails::None {},
                );
                self.engine.on_decision_failed(&decision);
                Ok(None)
            }
            ExecutionOutcome::Duplicate => Ok(None),
        }
    }

    /// Confirmed fill: the only place a Position materializes or dies.
    fn apply_fill(
        &mut self,
        decision: &TradeDecision,
        fill: crate::clob::OrderFill,
    ) -> Result<serde_json::Value, ()> {
        let now = now_ms();

        self.activity(
            ActivityKind::Fill,
            format!(
                "{} filled: {:.4} shares @ {:.4}{}",
                decision.side,
                fill.fill_shares,
                fill.fill_price,
                if fill.simulated { " (simulated)" } else { "" }
            ),
            ActivityDetails::Fill {
                side: decision.side,
                fill_price: fill.fill_price,
                fill_shares: fill.fill_shares,
                order_id: Some(fill.order_id.clone()),
                simulated: fill.simulated,
            },
        );
        self.bus.publish(BusEvent::for_bot(
            EventKind::TradeExecuted,
            self.shared.bot_id.clone(),
            json!({
                "side": decision.side,
                "amount_usd": decision.amount_usd,
                "fill_price": fill.fill_price,
                "order_id": fill.order_id,
                "simulated": fill.simulated,
            }),
        ));
        self.record_last_trade(decision.side);

        if decision.closes_position {
            let Some((position, pnl, reason)) = self.engine.on_close_fill(fill.fill_price, now)
            else {
                // A close filled with no position to close: state is
                // corrupt, park the bot.
                fail_session(
                    &self.shared,
                    &self.bus,
                    "invariant violation: close fill without an open position".to_string(),
                );
                return Err(());
            };

            {
                let mut stats = self.shared.stats.write().expect("stats lock");
                stats.realized_pnl_usd += pnl.pnl_usd;
                stats.total_trades += 1;
                if pnl.pnl_usd > 0.0 {
                    stats.winning_trades += 1;
                } else {
                    stats.losing_trades += 1;
                }
                stats.last_exit_time_ms = Some(now);
            }
            self.controls.add_realized(pnl.pnl_usd);

            self.activity(
                ActivityKind::Pnl,
                format!(
                    "trade closed ({reason}): P&L ${:+.2} ({:+.2}%)",
                    pnl.pnl_usd, pnl.pnl_pct
                ),
                ActivityDetails::Pnl {
                    pnl_usd: pnl.pnl_usd,
                    pnl_pct: pnl.pnl_pct,
                    exit_reason: reason,
                },
            );
            self.persist_settlement();
            if let Err(e) = self.store.append_trade(
                &self.shared.bot_id,
                &ClosedTradeRecord {
                    ts_open_ms: position.entry_time_ms,
                    ts_close_ms: now,
                    side: position.side,
                    entry_price: position.entry_price,
                    exit_price: fill.fill_price,
                    amount_usd: position.amount_usd,
                    shares: position.shares,
                    pnl_usd: pnl.pnl_usd,
                    pnl_pct: pnl.pnl_pct,
                    exit_reason: reason,
                    order_id: Some(fill.order_id.clone()),
                    simulated: fill.simulated,
                },
            ) {
                warn!(error = %e, "failed to append trade history");
            }

            self.bus.publish(BusEvent::for_bot(
                EventKind::PositionClosed,
                self.shared.bot_id.clone(),
                json!({
                    "pnl_usd": pnl.pnl_usd,
                    "pnl_pct": pnl.pnl_pct,
                    "reason": reason,
                }),
            ));
            self.publish_position_and_target();

            Ok(json!({
                "order_id": fill.order_id,
                "side": decision.side,
                "amount_usd": decision.amount_usd,
                "fill_price": fill.fill_price,
                "pnl_usd": pnl.pnl_usd,
                "simulated": fill.simulated,
            }))
        } else {
            self.engine
                .on_open_fill(decision, fill.fill_price, Some(fill.order_id.clone()), now);
            {
                let mut stats = self.shared.stats.write().expect("stats lock");
                stats.trades_this_session += 1;
                stats.last_signal_time_ms = Some(now);
            }
            self.persist_settlement();
            self.publish_position_and_target();

            Ok(json!({
                "order_id": fill.order_id,
                "side": decision.side,
                "amount_usd": decision.amount_usd,
                "fill_price": fill.fill_price,
                "simulated": fill.simulated,
            }))
        }
    }

    fn publish_position_and_target(&mut self) {
        self.sync_view();
        let snapshot = self.shared.snapshot();
        self.bus.publish(BusEvent::for_bot(
            EventKind::PositionUpdate,
            self.shared.bot_id.clone(),
            &snapshot.position,
        ));
        self.bus.publish(BusEvent::for_bot(
            EventKind::TargetUpdate,
            self.shared.bot_id.clone(),
            &snapshot.target,
        ));
    }

    async fn handle_command(&mut self, cmd: SessionCommand) -> Flow {
        match cmd {
            SessionCommand::Pause => {
                self.paused = true;
                self.shared.set_status(BotStatus::Paused);
                self.activity(ActivityKind::System, "bot paused", ActivityDetails::None {});
                self.bus.publish(BusEvent::for_bot(
                    EventKind::BotPaused,
                    self.shared.bot_id.clone(),
                    self.shared.snapshot(),
                ));
                Flow::Continue
            }
            SessionCommand::Resume => {
                self.paused = false;
                self.shared.set_status(BotStatus::Running);
                self.activity(ActivityKind::System, "bot resumed", ActivityDetails::None {});
                self.bus.publish(BusEvent::for_bot(
                    EventKind::BotResumed,
                    self.shared.bot_id.clone(),
                    self.shared.snapshot(),
                ));
                Flow::Continue
            }
            SessionCommand::Stop => Flow::Break,
            SessionCommand::ManualTrade { side, amount_usd, reply } => {
                let result = match self.shared.price_shared().and_then(|p| p.latest()) {
                    None => Err("no price yet; wait for feed warmup".to_string()),
                    Some(latest) => {
                        let decision = self.engine.manual_decision(
                            side,
                            amount_usd,
                            latest.price,
                            latest.fallback_pricing,
                        );
                        match self.handle_decision(decision).await {
                            Ok(Some(fill)) => Ok(fill),
                            Ok(None) => Err("order was not filled (see activity feed)".to_string()),
                            Err(()) => Err("bot entered error state".to_string()),
                        }
                    }
                };
                let fatal = matches!(&result, Err(m) if m == "bot entered error state");
                let _ = reply.send(result);
                self.sync_view();
                if fatal {
                    Flow::Break
                } else {
                    Flow::Continue
                }
            }
            SessionCommand::ClosePosition { reply } => {
                let latest = self.shared.price_shared().and_then(|p| p.latest());
                let result = match (self.engine.position().cloned(), latest) {
                    (None, _) => Err("no open position".to_string()),
                    (_, None) => Err("no price yet; wait for feed warmup".to_string()),
                    (Some(_), Some(update)) => {
                        match self.engine.force_close_decision(update.price, ExitReason::Manual) {
                            None => Err("close already in progress".to_string()),
                            Some(decision) => match self.handle_decision(decision).await {
                                Ok(Some(fill)) => Ok(fill),
                                Ok(None) => {
                                    Err("close was not filled (see activity feed)".to_string())
                                }
                                Err(()) => Err("bot entered error state".to_string()),
                            },
                        }
                    }
                };
                let fatal = matches!(&result, Err(m) if m == "bot entered error state");
                let _ = reply.send(result);
                self.sync_view();
                if fatal {
                    Flow::Break
                } else {
                    Flow::Continue
                }
            }
            SessionCommand::Shutdown { close_position } => {
                if close_position && self.engine.position().is_some() {
                    if let Some(latest) = self.shared.price_shared().and_then(|p| p.latest()) {
                        if let Some(decision) = self
                            .engine
                            .force_close_decision(latest.price, ExitReason::Killswitch)
                        {
                            let close = self.handle_decision(decision);
                            if tokio::time::timeout(EXIT_GRACE, close).await.is_err() {
                                warn!(
                                    bot_id = %self.shared.bot_id,
                                    "shutdown close did not resolve within grace period"
                                );
                            }
                        }
                    }
                }
                Flow::Break
            }
        }
    }
}
