//! Strategy state machine.
//!
//! Two strategies share one state space:
//!
//! - **Spike fade**: wait flat for a spike signal, then trade against
//!   it (short pumps, buy dumps) and exit on take-profit, stop-loss,
//!   or max-hold.
//! - **Train of trade**: an explicit target cycle. Start with a buy
//!   target; a fill arms the sell target at take-profit; the exit arms
//!   the next buy target (at the exit price, or below it for
//!   wait-for-drop rebuys). The cycle repeats indefinitely.
//!
//! The engine is pure state: it consumes price updates and spike
//! reports and emits [`TradeDecision`]s. All I/O (validation,
//! execution, persistence) happens in the session around it, and only
//! the session's single decision task touches this state.

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::config::{BotConfig, EntryMode, RebuyStrategy, StrategyMode};
use crate::price::PriceUpdate;
use crate::spike::{SpikeDirection, SpikeReport};
use crate::types::{ExitReason, OrderSide, PnlBreakdown, Position, PositionSide, Target};

/// Observable engine state; `has_position`/`has_target` follow from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No position, no target.
    Flat,
    /// No position, entry target set.
    Armed,
    /// Position open, watching exits.
    Holding,
    /// Close submitted, awaiting settlement.
    Exiting,
    /// Post-exit dwell before the next arm.
    Cooldown,
}

/// An intended trade, ready for validation and execution.
#[derive(Debug, Clone)]
pub struct TradeDecision {
    /// Monotonic per-bot id; the executor deduplicates on it.
    pub decision_id: u64,
    pub side: OrderSide,
    pub amount_usd: f64,
    /// Latest stream price the decision was based on.
    pub reference_price: f64,
    pub closes_position: bool,
    /// Set when this decision closes a position.
    pub exit_reason: Option<ExitReason>,
    pub reason: String,
    /// Decision was made while the market stream was down.
    pub fallback_pricing: bool,
}

pub struct StrategyEngine {
    cfg: BotConfig,
    state: EngineState,
    target: Option<Target>,
    position: Option<Position>,
    next_decision_id: u64,
    /// Decision currently with the executor, if any.
    in_flight: Option<u64>,
    /// First warm price timestamp; startup entries key off it.
    warm_at_ms: Option<i64>,
    /// Startup entry (immediate/delayed buy) already emitted.
    startup_entry_done: bool,
    cooldown_until_ms: i64,
    /// Pending exit reason while a close is in flight.
    exiting_reason: Option<ExitReason>,
}

impl StrategyEngine {
    pub fn new(cfg: BotConfig) -> Self {
        Self {
            cfg,
            state: EngineState::Flat,
            target: None,
            position: None,
            next_decision_id: 0,
            in_flight: None,
            warm_at_ms: None,
            startup_entry_done: false,
            cooldown_until_ms: 0,
            exiting_reason: None,
        }
    }

    /// Restore a previously persisted position (manual recovery path).
    pub fn restore_position(&mut self, position: Position) {
        self.position = Some(position);
        self.state = EngineState::Holding;
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub fn config(&self) -> &BotConfig {
        &self.cfg
    }

    /// Deadline the session should arm a timer for, if any: pending
    /// cooldown expiry, delayed entry, or position max-hold.
    pub fn next_timer_ms(&self) -> Option<i64> {
        match self.state {
            EngineState::Cooldown => Some(self.cooldown_until_ms),
            EngineState::Holding => self.position.as_ref().map(|p| p.deadline_ms),
            EngineState::Flat | EngineState::Armed => {
                if self.cfg.entry_mode == EntryMode::DelayedBuy && !self.startup_entry_done {
                    self.warm_at_ms
                        .map(|w| w + (self.cfg.entry_delay_seconds as i64) * 1000)
                } else {
                    None
                }
            }
            EngineState::Exiting => None,
        }
    }

    fn next_decision(
        &mut self,
        side: OrderSide,
        amount_usd: f64,
        reference_price: f64,
        closes_position: bool,
        exit_reason: Option<ExitReason>,
        reason: impl Into<String>,
        fallback: bool,
    ) -> TradeDecision {
        self.next_decision_id += 1;
        let decision = TradeDecision {
            decision_id: self.next_decision_id,
            side,
            amount_usd,
            reference_price,
            closes_position,
            exit_reason,
            reason: reason.into(),
            fallback_pricing: fallback,
        };
        self.in_flight = Some(decision.decision_id);
        if closes_position {
            self.exiting_reason = exit_reason;
            self.state = EngineState::Exiting;
        }
        decision
    }

    /// Exit rule check while holding, in priority order: take-profit,
    /// stop-loss, time.
    fn risk_exit(&self, price: f64, now_ms: i64) -> Option<ExitReason> {
        let pos = self.position.as_ref()?;
        let hit_tp = match pos.side {
            PositionSide::Long => price >= pos.take_profit_price,
            PositionSide::Short => price <= pos.take_profit_price,
        };
        if hit_tp {
            return Some(ExitReason::TakeProfit);
        }
        let hit_sl = match pos.side {
            PositionSide::Long => price <= pos.stop_loss_price,
            PositionSide::Short => price >= pos.stop_loss_price,
        };
        if hit_sl {
            return Some(ExitReason::StopLoss);
        }
        if now_ms >= pos.deadline_ms {
            return Some(ExitReason::TimeExit);
        }
        None
    }

    fn close_decision(
        &mut self,
        price: f64,
        exit_reason: ExitReason,
        fallback: bool,
    ) -> Option<TradeDecision> {
        let pos = self.position.as_ref()?;
        let side = pos.side.exit_side();
        let amount = pos.amount_usd;
        Some(self.next_decision(
            side,
            amount,
            price,
            true,
            Some(exit_reason),
            format!("{exit_reason}"),
            fallback,
        ))
    }

    /// Startup entries: immediate buys, or buys delayed by wall time
    /// from the first warm price.
    fn startup_entry(&mut self, update: &PriceUpdate, now_ms: i64) -> Option<TradeDecision> {
        if self.startup_entry_done || self.position.is_some() {
            return None;
        }
        let fire = match self.cfg.entry_mode {
            EntryMode::ImmediateBuy => true,
            EntryMode::DelayedBuy => {
                let warm = self.warm_at_ms?;
                now_ms >= warm + (self.cfg.entry_delay_seconds as i64) * 1000
            }
            EntryMode::WaitForSpike => false,
        };
        if !fire {
            return None;
        }
        self.startup_entry_done = true;
        let amount = self.cfg.trade_size_usd;
        Some(self.next_decision(
            OrderSide::Buy,
            amount,
            update.price,
            false,
            None,
            format!("startup_{}", entry_mode_name(self.cfg.entry_mode)),
            update.fallback_pricing,
        ))
    }

    /// Main tick: called for every price update once the feed is warm.
    pub fn on_price(
        &mut self,
        update: &PriceUpdate,
        spike: &SpikeReport,
        now_ms: i64,
    ) -> Option<TradeDecision> {
        if self.warm_at_ms.is_none() {
            self.warm_at_ms = Some(now_ms);
            if self.cfg.strategy_mode == StrategyMode::TrainOfTrade
                && self.cfg.entry_mode == EntryMode::WaitForSpike
                && self.target.is_none()
                && self.position.is_none()
            {
                // Arm the opening buy target one threshold below here.
                let price = update.price * (1.0 - self.cfg.spike_threshold_pct / 100.0);
                self.set_target(Target::new(OrderSide::Buy, price, update.price, "initial"));
            }
        }

        if self.in_flight.is_some() {
            return None;
        }

        // Leave cooldown once the dwell has passed.
        if self.state == EngineState::Cooldown && now_ms >= self.cooldown_until_ms {
            self.state = if self.target.is_some() {
                EngineState::Armed
            } else {
                EngineState::Flat
            };
        }

        match self.state {
            EngineState::Holding => {
                if let Some(reason) = self.risk_exit(update.price, now_ms) {
                    return self.close_decision(update.price, reason, update.fallback_pricing);
                }
                // Train-of-trade exit target (same level as TP, so the
                // risk check normally fires first; this covers targets
                // restored or set manually).
                if let Some(target) = &self.target {
                    if target.action == OrderSide::Sell && target.is_triggered(update.price) {
                        return self.close_decision(
                            update.price,
                            ExitReason::TargetHit,
                            update.fallback_pricing,
                        );
                    }
                }
                None
            }
            EngineState::Flat | EngineState::Armed => {
                if let Some(decision) = self.startup_entry(update, now_ms) {
                    return Some(decision);
                }
                // Armed target evaluation.
                if let Some(target) = &self.target {
                    if target.action == OrderSide::Buy && target.is_triggered(update.price) {
                        let amount = self.cfg.trade_size_usd;
                        let reason = format!("target_hit @ {:.4}", target.price);
                        return Some(self.next_decision(
                            OrderSide::Buy,
                            amount,
                            update.price,
                            false,
                            None,
                            reason,
                            update.fallback_pricing,
                        ));
                    }
                }
                // Spike-fade entries only fire from a truly flat book.
                if self.cfg.strategy_mode == StrategyMode::SpikeFade
                    && self.position.is_none()
                    && spike.is_spike
                {
                    let side = match spike.direction {
                        Some(SpikeDirection::Up) => OrderSide::Sell,
                        Some(SpikeDirection::Down) => OrderSide::Buy,
                        None => return None,
                    };
                    let amount = self.cfg.trade_size_usd;
                    let reason = format!(
                        "spike_{}_{:.2}%_window_{}s",
                        match side {
                            OrderSide::Sell => "up",
                            OrderSide::Buy => "down",
                        },
                        spike.max_change_pct,
                        spike.max_change_window_sec
                    );
                    return Some(self.next_decision(
                        side,
                        amount,
                        update.price,
                        false,
                        None,
                        reason,
                        update.fallback_pricing,
                    ));
                }
                None
            }
            EngineState::Exiting | EngineState::Cooldown => None,
        }
    }

    /// Timer wakeups: max-hold expiry and delayed entries, using the
    /// last known price when no fresh update is flowing.
    pub fn on_timer(&mut self, now_ms: i64, last_update: Option<PriceUpdate>) -> Option<TradeDecision> {
        if self.in_flight.is_some() {
            return None;
        }
        if self.state == EngineState::Cooldown && now_ms >= self.cooldown_until_ms {
            self.state = if self.target.is_some() {
                EngineState::Armed
            } else {
                EngineState::Flat
            };
        }
        let update = last_update?;
        match self.state {
            EngineState::Holding => {
                if self.position.as_ref().is_some_and(|p| now_ms >= p.deadline_ms) {
                    return self.close_decision(
                        update.price,
                        ExitReason::TimeExit,
                        update.fallback_pricing,
                    );
                }
                None
            }
            EngineState::Flat | EngineState::Armed => self.startup_entry(&update, now_ms),
            _ => None,
        }
    }

    /// Operator-initiated order. Still validated and executed like any
    /// other decision.
    pub fn manual_decision(
        &mut self,
        side: OrderSide,
        amount_usd: f64,
        reference_price: f64,
        fallback: bool,
    ) -> TradeDecision {
        let closes = self
            .position
            .as_ref()
            .is_some_and(|p| p.side.exit_side() == side);
        let exit_reason = closes.then_some(ExitReason::Manual);
        self.next_decision(
            side,
            amount_usd,
            reference_price,
            closes,
            exit_reason,
            "manual",
            fallback,
        )
    }

    /// Force-close the open position (operator or killswitch).
    pub fn force_close_decision(
        &mut self,
        reference_price: f64,
        reason: ExitReason,
    ) -> Option<TradeDecision> {
        if self.position.is_none() || self.state == EngineState::Exiting {
            return None;
        }
        self.close_decision(reference_price, reason, false)
    }

    fn set_target(&mut self, target: Target) {
        debug!(
            action = %target.action,
            price = target.price,
            reason = %target.reason,
            "target set"
        );
        self.target = Some(target);
        if self.position.is_none() && self.state != EngineState::Cooldown {
            self.state = EngineState::Armed;
        }
    }

    /// Confirmed fill of an opening decision.
    pub fn on_open_fill(
        &mut self,
        decision: &TradeDecision,
        fill_price: f64,
        order_id: Option<String>,
        now_ms: i64,
    ) {
        self.in_flight = None;
        let side = PositionSide::from_entry(decision.side);
        let position = Position::open(
            side,
            fill_price,
            now_ms,
            decision.amount_usd,
            self.cfg.take_profit_pct,
            self.cfg.stop_loss_pct,
            self.cfg.max_hold_seconds,
            order_id,
        );
        let take_profit_price = position.take_profit_price;
        self.position = Some(position);
        self.state = EngineState::Holding;

        self.target = match self.cfg.strategy_mode {
            StrategyMode::TrainOfTrade => Some(Target::new(
                side.exit_side(),
                take_profit_price,
                fill_price,
                "after_buy",
            )),
            StrategyMode::SpikeFade => None,
        };
    }

    /// Confirmed fill of a closing decision. Returns the closed
    /// position and its realized P&L for the caller to account.
    pub fn on_close_fill(
        &mut self,
        fill_price: f64,
        now_ms: i64,
    ) -> Option<(Position, PnlBreakdown, ExitReason)> {
        self.in_flight = None;
        let position = self.position.take()?;
        let pnl = position.pnl_at(fill_price);
        let reason = self.exiting_reason.take().unwrap_or(ExitReason::Manual);

        self.target = match self.cfg.strategy_mode {
            StrategyMode::TrainOfTrade => {
                let target_price = match self.cfg.rebuy_strategy {
                    RebuyStrategy::Immediate => fill_price,
                    RebuyStrategy::WaitForDrop => {
                        fill_price * (1.0 - self.cfg.rebuy_drop_pct / 100.0)
                    }
                };
                Some(Target::new(
                    OrderSide::Buy,
                    target_price,
                    fill_price,
                    "after_sell",
                ))
            }
            StrategyMode::SpikeFade => None,
        };

        let dwell = self
            .cfg
            .settlement_delay_seconds
            .max(match self.cfg.strategy_mode {
                StrategyMode::TrainOfTrade => self.cfg.rebuy_delay_seconds,
                StrategyMode::SpikeFade => 0.0,
            });
        self.cooldown_until_ms = now_ms + (dwell * 1000.0) as i64;
        self.state = EngineState::Cooldown;

        Some((position, pnl, reason))
    }

    /// The executor gave up on this decision (rejection or exhausted
    /// retries). State rolls back so the next tick can try again.
    pub fn on_decision_failed(&mut self, decision: &TradeDecision) {
        self.in_flight = None;
        if decision.closes_position && self.position.is_some() {
            self.exiting_reason = None;
            self.state = EngineState::Holding;
        } else if self.state == EngineState::Exiting {
            self.state = if self.target.is_some() {
                EngineState::Armed
            } else {
                EngineState::Flat
            };
        }
    }
}

fn entry_mode_name(mode: EntryMode) -> &'static str {
    match mode {
        EntryMode::ImmediateBuy => "immediate_buy",
        EntryMode::WaitForSpike => "wait_for_spike",
        EntryMode::DelayedBuy => "delayed_buy",
    }
}
