//! Core types used throughout spikebot
//!
//! Shared data structures for prices, positions, targets, and the
//! activity feed. Everything here is plain data; behavior lives in the
//! strategy/session modules.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side sent to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Direction of an open position.
///
/// LONG = bought outcome shares expecting the price to rise,
/// SHORT = sold shares expecting it to fall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn from_entry(side: OrderSide) -> Self {
        match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        }
    }

    /// Order side that closes a position in this direction.
    pub fn exit_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// A single sample in the price history ring.
///
/// Timestamps are Unix milliseconds; prices are outcome-token
/// probabilities in (0, 1).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub ts_ms: i64,
    pub price: f64,
}

/// Unrealized or realized P&L for a position at a given price.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PnlBreakdown {
    pub pnl_usd: f64,
    pub pnl_pct: f64,
}

/// An open position. At most one exists per bot at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub side: PositionSide,
    pub entry_price: f64,
    /// Unix milliseconds at fill.
    pub entry_time_ms: i64,
    pub amount_usd: f64,
    /// amount_usd / entry_price, fixed at entry.
    pub shares: f64,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    /// entry_time + max_hold; time-based exit fires at or after this.
    pub deadline_ms: i64,
    /// True while an exit order is in flight.
    pub pending_settlement: bool,
    pub entry_order_id: Option<String>,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        side: PositionSide,
        entry_price: f64,
        entry_time_ms: i64,
        amount_usd: f64,
        take_profit_pct: f64,
        stop_loss_pct: f64,
        max_hold_seconds: u64,
        entry_order_id: Option<String>,
    ) -> Self {
        let (tp, sl) = match side {
            PositionSide::Long => (
                entry_price * (1.0 + take_profit_pct / 100.0),
                entry_price * (1.0 - stop_loss_pct / 100.0),
            ),
            PositionSide::Short => (
                entry_price * (1.0 - take_profit_pct / 100.0),
                entry_price * (1.0 + stop_loss_pct / 100.0),
            ),
        };
        Self {
            side,
            entry_price,
            entry_time_ms,
            amount_usd,
            shares: amount_usd / entry_price,
            take_profit_price: tp,
            stop_loss_price: sl,
            deadline_ms: entry_time_ms + (max_hold_seconds as i64) * 1000,
            pending_settlement: false,
            entry_order_id,
        }
    }

    pub fn age_seconds(&self, now_ms: i64) -> f64 {
        ((now_ms - self.entry_time_ms).max(0) as f64) / 1000.0
    }

    /// P&L if the position were closed at `current_price`.
    pub fn pnl_at(&self, current_price: f64) -> PnlBreakdown {
        let (pnl_usd, pnl_pct) = match self.side {
            PositionSide::Long => (
                self.shares * (current_price - self.entry_price),
                100.0 * (current_price / self.entry_price - 1.0),
            ),
            PositionSide::Short => (
                self.shares * (self.entry_price - current_price),
                100.0 * (self.entry_price / current_price - 1.0),
            ),
        };
        PnlBreakdown { pnl_usd, pnl_pct }
    }
}

/// Trigger condition for a saved price target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetCondition {
    /// Fires when price <= target (buy side).
    #[serde(rename = "lte")]
    AtOrBelow,
    /// Fires when price >= target (sell side).
    #[serde(rename = "gte")]
    AtOrAbove,
}

impl fmt::Display for TargetCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetCondition::AtOrBelow => write!(f, "<="),
            TargetCondition::AtOrAbove => write!(f, ">="),
        }
    }
}

/// A saved trade intention: the next order the bot wants to fire and
/// the price at which it fires. At most one exists per bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub action: OrderSide,
    pub price: f64,
    pub condition: TargetCondition,
    pub reason: String,
    pub created_at_ms: i64,
    /// Price at the moment the target was set.
    pub base_price: f64,
}

impl Target {
    /// BUY targets fire at-or-below, SELL targets at-or-above.
    pub fn new(action: OrderSide, price: f64, base_price: f64, reason: impl Into<String>) -> Self {
        let condition = match action {
            OrderSide::Buy => TargetCondition::AtOrBelow,
            OrderSide::Sell => TargetCondition::AtOrAbove,
        };
        Self {
            id: crate::short_id("tgt"),
            action,
            price,
            condition,
            reason: reason.into(),
            created_at_ms: Utc::now().timestamp_millis(),
            base_price,
        }
    }

    pub fn is_triggered(&self, current_price: f64) -> bool {
        match self.condition {
            TargetCondition::AtOrBelow => current_price <= self.price,
            TargetCondition::AtOrAbove => current_price >= self.price,
        }
    }

    /// Signed percent distance from `current_price` to the target.
    pub fn distance_pct(&self, current_price: f64) -> f64 {
        if current_price <= 0.0 {
            return 0.0;
        }
        (self.price - current_price) / current_price * 100.0
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    TimeExit,
    TargetHit,
    Manual,
    Killswitch,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::TakeProfit => write!(f, "take_profit"),
            ExitReason::StopLoss => write!(f, "stop_loss"),
            ExitReason::TimeExit => write!(f, "time_exit"),
            ExitReason::TargetHit => write!(f, "target_hit"),
            ExitReason::Manual => write!(f, "manual"),
            ExitReason::Killswitch => write!(f, "killswitch"),
        }
    }
}

/// Lifecycle state of a bot session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Error,
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BotStatus::Created => write!(f, "created"),
            BotStatus::Running => write!(f, "running"),
            BotStatus::Paused => write!(f, "paused"),
            BotStatus::Stopped => write!(f, "stopped"),
            BotStatus::Error => write!(f, "error"),
        }
    }
}

/// Category of an activity feed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Spike,
    Signal,
    Order,
    Fill,
    Exit,
    Pnl,
    Cooldown,
    Confirm,
    Error,
    System,
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActivityKind::Spike => "spike",
            ActivityKind::Signal => "signal",
            ActivityKind::Order => "order",
            ActivityKind::Fill => "fill",
            ActivityKind::Exit => "exit",
            ActivityKind::Pnl => "pnl",
            ActivityKind::Cooldown => "cooldown",
            ActivityKind::Confirm => "confirm",
            ActivityKind::Error => "error",
            ActivityKind::System => "system",
        };
        write!(f, "{s}")
    }
}

/// Structured payload attached to an activity, keyed by its kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActivityDetails {
    Spike {
        max_change_pct: f64,
        window_sec: u64,
        volatility_cv: f64,
        volatility_filtered: bool,
    },
    Order {
        side: OrderSide,
        amount_usd: f64,
        order_id: Option<String>,
        simulated: bool,
        fallback_pricing: bool,
    },
    Fill {
        side: OrderSide,
        fill_price: f64,
        fill_shares: f64,
        order_id: Option<String>,
        simulated: bool,
    },
    Pnl {
        pnl_usd: f64,
        pnl_pct: f64,
        exit_reason: ExitReason,
    },
    PreCheck {
        rule: String,
    },
    Recovery {
        position: Position,
    },
    None {},
}

/// One entry in a bot's activity feed. Append-only; never mutated
/// after emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub bot_id: String,
    pub kind: ActivityKind,
    pub message: String,
    pub details: ActivityDetails,
}

impl Activity {
    pub fn new(
        bot_id: impl Into<String>,
        kind: ActivityKind,
        message: impl Into<String>,
        details: ActivityDetails,
    ) -> Self {
        Self {
            id: crate::short_id("act"),
            timestamp: Utc::now().timestamp_millis(),
            bot_id: bot_id.into(),
            kind,
            message: message.into(),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_pnl_math() {
        let pos = Position::open(PositionSide::Long, 0.482, 0, 5.0, 5.0, 3.0, 3600, None);
        assert!((pos.shares - 10.373).abs() < 0.001);
        assert!((pos.take_profit_price - 0.5061).abs() < 0.0001);

        let pnl = pos.pnl_at(0.5065);
        assert!((pnl.pnl_pct - 5.08).abs() < 0.01, "got {:.3}%", pnl.pnl_pct);
        assert!((pnl.pnl_usd - 0.254).abs() < 0.001, "got ${:.4}", pnl.pnl_usd);
    }

    #[test]
    fn test_short_pnl_math() {
        let pos = Position::open(PositionSide::Short, 0.625, 0, 5.0, 5.0, 3.0, 3600, None);
        assert!((pos.stop_loss_price - 0.64375).abs() < 1e-9);

        let pnl = pos.pnl_at(0.645);
        assert!(pnl.pnl_usd < 0.0);
        assert!((pnl.pnl_pct - (100.0 * (0.625 / 0.645 - 1.0))).abs() < 1e-9);
    }

    #[test]
    fn test_target_conditions_follow_action() {
        let buy = Target::new(OrderSide::Buy, 0.48, 0.50, "entry");
        assert_eq!(buy.condition, TargetCondition::AtOrBelow);
        assert!(buy.is_triggered(0.48));
        assert!(buy.is_triggered(0.479));
        assert!(!buy.is_triggered(0.481));

        let sell = Target::new(OrderSide::Sell, 0.52, 0.50, "exit");
        assert_eq!(sell.condition, TargetCondition::AtOrAbove);
        assert!(sell.is_triggered(0.52));
        assert!(!sell.is_triggered(0.519));
    }

    #[test]
    fn test_deadline_from_max_hold() {
        let pos = Position::open(PositionSide::Long, 0.5, 1_000, 5.0, 5.0, 3.0, 60, None);
        assert_eq!(pos.deadline_ms, 61_000);
    }
}
