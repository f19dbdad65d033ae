//! Pre-trade risk validation.
//!
//! A decision is admitted only when every check passes. Checks run in
//! a fixed order and the first failure wins, so identical inputs
//! always produce the identical verdict. The validator is a pure
//! function of its snapshot inputs; the session gathers the snapshot
//! (balances, fresh book, counters, clock) before calling in.

use serde::Serialize;
use std::fmt;

use crate::clob::{BalanceAllowance, OrderBook};
use crate::strategy::TradeDecision;
use crate::types::OrderSide;

/// Depth levels summed when checking book liquidity.
const DEPTH_LEVELS: usize = 5;

/// Limits assembled from the bot config and global settings.
#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub max_trades_per_session: u32,
    pub session_loss_limit_usd: f64,
    pub daily_loss_limit_usd: f64,
    pub cooldown_seconds: u64,
    pub settlement_delay_seconds: f64,
    pub max_balance_usd: f64,
    pub min_bid_liquidity_usd: f64,
    pub min_ask_liquidity_usd: f64,
    pub max_spread_pct: f64,
    pub slippage_tolerance: f64,
}

/// Point-in-time snapshot the verdict is computed from.
#[derive(Debug, Clone)]
pub struct RiskSnapshot<'a> {
    pub now_ms: i64,
    pub killswitch: bool,
    pub trades_this_session: u32,
    pub realized_pnl_usd: f64,
    /// Today's realized P&L across all bots in the process.
    pub daily_realized_pnl_usd: f64,
    pub last_signal_time_ms: Option<i64>,
    pub last_exit_time_ms: Option<i64>,
    pub has_position: bool,
    /// None in dry-run (balance check downgraded to a warning there).
    pub balance: Option<BalanceAllowance>,
    /// Freshly fetched book; None means the fetch itself failed.
    pub book: Option<&'a OrderBook>,
    pub dry_run: bool,
}

/// Why a decision was dropped. `rule()` is the machine-readable name
/// recorded in the PRE_CHECK_FAILED activity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RiskRejection {
    Killswitch,
    SessionTradeCap { trades: u32, cap: u32 },
    SessionLossLimit { realized_usd: f64, limit_usd: f64 },
    DailyLossLimit { realized_usd: f64, limit_usd: f64 },
    Cooldown { remaining_seconds: f64 },
    SettlementDelay { remaining_seconds: f64 },
    PositionOpen,
    BotBudgetExceeded { amount_usd: f64, budget_usd: f64 },
    InsufficientBalance { balance_usd: f64, needed_usd: f64 },
    InsufficientAllowance { allowance_usd: f64, needed_usd: f64 },
    NoLiquidity,
    InsufficientBidLiquidity { depth_usd: f64, required_usd: f64 },
    InsufficientAskLiquidity { depth_usd: f64, required_usd: f64 },
    SpreadTooWide { spread_pct: f64, max_pct: f64 },
    SlippageExceeded { expected: f64, bound: f64 },
}

impl RiskRejection {
    pub fn rule(&self) -> &'static str {
        match self {
            RiskRejection::Killswitch => "killswitch",
            RiskRejection::SessionTradeCap { .. } => "session_trade_cap",
            RiskRejection::SessionLossLimit { .. } => "session_loss_limit",
            RiskRejection::DailyLossLimit { .. } => "daily_loss_limit",
            RiskRejection::Cooldown { .. } => "cooldown",
            RiskRejection::SettlementDelay { .. } => "settlement_delay",
            RiskRejection::PositionOpen => "position_open",
            RiskRejection::BotBudgetExceeded { .. } => "bot_budget_exceeded",
            RiskRejection::InsufficientBalance { .. } => "insufficient_balance",
            RiskRejection::InsufficientAllowance { .. } => "insufficient_allowance",
            RiskRejection::NoLiquidity => "no_liquidity",
            RiskRejection::InsufficientBidLiquidity { .. } => "insufficient_bid_liquidity",
            RiskRejection::InsufficientAskLiquidity { .. } => "insufficient_ask_liquidity",
            RiskRejection::SpreadTooWide { .. } => "spread_too_wide",
            RiskRejection::SlippageExceeded { .. } => "slippage_exceeded",
        }
    }
}

impl fmt::Display for RiskRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskRejection::Killswitch => write!(f, "killswitch active"),
            RiskRejection::SessionTradeCap { trades, cap } => {
                write!(f, "session trade cap reached ({trades}/{cap})")
            }
            RiskRejection::SessionLossLimit { realized_usd, limit_usd } => {
                write!(f, "session loss limit hit (${realized_usd:.2} <= -${limit_usd:.2})")
            }
            RiskRejection::DailyLossLimit { realized_usd, limit_usd } => {
                write!(f, "daily loss limit hit (${realized_usd:.2} <= -${limit_usd:.2})")
            }
            RiskRejection::Cooldown { remaining_seconds } => {
                write!(f, "cooldown: {remaining_seconds:.1}s remaining")
            }
            RiskRejection::SettlementDelay { remaining_seconds } => {
                write!(f, "settlement delay: {remaining_seconds:.1}s remaining")
            }
            RiskRejection::PositionOpen => write!(f, "position already open"),
            RiskRejection::BotBudgetExceeded { amount_usd, budget_usd } => {
                write!(f, "trade ${amount_usd:.2} exceeds bot budget ${budget_usd:.2}")
            }
            RiskRejection::InsufficientBalance { balance_usd, needed_usd } => {
                write!(f, "insufficient balance: ${balance_usd:.2} < ${needed_usd:.2}")
            }
            RiskRejection::InsufficientAllowance { allowance_usd, needed_usd } => {
                write!(f, "insufficient allowance: ${allowance_usd:.2} < ${needed_usd:.2}")
            }
            RiskRejection::NoLiquidity => write!(f, "orderbook empty on one or both sides"),
            RiskRejection::InsufficientBidLiquidity { depth_usd, required_usd } => {
                write!(f, "bid depth ${depth_usd:.2} < ${required_usd:.2}")
            }
            RiskRejection::InsufficientAskLiquidity { depth_usd, required_usd } => {
                write!(f, "ask depth ${depth_usd:.2} < ${required_usd:.2}")
            }
            RiskRejection::SpreadTooWide { spread_pct, max_pct } => {
                write!(f, "spread {spread_pct:.2}% > {max_pct:.2}%")
            }
            RiskRejection::SlippageExceeded { expected, bound } => {
                write!(f, "expected fill {expected:.4} outside slippage bound {bound:.4}")
            }
        }
    }
}

/// Validate a decision against the snapshot. Closing decisions skip
/// the entry-only gates (killswitch, caps, cooldowns) so a position
/// can always be closed.
pub fn validate(
    decision: &TradeDecision,
    limits: &RiskLimits,
    snap: &RiskSnapshot<'_>,
) -> Result<(), RiskRejection> {
    let opening = !decision.closes_position;

    if opening {
        // 1. Killswitch.
        if snap.killswitch {
            return Err(RiskRejection::Killswitch);
        }
        // 2. Session trade cap (0 disables).
        if limits.max_trades_per_session > 0
            && snap.trades_this_session >= limits.max_trades_per_session
        {
            return Err(RiskRejection::SessionTradeCap {
                trades: snap.trades_this_session,
                cap: limits.max_trades_per_session,
            });
        }
        // 3. Session loss limit (0 disables).
        if limits.session_loss_limit_usd > 0.0
            && snap.realized_pnl_usd <= -limits.session_loss_limit_usd
        {
            return Err(RiskRejection::SessionLossLimit {
                realized_usd: snap.realized_pnl_usd,
                limit_usd: limits.session_loss_limit_usd,
            });
        }
        // 4. Daily loss limit across all bots (0 disables). A loss
        // exactly at the limit is still admitted; only exceeding it
        // blocks.
        if limits.daily_loss_limit_usd > 0.0
            && snap.daily_realized_pnl_usd < -limits.daily_loss_limit_usd
        {
            return Err(RiskRejection::DailyLossLimit {
                realized_usd: snap.daily_realized_pnl_usd,
                limit_usd: limits.daily_loss_limit_usd,
            });
        }
        // 5. Cooldown between opening decisions.
        if let Some(last_signal) = snap.last_signal_time_ms {
            let elapsed = (snap.now_ms - last_signal) as f64 / 1000.0;
            let cooldown = limits.cooldown_seconds as f64;
            if elapsed < cooldown {
                return Err(RiskRejection::Cooldown {
                    remaining_seconds: cooldown - elapsed,
                });
            }
        }
        // 6. Settlement delay after the last exit.
        if let Some(last_exit) = snap.last_exit_time_ms {
            let elapsed = (snap.now_ms - last_exit) as f64 / 1000.0;
            if elapsed < limits.settlement_delay_seconds {
                return Err(RiskRejection::SettlementDelay {
                    remaining_seconds: limits.settlement_delay_seconds - elapsed,
                });
            }
        }
        // 7. One position per bot.
        if snap.has_position {
            return Err(RiskRejection::PositionOpen);
        }
        // Per-bot budget cap.
        if limits.max_balance_usd > 0.0 && decision.amount_usd > limits.max_balance_usd {
            return Err(RiskRejection::BotBudgetExceeded {
                amount_usd: decision.amount_usd,
                budget_usd: limits.max_balance_usd,
            });
        }
        // 8. Balance and allowance (skipped in dry-run; the session
        // does not fetch them there).
        if !snap.dry_run {
            if let Some(balance) = snap.balance {
                if balance.balance_usd < decision.amount_usd {
                    return Err(RiskRejection::InsufficientBalance {
                        balance_usd: balance.balance_usd,
                        needed_usd: decision.amount_usd,
                    });
                }
                if balance.allowance_usd < decision.amount_usd {
                    return Err(RiskRejection::InsufficientAllowance {
                        allowance_usd: balance.allowance_usd,
                        needed_usd: decision.amount_usd,
                    });
                }
            }
        }
    }

    // 9. Order-book health, for every order we are about to send.
    let Some(book) = snap.book else {
        return Err(RiskRejection::NoLiquidity);
    };
    if book.bids.is_empty() || book.asks.is_empty() {
        return Err(RiskRejection::NoLiquidity);
    }
    let depth = book.depth_usd(decision.side, DEPTH_LEVELS);
    match decision.side {
        OrderSide::Buy => {
            if depth < limits.min_ask_liquidity_usd {
                return Err(RiskRejection::InsufficientAskLiquidity {
                    depth_usd: depth,
                    required_usd: limits.min_ask_liquidity_usd,
                });
            }
        }
        OrderSide::Sell => {
            if depth < limits.min_bid_liquidity_usd {
                return Err(RiskRejection::InsufficientBidLiquidity {
                    depth_usd: depth,
                    required_usd: limits.min_bid_liquidity_usd,
                });
            }
        }
    }
    if let Some(spread_pct) = book.spread_pct() {
        if spread_pct > limits.max_spread_pct {
            return Err(RiskRejection::SpreadTooWide {
                spread_pct,
                max_pct: limits.max_spread_pct,
            });
        }
    }

    // 10. Slippage envelope around the latest stream price.
    let reference = decision.reference_price;
    if reference > 0.0 {
        match decision.side {
            OrderSide::Buy => {
                let expected = book.best_ask().unwrap_or(reference);
                let bound = reference * (1.0 + limits.slippage_tolerance);
                if expected > bound {
                    return Err(RiskRejection::SlippageExceeded { expected, bound });
                }
            }
            OrderSide::Sell => {
                let expected = book.best_bid().unwrap_or(reference);
                let bound = reference * (1.0 - limits.slippage_tolerance);
                if expected < bound {
                    return Err(RiskRejection::SlippageExceeded { expected, bound });
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clob::BookLevel;
    use crate::types::ExitReason;

    fn limits() -> RiskLimits {
        RiskLimits {
            max_trades_per_session: 0,
            session_loss_limit_usd: 0.0,
            daily_loss_limit_usd: 0.0,
            cooldown_seconds: 30,
            settlement_delay_seconds: 2.0,
            max_balance_usd: 10.0,
            min_bid_liquidity_usd: 5.0,
            min_ask_liquidity_usd: 5.0,
            max_spread_pct: 5.0,
            slippage_tolerance: 0.06,
        }
    }

    fn healthy_book() -> OrderBook {
        let mut book = OrderBook {
            token_id: "t".into(),
            bids: vec![BookLevel { price: 0.49, size: 100.0 }],
            asks: vec![BookLevel { price: 0.51, size: 100.0 }],
            timestamp: 0,
        };
        book.normalize_levels();
        book
    }

    fn opening(amount: f64) -> TradeDecision {
        TradeDecision {
            decision_id: 1,
            side: OrderSide::Buy,
            amount_usd: amount,
            reference_price: 0.50,
            closes_position: false,
            exit_reason: None,
            reason: "test".into(),
            fallback_pricing: false,
        }
    }

    fn snapshot(book: &OrderBook) -> RiskSnapshot<'_> {
        RiskSnapshot {
            now_ms: 1_000_000,
            killswitch: false,
            trades_this_session: 0,
            realized_pnl_usd: 0.0,
            daily_realized_pnl_usd: 0.0,
            last_signal_time_ms: None,
            last_exit_time_ms: None,
            has_position: false,
            balance: Some(BalanceAllowance { balance_usd: 100.0, allowance_usd: 100.0 }),
            book: Some(book),
            dry_run: false,
        }
    }

    #[test]
    fn test_clean_decision_passes() {
        let book = healthy_book();
        assert!(validate(&opening(5.0), &limits(), &snapshot(&book)).is_ok());
    }

    #[test]
    fn test_killswitch_blocks_opens_not_closes() {
        let book = healthy_book();
        let mut snap = snapshot(&book);
        snap.killswitch = true;
        assert_eq!(
            validate(&opening(5.0), &limits(), &snap),
            Err(RiskRejection::Killswitch)
        );

        let close = TradeDecision {
            closes_position: true,
            exit_reason: Some(ExitReason::Killswitch),
            side: OrderSide::Sell,
            ..opening(5.0)
        };
        snap.has_position = true;
        assert!(validate(&close, &limits(), &snap).is_ok());
    }

    #[test]
    fn test_insufficient_balance_rejected() {
        let book = healthy_book();
        let mut snap = snapshot(&book);
        snap.balance = Some(BalanceAllowance { balance_usd: 4.99, allowance_usd: 100.0 });
        let verdict = validate(&opening(5.0), &limits(), &snap);
        assert_eq!(
            verdict.unwrap_err().rule(),
            "insufficient_balance"
        );
    }

    #[test]
    fn test_dry_run_skips_balance() {
        let book = healthy_book();
        let mut snap = snapshot(&book);
        snap.dry_run = true;
        snap.balance = None;
        assert!(validate(&opening(5.0), &limits(), &snap).is_ok());
    }

    #[test]
    fn test_cooldown_and_settlement_delay() {
        let book = healthy_book();
        let mut snap = snapshot(&book);
        snap.last_signal_time_ms = Some(snap.now_ms - 10_000);
        assert_eq!(
            validate(&opening(5.0), &limits(), &snap).unwrap_err().rule(),
            "cooldown"
        );

        snap.last_signal_time_ms = Some(snap.now_ms - 31_000);
        snap.last_exit_time_ms = Some(snap.now_ms - 1_000);
        assert_eq!(
            validate(&opening(5.0), &limits(), &snap).unwrap_err().rule(),
            "settlement_delay"
        );

        snap.last_exit_time_ms = Some(snap.now_ms - 3_000);
        assert!(validate(&opening(5.0), &limits(), &snap).is_ok());
    }

    #[test]
    fn test_empty_book_is_no_liquidity_not_a_panic() {
        let book = OrderBook::default();
        let snap = snapshot(&book);
        assert_eq!(
            validate(&opening(5.0), &limits(), &snap),
            Err(RiskRejection::NoLiquidity)
        );
    }

    #[test]
    fn test_spread_gate() {
        let mut book = healthy_book();
        book.asks[0].price = 0.60; // ~22% of bid
        let snap = snapshot(&book);
        assert_eq!(
            validate(&opening(5.0), &limits(), &snap).unwrap_err().rule(),
            "spread_too_wide"
        );
    }

    #[test]
    fn test_slippage_envelope() {
        let mut book = healthy_book();
        // Tight spread so the spread gate passes, but the ask is far
        // above the reference price the decision was made at.
        book.bids[0].price = 0.56;
        book.asks[0].price = 0.57;
        let snap = snapshot(&book);
        let d = opening(5.0); // reference 0.50, bound 0.53
        assert_eq!(
            validate(&d, &limits(), &snap).unwrap_err().rule(),
            "slippage_exceeded"
        );
    }

    #[test]
    fn test_session_caps() {
        let book = healthy_book();
        let mut l = limits();
        l.max_trades_per_session = 3;
        let mut snap = snapshot(&book);
        snap.trades_this_session = 3;
        assert_eq!(
            validate(&opening(5.0), &l, &snap).unwrap_err().rule(),
            "session_trade_cap"
        );

        let mut l = limits();
        l.session_loss_limit_usd = 10.0;
        let mut snap = snapshot(&book);
        snap.trades_this_session = 0;
        snap.realized_pnl_usd = -10.0;
        assert_eq!(
            validate(&opening(5.0), &l, &snap).unwrap_err().rule(),
            "session_loss_limit"
        );
    }

    #[test]
    fn test_daily_loss_limit_admits_at_exact_limit() {
        let book = healthy_book();
        let mut l = limits();
        l.daily_loss_limit_usd = 20.0;

        // Loss exactly at the limit still trades.
        let mut snap = snapshot(&book);
        snap.daily_realized_pnl_usd = -20.0;
        assert!(validate(&opening(5.0), &l, &snap).is_ok());

        // One cent past it does not.
        snap.daily_realized_pnl_usd = -20.01;
        assert_eq!(
            validate(&opening(5.0), &l, &snap).unwrap_err().rule(),
            "daily_loss_limit"
        );
    }

    #[test]
    fn test_verdict_is_deterministic() {
        let book = healthy_book();
        let mut snap = snapshot(&book);
        snap.killswitch = true;
        snap.trades_this_session = 99;
        snap.has_position = true;
        // Multiple failures present; the first rule in order always wins.
        for _ in 0..3 {
            assert_eq!(
                validate(&opening(5.0), &limits(), &snap),
                Err(RiskRejection::Killswitch)
            );
        }
    }

    #[test]
    fn test_budget_cap() {
        let book = healthy_book();
        let snap = snapshot(&book);
        assert_eq!(
            validate(&opening(15.0), &limits(), &snap).unwrap_err().rule(),
            "bot_budget_exceeded"
        );
    }
}
