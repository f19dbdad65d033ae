//! End-to-end trading cycle scenarios, driven tick by tick through
//! history, detection, strategy, risk validation, and execution.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{scenario_config, MockExchange};
use spikebot::clob::{ClobError, ExchangeApi, OrderFill};
use spikebot::config::{BotConfig, RebuyStrategy, StrategyMode};
use spikebot::executor::{ExecutionOutcome, OrderExecutor};
use spikebot::price::{PriceHistory, PriceSource, PriceUpdate};
use spikebot::risk::{self, RiskLimits, RiskSnapshot};
use spikebot::spike::{detect, SpikeParams};
use spikebot::strategy::StrategyEngine;
use spikebot::types::{ExitReason, PositionSide};

/// What one tick produced.
#[derive(Debug)]
enum TickResult {
    Quiet,
    Rejected(String),
    Filled(OrderFill),
    ExecutionFailed,
}

/// Minimal decision loop: the same pipeline a session runs, without
/// the async plumbing, so scenarios stay exact and fast.
struct Harness {
    cfg: BotConfig,
    engine: StrategyEngine,
    executor: OrderExecutor,
    exchange: Arc<MockExchange>,
    history: PriceHistory,
    last_signal_time_ms: Option<i64>,
    last_exit_time_ms: Option<i64>,
    trades_this_session: u32,
    realized_pnl_usd: f64,
    last_close: Option<(f64, f64, ExitReason)>,
}

impl Harness {
    fn new(cfg: BotConfig, exchange: Arc<MockExchange>) -> Self {
        Self {
            engine: StrategyEngine::new(cfg.clone()),
            executor: OrderExecutor::new(exchange.clone(), "tok".into(), cfg.dry_run),
            exchange,
            history: PriceHistory::new(cfg.price_history_size),
            cfg,
            last_signal_time_ms: None,
            last_exit_time_ms: None,
            trades_this_session: 0,
            realized_pnl_usd: 0.0,
            last_close: None,
        }
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

    async fn tick(&mut self, ts_ms: i64, price: f64) -> TickResult {
        self.history.append(ts_ms, price);
        let report = detect(&self.history, ts_ms, price, &self.spike_params());
        let update = PriceUpdate {
            seq: ts_ms as u64,
            ts_ms,
            price,
            best_bid: Some(price - 0.005),
            best_ask: Some(price + 0.005),
            source: PriceSource::Stream,
            fallback_pricing: false,
        };

        let Some(decision) = self.engine.on_price(&update, &report, ts_ms) else {
            return TickResult::Quiet;
        };

        let balance = if self.cfg.dry_run {
            None
        } else {
            self.exchange.get_balance_allowance().await.ok()
        };
        let book = self.exchange.get_order_book("tok").await.ok();
        let limits = RiskLimits {
            max_trades_per_session: self.cfg.max_trades_per_session,
            session_loss_limit_usd: self.cfg.session_loss_limit_usd,
            daily_loss_limit_usd: 0.0,
            cooldown_seconds: self.cfg.cooldown_seconds,
            settlement_delay_seconds: self.cfg.settlement_delay_seconds,
            max_balance_usd: self.cfg.max_balance_usd,
            min_bid_liquidity_usd: self.cfg.min_bid_liquidity_usd,
            min_ask_liquidity_usd: self.cfg.min_ask_liquidity_usd,
            max_spread_pct: 5.0,
            slippage_tolerance: 0.06,
        };
        let snapshot = RiskSnapshot {
            now_ms: ts_ms,
            killswitch: false,
            trades_this_session: self.trades_this_session,
            realized_pnl_usd: self.realized_pnl_usd,
            daily_realized_pnl_usd: 0.0,
            last_signal_time_ms: self.last_signal_time_ms,
            last_exit_time_ms: self.last_exit_time_ms,
            has_position: self.engine.position().is_some(),
            balance,
            book: book.as_ref(),
            dry_run: self.cfg.dry_run,
        };
        if let Err(rejection) = risk::validate(&decision, &limits, &snapshot) {
            self.engine.on_decision_failed(&decision);
            return TickResult::Rejected(rejection.rule().to_string());
        }

        match self.executor.execute(&decision, 0.06).await {
            ExecutionOutcome::Filled(fill) => {
                if decision.closes_position {
                    let (_, pnl, reason) = self
                        .engine
                        .on_close_fill(fill.fill_price, ts_ms)
                        .expect("close fill with a position");
                    self.realized_pnl_usd += pnl.pnl_usd;
                    self.last_exit_time_ms = Some(ts_ms);
                    self.last_close = Some((pnl.pnl_usd, pnl.pnl_pct, reason));
                } else {
                    self.engine.on_open_fill(
                        &decision,
                        fill.fill_price,
                        Some(fill.order_id.clone()),
                        ts_ms,
                    );
                    self.last_signal_time_ms = Some(ts_ms);
                    self.trades_this_session += 1;
                }
                TickResult::Filled(fill)
            }
            ExecutionOutcome::Duplicate => TickResult::Quiet,
            _ => {
                self.engine.on_decision_failed(&decision);
                TickResult::ExecutionFailed
            }
        }
    }
}

#[tokio::test]
async fn downward_spike_fade_hits_take_profit() {
    let exchange = MockExchange::new(vec![0.5]);
    let mut harness = Harness::new(scenario_config(StrategyMode::SpikeFade), exchange.clone());

    assert!(matches!(harness.tick(0, 0.500).await, TickResult::Quiet));
    assert!(matches!(harness.tick(30_000, 0.500).await, TickResult::Quiet));
    assert!(matches!(harness.tick(600_000, 0.500).await, TickResult::Quiet));

    // -3.6% over the 600s window: long entry at 0.482.
    let entry = harness.tick(601_000, 0.482).await;
    let TickResult::Filled(fill) = entry else {
        panic!("expected entry fill, got {entry:?}");
    };
    assert!(fill.simulated);
    assert_eq!(fill.fill_price, 0.482);

    let position = harness.engine.position().expect("position open");
    assert_eq!(position.side, PositionSide::Long);
    assert!((position.shares - 10.373).abs() < 0.001);
    assert!((position.take_profit_price - 0.5061).abs() < 0.0001);

    // Take profit hit at 0.5065.
    let exit = harness.tick(610_000, 0.5065).await;
    assert!(matches!(exit, TickResult::Filled(_)), "got {exit:?}");
    assert!(harness.engine.position().is_none());

    let (pnl_usd, pnl_pct, reason) = harness.last_close.expect("close recorded");
    assert_eq!(reason, ExitReason::TakeProfit);
    assert!((pnl_pct - 5.08).abs() < 0.01, "pnl_pct {pnl_pct:.3}");
    assert!((pnl_usd - 0.254).abs() < 0.001, "pnl_usd {pnl_usd:.4}");

    // P&L conservation: realized equals the single trade's P&L exactly.
    assert_eq!(harness.realized_pnl_usd, pnl_usd);
    // Dry-run never reaches the exchange's order endpoint.
    assert_eq!(exchange.place_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn upward_spike_fade_hits_stop_loss() {
    let exchange = MockExchange::new(vec![0.6]);
    let mut harness = Harness::new(scenario_config(StrategyMode::SpikeFade), exchange);

    harness.tick(0, 0.600).await;
    harness.tick(300_000, 0.600).await;
    harness.tick(600_000, 0.600).await;

    // +4.17%: short entry at 0.625.
    let entry = harness.tick(610_000, 0.625).await;
    assert!(matches!(entry, TickResult::Filled(_)), "got {entry:?}");
    let position = harness.engine.position().expect("short open");
    assert_eq!(position.side, PositionSide::Short);
    assert!((position.stop_loss_price - 0.64375).abs() < 1e-9);

    // Price keeps climbing through the stop.
    let exit = harness.tick(650_000, 0.645).await;
    assert!(matches!(exit, TickResult::Filled(_)), "got {exit:?}");

    let (pnl_usd, pnl_pct, reason) = harness.last_close.expect("close recorded");
    assert_eq!(reason, ExitReason::StopLoss);
    assert!((pnl_pct - (-3.2)).abs() < 0.15, "pnl_pct {pnl_pct:.3}");
    assert!(pnl_usd < 0.0);
}

#[tokio::test]
async fn train_of_trade_immediate_rebuy_respects_settlement_delay() {
    let mut cfg = scenario_config(StrategyMode::TrainOfTrade);
    cfg.rebuy_strategy = RebuyStrategy::Immediate;
    cfg.rebuy_delay_seconds = 2.0;
    let exchange = MockExchange::new(vec![0.5]);
    let mut harness = Harness::new(cfg, exchange);

    // Warmup arms the initial buy target 3% below 0.515.
    harness.tick(1_000, 0.515).await;
    let target = harness.engine.target().expect("initial target").clone();
    assert!((target.price - 0.515 * 0.97).abs() < 1e-9);

    // Entry when the target trips.
    let entry = harness.tick(10_000, 0.4995).await;
    assert!(matches!(entry, TickResult::Filled(_)), "got {entry:?}");
    let sell_target = harness.engine.target().expect("sell target").clone();
    assert!((sell_target.price - 0.4995 * 1.05).abs() < 1e-9);

    // Take profit exit; rebuy target lands at the exit price.
    let exit = harness.tick(60_000, 0.525).await;
    assert!(matches!(exit, TickResult::Filled(_)), "got {exit:?}");
    let rebuy = harness.engine.target().expect("rebuy target").clone();
    assert!((rebuy.price - 0.525).abs() < 1e-9);

    // One second after the exit the settlement dwell still holds.
    assert!(matches!(
        harness.tick(61_000, 0.520).await,
        TickResult::Quiet
    ));
    assert!(harness.engine.position().is_none());

    // Three seconds after, the rebuy fires.
    let rebuy_fill = harness.tick(63_000, 0.520).await;
    let TickResult::Filled(fill) = rebuy_fill else {
        panic!("expected rebuy fill, got {rebuy_fill:?}");
    };
    assert_eq!(fill.fill_price, 0.520);
    assert!(harness.engine.position().is_some());
}

#[tokio::test]
async fn volatility_gate_suppresses_entry() {
    let mut cfg = scenario_config(StrategyMode::SpikeFade);
    cfg.max_volatility_cv = 5.0;
    let exchange = MockExchange::new(vec![0.5]);
    let mut harness = Harness::new(cfg.clone(), exchange);

    // Noisy sawtooth: the window moves 8% but CV blows the gate.
    for i in 0..120 {
        let price = if i % 2 == 0 { 0.40 } else { 0.60 };
        harness.tick(i * 5_000, price).await;
    }
    let result = harness.tick(600_001, 0.54).await;
    assert!(matches!(result, TickResult::Quiet), "got {result:?}");
    assert!(harness.engine.position().is_none());

    let report = detect(
        &harness.history,
        600_001,
        0.54,
        &SpikeParams {
            windows_seconds: cfg.spike_windows_seconds.clone(),
            threshold_pct: cfg.spike_threshold_pct,
            min_strength_pct: 0.0,
            use_volatility_filter: true,
            max_volatility_cv: cfg.max_volatility_cv,
        },
    );
    assert!(report.is_volatility_filtered);
    assert!(!report.is_spike);
}

#[tokio::test]
async fn insufficient_balance_blocks_live_entry() {
    let mut cfg = scenario_config(StrategyMode::SpikeFade);
    cfg.dry_run = false;
    let exchange = MockExchange::new(vec![0.5]);
    exchange.set_balance(4.99, 100.0);
    let mut harness = Harness::new(cfg, exchange.clone());

    harness.tick(0, 0.500).await;
    harness.tick(600_000, 0.500).await;

    let result = harness.tick(601_000, 0.482).await;
    let TickResult::Rejected(rule) = result else {
        panic!("expected pre-check rejection, got {result:?}");
    };
    assert_eq!(rule, "insufficient_balance");
    assert!(harness.engine.position().is_none());
    assert_eq!(exchange.place_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_error_then_fill_creates_one_position() {
    let mut cfg = scenario_config(StrategyMode::SpikeFade);
    cfg.dry_run = false;
    let exchange = MockExchange::new(vec![0.5]);
    exchange.push_order_result(Err(ClobError::Timeout));
    exchange.push_order_result(Ok(OrderFill {
        order_id: "oid-7".into(),
        fill_price: 0.501,
        fill_shares: 9.98,
        simulated: false,
    }));
    let mut harness = Harness::new(cfg, exchange.clone());

    harness.tick(0, 0.520).await;
    harness.tick(600_000, 0.520).await;

    let result = harness.tick(601_000, 0.501).await;
    let TickResult::Filled(fill) = result else {
        panic!("expected fill after retry, got {result:?}");
    };
    assert_eq!(fill.order_id, "oid-7");

    let position = harness.engine.position().expect("exactly one position");
    assert_eq!(position.entry_price, 0.501);
    assert_eq!(exchange.place_calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.trades_this_session, 1);
}
