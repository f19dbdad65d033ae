//! Shared test fixtures: a scripted mock exchange and config helpers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use spikebot::clob::{
    BalanceAllowance, BookLevel, ClobError, ExchangeApi, MarketInfo, OrderBook, OrderFill,
};
use spikebot::config::{BotConfig, SealedSecret, StrategyMode};
use spikebot::types::OrderSide;

/// Scripted exchange double. Prices are served from a queue (the last
/// one repeats forever); order results are served from their own
/// queue; the book tracks the current price with deep liquidity unless
/// told otherwise.
pub struct MockExchange {
    prices: Mutex<VecDeque<f64>>,
    last_price: Mutex<f64>,
    pub order_results: Mutex<VecDeque<Result<OrderFill, ClobError>>>,
    pub balance: Mutex<BalanceAllowance>,
    pub book_depth_shares: Mutex<f64>,
    pub place_calls: AtomicU32,
    pub price_calls: AtomicU32,
}

impl MockExchange {
    pub fn new(prices: Vec<f64>) -> Arc<Self> {
        let last = prices.first().copied().unwrap_or(0.5);
        Arc::new(Self {
            prices: Mutex::new(prices.into()),
            last_price: Mutex::new(last),
            order_results: Mutex::new(VecDeque::new()),
            balance: Mutex::new(BalanceAllowance {
                balance_usd: 100.0,
                allowance_usd: 100.0,
            }),
            book_depth_shares: Mutex::new(1000.0),
            place_calls: AtomicU32::new(0),
            price_calls: AtomicU32::new(0),
        })
    }

    pub fn push_order_result(&self, result: Result<OrderFill, ClobError>) {
        self.order_results.lock().unwrap().push_back(result);
    }

    pub fn set_balance(&self, balance_usd: f64, allowance_usd: f64) {
        *self.balance.lock().unwrap() = BalanceAllowance {
            balance_usd,
            allowance_usd,
        };
    }

    pub fn current_price(&self) -> f64 {
        *self.last_price.lock().unwrap()
    }

    /// Healthy tight two-sided book around `price` (spread well under
    /// the default 1% gate).
    pub fn book_at(&self, price: f64) -> OrderBook {
        let size = *self.book_depth_shares.lock().unwrap();
        let mut book = OrderBook {
            token_id: "tok".into(),
            bids: vec![BookLevel {
                price: (price - 0.002).max(0.001),
                size,
            }],
            asks: vec![BookLevel {
                price: (price + 0.002).min(0.999),
                size,
            }],
            timestamp: 0,
        };
        book.normalize_levels();
        book
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn resolve_token_id(&self, _: &str, _: usize) -> Result<String, ClobError> {
        Ok("tok".into())
    }

    async fn get_order_book(&self, _: &str) -> Result<OrderBook, ClobError> {
        Ok(self.book_at(self.current_price()))
    }

    async fn get_market_price(&self, _: &str) -> Result<f64, ClobError> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        let mut prices = self.prices.lock().unwrap();
        let price = if prices.len() > 1 {
            prices.pop_front().unwrap()
        } else {
            prices.front().copied().unwrap_or(0.5)
        };
        *self.last_price.lock().unwrap() = price;
        Ok(price)
    }

    async fn get_market_info(&self, _: &str) -> Result<MarketInfo, ClobError> {
        Ok(MarketInfo {
            question: "Will it settle YES?".into(),
            active: true,
            closed: false,
            outcome: None,
        })
    }

    async fn get_balance_allowance(&self) -> Result<BalanceAllowance, ClobError> {
        Ok(*self.balance.lock().unwrap())
    }

    async fn place_order(
        &self,
        _: &str,
        _: OrderSide,
        _: f64,
        _: f64,
    ) -> Result<OrderFill, ClobError> {
        self.place_calls.fetch_add(1, Ordering::SeqCst);
        self.order_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ClobError::Rejected("no scripted result".into())))
    }
}

/// Config matching the common test setup: one 600s window, 3% spike
/// threshold, 5% take profit, 3% stop loss, $5 notional, dry-run.
pub fn scenario_config(mode: StrategyMode) -> BotConfig {
    let mut cfg = BotConfig::new("scenario-bot", SealedSecret("enc:dGVzdA==".into()));
    cfg.token_id = Some("tok".into());
    cfg.strategy_mode = mode;
    cfg.spike_threshold_pct = 3.0;
    cfg.min_spike_strength = 0.0;
    cfg.spike_windows_seconds = vec![600];
    cfg.use_volatility_filter = true;
    cfg.max_volatility_cv = 10.0;
    cfg.take_profit_pct = 5.0;
    cfg.stop_loss_pct = 3.0;
    cfg.max_hold_seconds = 3600;
    cfg.cooldown_seconds = 30;
    cfg.settlement_delay_seconds = 2.0;
    cfg.trade_size_usd = 5.0;
    cfg.max_balance_usd = 10.0;
    cfg.dry_run = true;
    cfg
}

/// Unique temp data directory for store-backed tests.
pub struct TempDataDir(std::path::PathBuf);

impl TempDataDir {
    pub fn new() -> Self {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "spikebot-test-{}-{:x}",
            std::process::id(),
            rand::random::<u64>()
        ));
        std::fs::create_dir_all(&path).unwrap();
        Self(path)
    }

    pub fn path(&self) -> &std::path::Path {
        &self.0
    }
}

impl Drop for TempDataDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}
