//! Order execution with retry and idempotency.
//!
//! Wraps the exchange's order placement: transient errors are retried
//! with exponential backoff, permanent rejections stop immediately,
//! and each `decision_id` is submitted at most once no matter how many
//! times the executor is invoked with it. In dry-run mode no exchange
//! call is ever made; a fill is synthesized at the decision's
//! reference price.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::clob::{ClobError, ExchangeApi, OrderFill};
use crate::strategy::TradeDecision;
use crate::types::OrderSide;

/// Backoff before retry k (transient errors only).
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(250),
    Duration::from_millis(500),
    Duration::from_millis(1000),
];
/// Total attempts including the first.
const MAX_ATTEMPTS: usize = 4;

/// Result of driving one decision to completion.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Filled(OrderFill),
    /// Permanent rejection; never retried.
    Rejected {
        reason_code: &'static str,
        message: String,
    },
    /// Every attempt failed with a transient error.
    TransientFailure { message: String, attempts: u32 },
    /// This decision_id was already acted on; nothing was submitted.
    Duplicate,
}

pub struct OrderExecutor {
    exchange: Arc<dyn ExchangeApi>,
    token_id: String,
    dry_run: bool,
    /// Highest decision id already acted on.
    last_decision_id: u64,
}

impl OrderExecutor {
    pub fn new(exchange: Arc<dyn ExchangeApi>, token_id: String, dry_run: bool) -> Self {
        Self {
            exchange,
            token_id,
            dry_run,
            last_decision_id: 0,
        }
    }

    /// Marketable limit for a FOK order: reference shifted by the
    /// slippage tolerance in the crossing direction.
    fn limit_price(decision: &TradeDecision, slippage_tolerance: f64) -> f64 {
        let shifted = match decision.side {
            OrderSide::Buy => decision.reference_price * (1.0 + slippage_tolerance),
            OrderSide::Sell => decision.reference_price * (1.0 - slippage_tolerance),
        };
        shifted.clamp(0.001, 0.999)
    }

    /// Execute a decision. Safe to call twice with the same decision:
    /// the second call is a no-op.
    pub async fn execute(
        &mut self,
        decision: &TradeDecision,
        slippage_tolerance: f64,
    ) -> ExecutionOutcome {
        if decision.decision_id <= self.last_decision_id {
            warn!(
                decision_id = decision.decision_id,
                "duplicate decision dropped"
            );
            return ExecutionOutcome::Duplicate;
        }
        // Claim the id before submitting so a re-entry cannot double-send.
        self.last_decision_id = decision.decision_id;

        if self.dry_run {
            let fill = OrderFill {
                order_id: format!("dry_{}", decision.decision_id),
                fill_price: decision.reference_price,
                fill_shares: decision.amount_usd / decision.reference_price,
                simulated: true,
            };
            info!(
                side = %decision.side,
                amount = decision.amount_usd,
                price = fill.fill_price,
                "dry-run fill synthesized"
            );
            return ExecutionOutcome::Filled(fill);
        }

        let limit = Self::limit_price(decision, slippage_tolerance);
        let mut last_error: Option<ClobError> = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = RETRY_BACKOFF[(attempt - 1).min(RETRY_BACKOFF.len() - 1)];
                tokio::time::sleep(backoff).await;
            }
            match self
                .exchange
                .place_order(&self.token_id, decision.side, decision.amount_usd, limit)
                .await
            {
                Ok(fill) => {
                    info!(
                        order_id = %fill.order_id,
                        fill_price = fill.fill_price,
                        attempt = attempt + 1,
                        "order filled"
                    );
                    return ExecutionOutcome::Filled(fill);
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        attempt = attempt + 1,
                        max = MAX_ATTEMPTS,
                        error = %e,
                        "transient order failure"
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    warn!(error = %e, "order permanently rejected");
                    return ExecutionOutcome::Rejected {
                        reason_code: e.reason_code(),
                        message: e.to_string(),
                    };
                }
            }
        }

        ExecutionOutcome::TransientFailure {
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            attempts: MAX_ATTEMPTS as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use crate::clob::{BalanceAllowance, MarketInfo, OrderBook};

    struct MockExchange {
        results: Mutex<VecDeque<Result<OrderFill, ClobError>>>,
        calls: AtomicU32,
    }

    impl MockExchange {
        fn with(results: Vec<Result<OrderFill, ClobError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExchangeApi for MockExchange {
        async fn resolve_token_id(&self, _: &str, _: usize) -> Result<String, ClobError> {
            Ok("tok".into())
        }
        async fn get_order_book(&self, _: &str) -> Result<OrderBook, ClobError> {
            Ok(OrderBook::default())
        }
        async fn get_market_price(&self, _: &str) -> Result<f64, ClobError> {
            Ok(0.5)
        }
        async fn get_market_info(&self, _: &str) -> Result<MarketInfo, ClobError> {
            Ok(MarketInfo::default())
        }
        async fn get_balance_allowance(&self) -> Result<BalanceAllowance, ClobError> {
            Ok(BalanceAllowance::default())
        }
        async fn place_order(
            &self,
            _: &str,
            _: OrderSide,
            _: f64,
            _: f64,
        ) -> Result<OrderFill, ClobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ClobError::Timeout))
        }
    }

    fn decision(id: u64) -> TradeDecision {
        TradeDecision {
            decision_id: id,
            side: OrderSide::Buy,
            amount_usd: 5.0,
            reference_price: 0.5,
            closes_position: false,
            exit_reason: None,
            reason: "test".into(),
            fallback_pricing: false,
        }
    }

    fn fill(price: f64, shares: f64) -> OrderFill {
        OrderFill {
            order_id: "oid-1".into(),
            fill_price: price,
            fill_shares: shares,
            simulated: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_fill() {
        let mock = MockExchange::with(vec![Err(ClobError::Timeout), Ok(fill(0.501, 9.98))]);
        let mut exec = OrderExecutor::new(mock.clone(), "tok".into(), false);

        match exec.execute(&decision(1), 0.06).await {
            ExecutionOutcome::Filled(f) => {
                assert_eq!(f.fill_price, 0.501);
                assert_eq!(f.order_id, "oid-1");
            }
            other => panic!("expected fill, got {other:?}"),
        }
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_permanent_rejection_stops_immediately() {
        let mock = MockExchange::with(vec![Err(ClobError::InsufficientBalance("poor".into()))]);
        let mut exec = OrderExecutor::new(mock.clone(), "tok".into(), false);

        match exec.execute(&decision(1), 0.06).await {
            ExecutionOutcome::Rejected { reason_code, .. } => {
                assert_eq!(reason_code, "insufficient_balance");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(mock.call_count(), 1, "permanent errors must not retry");
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_transient_gives_up_after_four() {
        let mock = MockExchange::with(vec![
            Err(ClobError::Timeout),
            Err(ClobError::Timeout),
            Err(ClobError::Timeout),
            Err(ClobError::Timeout),
        ]);
        let mut exec = OrderExecutor::new(mock.clone(), "tok".into(), false);

        match exec.execute(&decision(1), 0.06).await {
            ExecutionOutcome::TransientFailure { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("expected transient failure, got {other:?}"),
        }
        assert_eq!(mock.call_count(), 4);
    }

    #[tokio::test]
    async fn test_duplicate_decision_is_noop() {
        let mock = MockExchange::with(vec![Ok(fill(0.5, 10.0)), Ok(fill(0.5, 10.0))]);
        let mut exec = OrderExecutor::new(mock.clone(), "tok".into(), false);

        assert!(matches!(
            exec.execute(&decision(1), 0.06).await,
            ExecutionOutcome::Filled(_)
        ));
        assert!(matches!(
            exec.execute(&decision(1), 0.06).await,
            ExecutionOutcome::Duplicate
        ));
        assert_eq!(mock.call_count(), 1, "same decision_id must submit once");
    }

    #[tokio::test]
    async fn test_dry_run_never_touches_exchange() {
        let mock = MockExchange::with(vec![]);
        let mut exec = OrderExecutor::new(mock.clone(), "tok".into(), true);

        match exec.execute(&decision(1), 0.06).await {
            ExecutionOutcome::Filled(f) => {
                assert!(f.simulated);
                assert_eq!(f.fill_price, 0.5);
                assert!((f.fill_shares - 10.0).abs() < 1e-9);
            }
            other => panic!("expected simulated fill, got {other:?}"),
        }
        assert_eq!(mock.call_count(), 0);
    }

    #[test]
    fn test_limit_price_shifts_with_side() {
        let buy = decision(1);
        assert!((OrderExecutor::limit_price(&buy, 0.06) - 0.53).abs() < 1e-9);
        let sell = TradeDecision { side: OrderSide::Sell, ..decision(2) };
        assert!((OrderExecutor::limit_price(&sell, 0.06) - 0.47).abs() < 1e-9);
    }
}
