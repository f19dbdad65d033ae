//! CLOB data types and the exchange error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::OrderSide;

/// One price level of an order book side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    /// Size in shares.
    pub size: f64,
}

impl BookLevel {
    /// USD notional resting at this level.
    pub fn notional_usd(&self) -> f64 {
        self.price * self.size
    }
}

/// Aggregated order book for one outcome token, best price first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub token_id: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl OrderBook {
    /// Sort both sides best-first and drop non-positive levels.
    pub fn normalize_levels(&mut self) {
        self.bids.retain(|l| l.price > 0.0 && l.size > 0.0);
        self.asks.retain(|l| l.price > 0.0 && l.size > 0.0);
        self.bids
            .sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        self.asks
            .sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    /// Spread as a percentage of best bid; None when a side is empty.
    pub fn spread_pct(&self) -> Option<f64> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        if bid <= 0.0 {
            return None;
        }
        Some((ask - bid) / bid * 100.0)
    }

    /// USD depth resting on the side that would fill an order of
    /// `side`, summed over the top `levels` levels.
    pub fn depth_usd(&self, side: OrderSide, levels: usize) -> f64 {
        let book_side = match side {
            OrderSide::Buy => &self.asks,
            OrderSide::Sell => &self.bids,
        };
        book_side.iter().take(levels).map(BookLevel::notional_usd).sum()
    }

    pub fn truncated(&self, depth: usize) -> OrderBook {
        OrderBook {
            token_id: self.token_id.clone(),
            bids: self.bids.iter().copied().take(depth).collect(),
            asks: self.asks.iter().copied().take(depth).collect(),
            timestamp: self.timestamp,
        }
    }
}

/// Events from the market channel of the exchange stream.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Book(OrderBook),
    /// Top-of-book moved without a full snapshot.
    PriceChange {
        token_id: String,
        best_bid: Option<f64>,
        best_ask: Option<f64>,
        ts_ms: i64,
    },
    LastTrade {
        token_id: String,
        price: f64,
        ts_ms: i64,
    },
}

/// Events from the authenticated user channel (fill confirmations).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order_id: String,
    pub status: String,
    pub filled_size: Option<f64>,
    pub avg_fill_price: Option<f64>,
    pub ts_ms: i64,
}

/// A confirmed fill returned by order placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub fill_price: f64,
    pub fill_shares: f64,
    /// True when synthesized in dry-run mode.
    pub simulated: bool,
}

/// Market metadata from the gamma API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketInfo {
    pub question: String,
    pub active: bool,
    pub closed: bool,
    #[serde(default)]
    pub outcome: Option<String>,
}

impl MarketInfo {
    /// Dashboard-facing status string.
    pub fn status(&self) -> &'static str {
        if self.closed {
            "closed"
        } else if self.outcome.is_some() {
            "resolved"
        } else if self.active {
            "active"
        } else {
            "inactive"
        }
    }
}

/// Wallet collateral state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BalanceAllowance {
    pub balance_usd: f64,
    pub allowance_usd: f64,
}

/// Everything that can go wrong talking to the exchange.
///
/// Only [`ClobError::is_transient`] errors are retried by the order
/// executor; permanent errors drop the decision immediately.
#[derive(Debug, Error)]
pub enum ClobError {
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("insufficient allowance: {0}")]
    InsufficientAllowance(String),

    #[error("market closed")]
    MarketClosed,

    #[error("no orderbook for token")]
    NoOrderbook,

    #[error("no price available")]
    NoPrice,

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("market not found: {0}")]
    MarketNotFound(String),

    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("exchange returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    Ws(String),

    #[error("request timed out")]
    Timeout,

    #[error("bad response payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClobError {
    /// Transient errors are worth retrying; everything else is final.
    pub fn is_transient(&self) -> bool {
        match self {
            ClobError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ClobError::Timeout | ClobError::Ws(_) => true,
            ClobError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Short machine-readable reason code for activities and API errors.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ClobError::InsufficientBalance(_) => "insufficient_balance",
            ClobError::InsufficientAllowance(_) => "insufficient_allowance",
            ClobError::MarketClosed => "market_closed",
            ClobError::NoOrderbook => "no_orderbook",
            ClobError::NoPrice => "no_price",
            ClobError::InvalidSignature(_) => "invalid_signature",
            ClobError::Rejected(_) => "rejected",
            ClobError::MarketNotFound(_) => "market_not_found",
            ClobError::NotConfigured(_) => "not_configured",
            ClobError::Api { .. } => "api_error",
            ClobError::Http(_) => "http_error",
            ClobError::Ws(_) => "ws_error",
            ClobError::Timeout => "timeout",
            ClobError::Json(_) => "bad_payload",
        }
    }

    /// Map an exchange rejection message onto the permanent error
    /// variants the executor cares about.
    pub fn from_rejection(message: &str) -> ClobError {
        let lower = message.to_lowercase();
        if lower.contains("allowance") {
            ClobError::InsufficientAllowance(message.to_string())
        } else if lower.contains("balance") {
            ClobError::InsufficientBalance(message.to_string())
        } else if lower.contains("closed") {
            ClobError::MarketClosed
        } else if lower.contains("signature") {
            ClobError::InvalidSignature(message.to_string())
        } else {
            ClobError::Rejected(message.to_string())
        }
    }
}
