//! Exchange client adapter.
//!
//! The only boundary that speaks the exchange wire protocol: REST
//! (`rest`), the market/user streams (`websocket`), and order signing
//! (`signing`). Everything above this module works against the
//! [`ExchangeApi`] trait so tests can swap in a mock exchange.

pub mod rest;
pub mod signing;
pub mod types;
pub mod websocket;

pub use rest::RestClient;
pub use signing::{ApiCreds, OrderSigner};
pub use types::{
    BalanceAllowance, BookLevel, ClobError, MarketEvent, MarketInfo, OrderBook, OrderEvent,
    OrderFill,
};
pub use websocket::{spawn_market_stream, spawn_user_stream, StreamConfig};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::types::OrderSide;

/// Narrow exchange interface used by the trading engine.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn resolve_token_id(&self, slug: &str, outcome_index: usize)
        -> Result<String, ClobError>;

    async fn get_order_book(&self, token_id: &str) -> Result<OrderBook, ClobError>;

    async fn get_market_price(&self, token_id: &str) -> Result<f64, ClobError>;

    async fn get_market_info(&self, slug: &str) -> Result<MarketInfo, ClobError>;

    /// Wallet collateral of this client's bound wallet.
    async fn get_balance_allowance(&self) -> Result<BalanceAllowance, ClobError>;

    /// Submit a FOK market order at `limit_price` for `amount_usd`.
    async fn place_order(
        &self,
        token_id: &str,
        side: OrderSide,
        amount_usd: f64,
        limit_price: f64,
    ) -> Result<OrderFill, ClobError>;
}

/// Production exchange client: shared REST transport plus this bot's
/// order signer. API credentials are derived lazily on first
/// authenticated call and cached.
///
/// The signer is optional so dry-run bots can run market-data-only
/// without a usable wallet; authenticated calls then fail with
/// `NotConfigured`.
pub struct ClobClient {
    rest: Arc<RestClient>,
    signer: Option<OrderSigner>,
    creds: Mutex<Option<ApiCreds>>,
}

impl ClobClient {
    pub fn new(rest: Arc<RestClient>, signer: Option<OrderSigner>) -> Self {
        Self {
            rest,
            signer,
            creds: Mutex::new(None),
        }
    }

    pub fn wallet_address(&self) -> Option<String> {
        self.signer
            .as_ref()
            .map(|s| format!("{:#x}", s.maker_address()))
    }

    fn signer(&self) -> Result<&OrderSigner, ClobError> {
        self.signer
            .as_ref()
            .ok_or_else(|| ClobError::NotConfigured("no wallet signer".to_string()))
    }

    async fn ensure_creds(&self) -> Result<ApiCreds, ClobError> {
        let mut guard = self.creds.lock().await;
        if let Some(creds) = guard.as_ref() {
            return Ok(creds.clone());
        }
        let creds = self.rest.derive_api_creds(self.signer()?).await?;
        *guard = Some(creds.clone());
        Ok(creds)
    }

    /// Credentials for the optional user stream.
    pub async fn user_stream_creds(&self) -> Result<ApiCreds, ClobError> {
        self.ensure_creds().await
    }
}

#[async_trait]
impl ExchangeApi for ClobClient {
    async fn resolve_token_id(
        &self,
        slug: &str,
        outcome_index: usize,
    ) -> Result<String, ClobError> {
        self.rest.resolve_token_id(slug, outcome_index).await
    }

    async fn get_order_book(&self, token_id: &str) -> Result<OrderBook, ClobError> {
        self.rest.get_order_book(token_id).await
    }

    async fn get_market_price(&self, token_id: &str) -> Result<f64, ClobError> {
        self.rest.get_market_price(token_id).await
    }

    async fn get_market_info(&self, slug: &str) -> Result<MarketInfo, ClobError> {
        self.rest.get_market_info(slug).await
    }

    async fn get_balance_allowance(&self) -> Result<BalanceAllowance, ClobError> {
        let creds = self.ensure_creds().await?;
        self.rest.get_balance_allowance(self.signer()?, &creds).await
    }

    async fn place_order(
        &self,
        token_id: &str,
        side: OrderSide,
        amount_usd: f64,
        limit_price: f64,
    ) -> Result<OrderFill, ClobError> {
        let creds = self.ensure_creds().await?;
        let signer = self.signer()?;
        let order_body = signer
            .sign_market_order(token_id, side, amount_usd, limit_price)
            .await
            .map_err(|e| ClobError::InvalidSignature(e.to_string()))?;
        self.rest
            .post_order(signer, &creds, order_body, limit_price, amount_usd, side)
            .await
    }
}
