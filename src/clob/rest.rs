//! CLOB REST client.
//!
//! Speaks the exchange's public endpoints (book, pricing, market
//! metadata) and the L2-authenticated endpoints (balances, orders).
//! This module plus `websocket.rs` are the only places that touch the
//! exchange wire format.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::signing::{self, ApiCreds, OrderSigner};
use super::types::{BalanceAllowance, BookLevel, ClobError, MarketInfo, OrderBook, OrderFill};
use crate::types::OrderSide;

/// Hard timeout for any single exchange request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Token-id and market-info cache TTL.
const RESOLVE_CACHE_TTL: Duration = Duration::from_secs(300);
/// Displayed price uses the midpoint while the spread is at most this.
const MAX_SPREAD_FOR_MIDPOINT: f64 = 0.10;
/// On-chain collateral amounts are 6-decimal fixed point.
const COLLATERAL_SCALE: f64 = 1_000_000.0;

fn parse_level(price: &str, size: &str) -> Option<BookLevel> {
    let price = price.parse::<f64>().ok()?;
    let size = size.parse::<f64>().ok()?;
    if !price.is_finite() || !size.is_finite() || price <= 0.0 || size <= 0.0 {
        return None;
    }
    Some(BookLevel { price, size })
}

fn parse_side(raw: Option<&Value>) -> Vec<BookLevel> {
    raw.and_then(Value::as_array)
        .map(|levels| {
            levels
                .iter()
                .filter_map(|l| {
                    let price = l.get("price").and_then(Value::as_str)?;
                    let size = l.get("size").and_then(Value::as_str)?;
                    parse_level(price, size)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// REST API client, shared by all bots (per-wallet state is passed in
/// per call).
pub struct RestClient {
    client: Client,
    clob_host: String,
    gamma_host: String,
    token_cache: Mutex<HashMap<String, (Instant, String)>>,
    market_info_cache: Mutex<HashMap<String, (Instant, MarketInfo)>>,
}

impl RestClient {
    pub fn new(clob_host: &str, gamma_host: &str) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            clob_host: clob_host.trim_end_matches('/').to_string(),
            gamma_host: gamma_host.trim_end_matches('/').to_string(),
            token_cache: Mutex::new(HashMap::new()),
            market_info_cache: Mutex::new(HashMap::new()),
        }
    }

    async fn get_json(&self, url: &str) -> Result<Value, ClobError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ClobError::Api {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp.json::<Value>().await?)
    }

    /// Fetch the event for `slug` from the gamma API.
    async fn fetch_event(&self, slug: &str) -> Result<Value, ClobError> {
        let url = format!("{}/events?slug={slug}", self.gamma_host);
        let data = self.get_json(&url).await?;
        data.as_array()
            .and_then(|a| a.first().cloned())
            .ok_or_else(|| ClobError::MarketNotFound(slug.to_string()))
    }

    fn pick_market(event: &Value) -> Option<&Value> {
        let markets = event.get("markets")?.as_array()?;
        markets
            .iter()
            .find(|m| {
                m.get("active").and_then(Value::as_bool).unwrap_or(false)
                    && !m.get("closed").and_then(Value::as_bool).unwrap_or(true)
            })
            .or_else(|| markets.first())
    }

    /// Resolve a market slug + outcome index to an outcome token id.
    /// Results are cached for five minutes.
    pub async fn resolve_token_id(
        &self,
        slug: &str,
        outcome_index: usize,
    ) -> Result<String, ClobError> {
        let cache_key = format!("{slug}#{outcome_index}");
        if let Some((at, token)) = self.token_cache.lock().unwrap().get(&cache_key) {
            if at.elapsed() < RESOLVE_CACHE_TTL {
                return Ok(token.clone());
            }
        }

        let event = self.fetch_event(slug).await?;
        let market =
            Self::pick_market(&event).ok_or_else(|| ClobError::MarketNotFound(slug.to_string()))?;

        // clobTokenIds arrives either as a JSON array or a JSON-encoded
        // string containing one.
        let raw = market
            .get("clobTokenIds")
            .cloned()
            .ok_or_else(|| ClobError::MarketNotFound(slug.to_string()))?;
        let token_ids: Vec<String> = match raw {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Value::String(s) => serde_json::from_str(&s)?,
            _ => Vec::new(),
        };
        let token_id = token_ids
            .get(outcome_index)
            .cloned()
            .ok_or_else(|| ClobError::MarketNotFound(format!("{slug} outcome {outcome_index}")))?;

        let question = market
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or_default();
        info!(slug, question, token = %crate::truncate_id(&token_id), "resolved market token");

        self.token_cache
            .lock()
            .unwrap()
            .insert(cache_key, (Instant::now(), token_id.clone()));
        Ok(token_id)
    }

    /// Market question/active/closed metadata, cached for five minutes.
    pub async fn get_market_info(&self, slug: &str) -> Result<MarketInfo, ClobError> {
        if let Some((at, info)) = self.market_info_cache.lock().unwrap().get(slug) {
            if at.elapsed() < RESOLVE_CACHE_TTL {
                return Ok(info.clone());
            }
        }

        let event = self.fetch_event(slug).await?;
        let market =
            Self::pick_market(&event).ok_or_else(|| ClobError::MarketNotFound(slug.to_string()))?;
        let info = MarketInfo {
            question: market
                .get("question")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            active: market.get("active").and_then(Value::as_bool).unwrap_or(true),
            closed: market.get("closed").and_then(Value::as_bool).unwrap_or(false),
            outcome: market
                .get("outcome")
                .and_then(Value::as_str)
                .map(str::to_string),
        };

        self.market_info_cache
            .lock()
            .unwrap()
            .insert(slug.to_string(), (Instant::now(), info.clone()));
        Ok(info)
    }

    /// Current order book, best-first.
    pub async fn get_order_book(&self, token_id: &str) -> Result<OrderBook, ClobError> {
        let url = format!("{}/book?token_id={token_id}", self.clob_host);
        let data = self.get_json(&url).await?;

        let mut book = OrderBook {
            token_id: token_id.to_string(),
            bids: parse_side(data.get("bids")),
            asks: parse_side(data.get("asks")),
            timestamp: data
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(|| Utc::now().timestamp_millis()),
        };
        book.normalize_levels();
        if book.bids.is_empty() && book.asks.is_empty() {
            return Err(ClobError::NoOrderbook);
        }
        Ok(book)
    }

    /// Price of the most recent trade, if any.
    pub async fn get_last_trade_price(&self, token_id: &str) -> Result<Option<f64>, ClobError> {
        let url = format!("{}/last-trade-price?token_id={token_id}", self.clob_host);
        let data = self.get_json(&url).await?;
        let price = data
            .get("price")
            .and_then(|p| match p {
                Value::String(s) => s.parse::<f64>().ok(),
                Value::Number(n) => n.as_f64(),
                _ => None,
            })
            .filter(|p| *p > 0.0);
        Ok(price)
    }

    /// The exchange's displayed-price rule: midpoint while the spread
    /// is tight (<= $0.10), last trade price otherwise.
    pub async fn get_market_price(&self, token_id: &str) -> Result<f64, ClobError> {
        let book = match self.get_order_book(token_id).await {
            Ok(book) => book,
            Err(ClobError::NoOrderbook) => {
                return self
                    .get_last_trade_price(token_id)
                    .await?
                    .ok_or(ClobError::NoPrice)
            }
            Err(e) => return Err(e),
        };

        if let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) {
            let spread = ask - bid;
            if spread <= MAX_SPREAD_FOR_MIDPOINT {
                return Ok((bid + ask) / 2.0);
            }
            if let Some(last) = self.get_last_trade_price(token_id).await? {
                debug!(spread, last, "wide spread, using last trade price");
                return Ok(last);
            }
            // Wide spread with no trade history yet.
            return Ok((bid + ask) / 2.0);
        }

        match self.get_last_trade_price(token_id).await? {
            Some(last) => Ok(last),
            None => book.best_bid().or(book.best_ask()).ok_or(ClobError::NoPrice),
        }
    }

    /// Create (or derive, for an existing wallet) L2 API credentials.
    pub async fn derive_api_creds(&self, signer: &OrderSigner) -> Result<ApiCreds, ClobError> {
        let timestamp = Utc::now().timestamp();
        let nonce = rand::random::<u64>();
        let signature = signer
            .sign_auth_message(timestamp, nonce)
            .await
            .map_err(|e| ClobError::InvalidSignature(e.to_string()))?;
        let headers = signing::l1_headers(signer.address(), &signature, timestamp, nonce)
            .map_err(|e| ClobError::InvalidSignature(e.to_string()))?;

        let create = self
            .client
            .post(format!("{}/auth/api-key", self.clob_host))
            .headers(headers.clone())
            .body("{}")
            .send()
            .await?;

        let raw = if create.status().is_success() {
            create.json::<Value>().await?
        } else {
            let derive = self
                .client
                .get(format!("{}/auth/derive-api-key", self.clob_host))
                .headers(headers)
                .send()
                .await?;
            if !derive.status().is_success() {
                return Err(ClobError::Api {
                    status: derive.status().as_u16(),
                    message: derive.text().await.unwrap_or_default(),
                });
            }
            derive.json::<Value>().await?
        };

        let pick = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .find_map(|k| raw.get(*k).and_then(Value::as_str))
                .map(str::to_string)
        };
        let key = pick(&["apiKey", "key"]);
        let secret = pick(&["secret"]);
        let passphrase = pick(&["passphrase"]);
        match (key, secret, passphrase) {
            (Some(key), Some(secret), Some(passphrase)) => Ok(ApiCreds {
                key,
                secret,
                passphrase,
            }),
            _ => Err(ClobError::Api {
                status: 200,
                message: "API credential response missing fields".to_string(),
            }),
        }
    }

    /// USDC balance and exchange allowance for the wallet.
    pub async fn get_balance_allowance(
        &self,
        signer: &OrderSigner,
        creds: &ApiCreds,
    ) -> Result<BalanceAllowance, ClobError> {
        let path = "/balance-allowance";
        let headers = signing::l2_headers(signer.address(), creds, "GET", path, "")
            .map_err(|e| ClobError::InvalidSignature(e.to_string()))?;
        let url = format!(
            "{}{path}?asset_type=COLLATERAL&signature_type={}",
            self.clob_host,
            match signer.maker_address() == signer.address() {
                true => 0,
                false => 2,
            }
        );
        let resp = self.client.get(url).headers(headers).send().await?;
        if !resp.status().is_success() {
            return Err(ClobError::Api {
                status: resp.status().as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        let data = resp.json::<Value>().await?;
        let scaled = |key: &str| {
            data.get(key)
                .and_then(|v| match v {
                    Value::String(s) => s.parse::<f64>().ok(),
                    Value::Number(n) => n.as_f64(),
                    _ => None,
                })
                .unwrap_or(0.0)
                / COLLATERAL_SCALE
        };
        Ok(BalanceAllowance {
            balance_usd: scaled("balance"),
            allowance_usd: scaled("allowance"),
        })
    }

    /// Submit a signed FOK order. Returns the fill, or a classified
    /// error; the caller decides what is retryable.
    pub async fn post_order(
        &self,
        signer: &OrderSigner,
        creds: &ApiCreds,
        order_body: Value,
        limit_price: f64,
        amount_usd: f64,
        side: OrderSide,
    ) -> Result<OrderFill, ClobError> {
        let path = "/order";
        let payload = json!({
            "order": order_body,
            "owner": creds.key,
            "orderType": "FOK",
        });
        let body = serde_json::to_string(&payload)?;
        let headers = signing::l2_headers(signer.address(), creds, "POST", path, &body)
            .map_err(|e| ClobError::InvalidSignature(e.to_string()))?;

        let resp = self
            .client
            .post(format!("{}{path}", self.clob_host))
            .headers(headers)
            .body(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ClobError::Api {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }

        let data = resp.json::<Value>().await?;
        let success = data.get("success").and_then(Value::as_bool).unwrap_or(false);
        if !success {
            let message = data
                .get("errorMsg")
                .or_else(|| data.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("order rejected without reason");
            warn!(%message, "order rejected by exchange");
            return Err(ClobError::from_rejection(message));
        }

        let order_id = data
            .get("orderID")
            .or_else(|| data.get("order_id"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        // FOK: response carries the matched amounts; fall back to the
        // marketable limit when they are absent.
        let amount_of = |key: &str| {
            data.get(key).and_then(|v| match v {
                Value::String(s) => s.parse::<f64>().ok(),
                Value::Number(n) => n.as_f64(),
                _ => None,
            })
        };
        let (making, taking) = (amount_of("makingAmount"), amount_of("takingAmount"));
        let (fill_price, fill_shares) = match (side, making, taking) {
            (OrderSide::Buy, Some(usd), Some(shares)) if shares > 0.0 => (usd / shares, shares),
            (OrderSide::Sell, Some(shares), Some(usd)) if shares > 0.0 => (usd / shares, shares),
            _ => (limit_price, amount_usd / limit_price),
        };

        info!(%order_id, fill_price, fill_shares, "order filled");
        Ok(OrderFill {
            order_id,
            fill_price,
            fill_shares,
            simulated: false,
        })
    }
}
