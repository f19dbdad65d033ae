//! CLOB websocket clients.
//!
//! `spawn_market_stream` feeds real-time market events for one outcome
//! token into an mpsc channel, reconnecting forever with bounded
//! exponential backoff. `spawn_user_stream` is the optional
//! authenticated channel used for fill confirmation.
//!
//! Both tasks exit when the receiving side of their channel is dropped.

use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::signing::ApiCreds;
use super::types::{BookLevel, MarketEvent, OrderBook, OrderEvent};

/// Reconnect if no useful message arrived for this long.
const SILENCE_RECONNECT: Duration = Duration::from_secs(20);
/// Application-level ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(10);
const BACKOFF_JITTER_RATIO: f64 = 0.20;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Base websocket endpoint (`.../ws`); channel suffix is appended.
    pub ws_host: String,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

fn backoff_delay(cfg: &StreamConfig, attempt: u32) -> Duration {
    let base = cfg.reconnect_min.as_secs_f64() * 2f64.powi(attempt.min(16) as i32);
    let bounded = base.clamp(
        cfg.reconnect_min.as_secs_f64().max(0.1),
        cfg.reconnect_max.as_secs_f64().max(0.1),
    );
    let jitter = 1.0 + rand::thread_rng().gen_range(-BACKOFF_JITTER_RATIO..BACKOFF_JITTER_RATIO);
    Duration::from_secs_f64((bounded * jitter).max(0.1))
}

fn ts_of(value: &Value) -> i64 {
    value
        .get("timestamp")
        .and_then(|t| match t {
            Value::String(s) => s.parse::<i64>().ok(),
            Value::Number(n) => n.as_i64(),
            _ => None,
        })
        .unwrap_or_else(|| Utc::now().timestamp_millis())
}

fn levels_of(value: Option<&Value>) -> Vec<BookLevel> {
    value
        .and_then(Value::as_array)
        .map(|levels| {
            levels
                .iter()
                .filter_map(|l| {
                    let price = l.get("price").and_then(Value::as_str)?.parse().ok()?;
                    let size = l.get("size").and_then(Value::as_str)?.parse().ok()?;
                    if price <= 0.0 || size <= 0.0 {
                        return None;
                    }
                    Some(BookLevel { price, size })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn price_field(value: &Value, key: &str) -> Option<f64> {
    value
        .get(key)
        .and_then(|p| match p {
            Value::String(s) => s.parse::<f64>().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        })
        .filter(|p| *p > 0.0)
}

/// Map one raw market-channel message to an event, if relevant.
fn parse_market_event(value: &Value, token_id: &str) -> Option<MarketEvent> {
    let event_type = value.get("event_type").and_then(Value::as_str)?;
    let asset = value
        .get("asset_id")
        .and_then(Value::as_str)
        .unwrap_or(token_id);
    if asset != token_id {
        return None;
    }

    match event_type {
        "book" => {
            let mut book = OrderBook {
                token_id: token_id.to_string(),
                bids: levels_of(value.get("bids").or_else(|| value.get("buys"))),
                asks: levels_of(value.get("asks").or_else(|| value.get("sells"))),
                timestamp: ts_of(value),
            };
            book.normalize_levels();
            Some(MarketEvent::Book(book))
        }
        "price_change" | "best_bid_ask" => Some(MarketEvent::PriceChange {
            token_id: token_id.to_string(),
            best_bid: price_field(value, "best_bid"),
            best_ask: price_field(value, "best_ask"),
            ts_ms: ts_of(value),
        }),
        "last_trade_price" => Some(MarketEvent::LastTrade {
            token_id: token_id.to_string(),
            price: price_field(value, "price")?,
            ts_ms: ts_of(value),
        }),
        _ => None,
    }
}

/// Run the market stream for one token until the receiver is dropped.
///
/// `connected` flips false during outages so the price stream can fall
/// back to aggressive REST polling.
pub fn spawn_market_stream(
    cfg: StreamConfig,
    token_id: String,
    events: mpsc::Sender<MarketEvent>,
    connected: watch::Sender<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let url = format!("{}/market", cfg.ws_host.trim_end_matches('/'));
        let mut attempt: u32 = 0;
        loop {
            if events.is_closed() {
                break;
            }
            match run_market_connection(&url, &token_id, &events, &connected).await {
                Ok(()) => break, // receiver dropped
                Err(e) => {
                    let _ = connected.send(false);
                    let delay = backoff_delay(&cfg, attempt);
                    warn!(error = %e, attempt, delay_secs = delay.as_secs_f64(),
                        "market stream disconnected, reconnecting");
                    attempt = attempt.saturating_add(1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
        debug!(token = %crate::truncate_id(&token_id), "market stream task exiting");
    })
}

async fn run_market_connection(
    url: &str,
    token_id: &str,
    events: &mpsc::Sender<MarketEvent>,
    connected: &watch::Sender<bool>,
) -> Result<(), String> {
    let (mut ws, _) = connect_async(url).await.map_err(|e| e.to_string())?;

    let subscribe = json!({ "type": "market", "assets_ids": [token_id] });
    ws.send(Message::Text(subscribe.to_string()))
        .await
        .map_err(|e| e.to_string())?;

    info!(token = %crate::truncate_id(token_id), "market stream connected");
    let _ = connected.send(true);

    let mut last_useful = Instant::now();
    let mut ping = interval(PING_INTERVAL);
    ping.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if last_useful.elapsed() >= SILENCE_RECONNECT {
                    return Err("stream silent past watchdog threshold".to_string());
                }
                ws.send(Message::Text("PING".to_string()))
                    .await
                    .map_err(|e| e.to_string())?;
            }
            _ = events.closed() => {
                let _ = ws.close(None).await;
                return Ok(());
            }
            msg = ws.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => return Err(e.to_string()),
                    None => return Err("stream closed by remote".to_string()),
                };
                let text = match msg {
                    Message::Text(t) => t,
                    Message::Ping(payload) => {
                        ws.send(Message::Pong(payload)).await.map_err(|e| e.to_string())?;
                        continue;
                    }
                    Message::Close(_) => return Err("close frame received".to_string()),
                    _ => continue,
                };
                if text == "PONG" {
                    continue;
                }

                // Messages arrive as a single event or a batch.
                let parsed: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let batch = match parsed {
                    Value::Array(items) => items,
                    single => vec![single],
                };
                for item in &batch {
                    if let Some(event) = parse_market_event(item, token_id) {
                        last_useful = Instant::now();
                        if events.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

/// Run the authenticated user stream until the receiver is dropped.
/// Emits fill/cancel confirmations for the wallet's orders.
pub fn spawn_user_stream(
    cfg: StreamConfig,
    creds: ApiCreds,
    markets: Vec<String>,
    events: mpsc::Sender<OrderEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let url = format!("{}/user", cfg.ws_host.trim_end_matches('/'));
        let mut attempt: u32 = 0;
        loop {
            if events.is_closed() {
                break;
            }
            match run_user_connection(&url, &creds, &markets, &events).await {
                Ok(()) => break,
                Err(e) => {
                    let delay = backoff_delay(&cfg, attempt);
                    warn!(error = %e, attempt, "user stream disconnected, reconnecting");
                    attempt = attempt.saturating_add(1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    })
}

async fn run_user_connection(
    url: &str,
    creds: &ApiCreds,
    markets: &[String],
    events: &mpsc::Sender<OrderEvent>,
) -> Result<(), String> {
    let (mut ws, _) = connect_async(url).await.map_err(|e| e.to_string())?;

    let subscribe = json!({
        "type": "user",
        "markets": markets,
        "auth": {
            "apiKey": creds.key,
            "secret": creds.secret,
            "passphrase": creds.passphrase,
        },
    });
    ws.send(Message::Text(subscribe.to_string()))
        .await
        .map_err(|e| e.to_string())?;
    info!("user stream connected");

    let mut ping = interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                ws.send(Message::Text("PING".to_string()))
                    .await
                    .map_err(|e| e.to_string())?;
            }
            _ = events.closed() => {
                let _ = ws.close(None).await;
                return Ok(());
            }
            msg = ws.next() => {
                let msg = match msg {
                    Some(Ok(Message::Text(t))) => t,
                    Some(Ok(Message::Close(_))) => return Err("close frame received".to_string()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.to_string()),
                    None => return Err("stream closed by remote".to_string()),
                };
                if msg == "PONG" {
                    continue;
                }
                let parsed: Value = match serde_json::from_str(&msg) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let batch = match parsed {
                    Value::Array(items) => items,
                    single => vec![single],
                };
                for item in &batch {
                    let event_type = item.get("event_type").and_then(Value::as_str);
                    if !matches!(event_type, Some("order") | Some("trade")) {
                        continue;
                    }
                    let order_id = item
                        .get("order_id")
                        .or_else(|| item.get("orderID"))
                        .or_else(|| item.get("id"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    if order_id.is_empty() {
                        continue;
                    }
                    let event = OrderEvent {
                        order_id,
                        status: item
                            .get("status")
                            .or_else(|| item.get("type"))
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .to_string(),
                        filled_size: price_field(item, "size_matched")
                            .or_else(|| price_field(item, "size")),
                        avg_fill_price: price_field(item, "price"),
                        ts_ms: ts_of(item),
                    };
                    if events.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
