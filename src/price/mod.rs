//! Per-bot price feed.
//!
//! Merges the exchange market stream (primary) with REST polling
//! (fallback) into one deduplicated, sequence-numbered series of
//! [`PriceUpdate`]s. Also the single writer of the bot's
//! [`PriceHistory`] ring.
//!
//! Poll cadence is 30s while the stream is live and 1s while it is
//! down; a polled price only becomes authoritative when the stream has
//! been silent past the staleness threshold.

pub mod history;

pub use history::PriceHistory;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clob::{ExchangeApi, MarketEvent, StreamConfig};

/// Stream silence after which polls take over.
const STALENESS_THRESHOLD: Duration = Duration::from_secs(10);
/// Poll cadence while the stream is healthy / down.
const POLL_INTERVAL_LIVE: Duration = Duration::from_secs(30);
const POLL_INTERVAL_FALLBACK: Duration = Duration::from_secs(1);
/// Re-emit an unchanged price after this long.
const DEDUP_REEMIT_AFTER_MS: i64 = 1_000;
/// Displayed-price rule threshold, applied locally to stream books.
const MAX_SPREAD_FOR_MIDPOINT: f64 = 0.10;

/// Where an update's price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    Stream,
    Poll,
}

/// One published price tick.
#[derive(Debug, Clone, Copy)]
pub struct PriceUpdate {
    /// Monotonic per-bot sequence number.
    pub seq: u64,
    /// Unix milliseconds, strictly increasing across updates.
    pub ts_ms: i64,
    pub price: f64,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub source: PriceSource,
    /// True when the market stream was down at emission time.
    pub fallback_pricing: bool,
}

/// State shared between the feed task and its readers.
pub struct PriceShared {
    latest: RwLock<Option<PriceUpdate>>,
    history: RwLock<PriceHistory>,
}

impl PriceShared {
    fn new(capacity: usize) -> Self {
        Self {
            latest: RwLock::new(None),
            history: RwLock::new(PriceHistory::new(capacity)),
        }
    }

    /// Latest published update, if the feed is warm.
    pub fn latest(&self) -> Option<PriceUpdate> {
        *self.latest.read().expect("price lock poisoned")
    }

    /// A feed is warm once it has published anything.
    pub fn is_warm(&self) -> bool {
        self.latest().is_some()
    }

    pub fn with_history<T>(&self, f: impl FnOnce(&PriceHistory) -> T) -> T {
        f(&self.history.read().expect("history lock poisoned"))
    }
}

/// Handle to one bot's running price feed.
pub struct PriceFeed {
    pub updates: mpsc::Receiver<PriceUpdate>,
    pub shared: Arc<PriceShared>,
    /// True while the market stream is connected.
    pub stream_connected: watch::Receiver<bool>,
    merge_task: JoinHandle<()>,
    stream_task: Option<JoinHandle<()>>,
    /// Keeps `stream_connected` alive when no stream task owns the
    /// sender (stream disabled), so `changed()` never spins on Err.
    _connected_tx: Option<watch::Sender<bool>>,
}

impl PriceFeed {
    /// Spawn the feed tasks for one token.
    pub fn spawn(
        exchange: Arc<dyn ExchangeApi>,
        token_id: String,
        history_capacity: usize,
        stream_enabled: bool,
        stream_cfg: StreamConfig,
    ) -> Self {
        let shared = Arc::new(PriceShared::new(history_capacity));
        let (updates_tx, updates_rx) = mpsc::channel(256);
        let (connected_tx, connected_rx) = watch::channel(false);

        let (stream_task, events_rx, parked_tx) = if stream_enabled {
            let (events_tx, events_rx) = mpsc::channel(256);
            let task = crate::clob::spawn_market_stream(
                stream_cfg,
                token_id.clone(),
                events_tx,
                connected_tx,
            );
            (Some(task), Some(events_rx), None)
        } else {
            (None, None, Some(connected_tx))
        };

        let merge_task = tokio::spawn(merge_loop(
            exchange,
            token_id,
            shared.clone(),
            updates_tx,
            events_rx,
            connected_rx.clone(),
        ));

        Self {
            updates: updates_rx,
            shared,
            stream_connected: connected_rx,
            merge_task,
            stream_task,
            _connected_tx: parked_tx,
        }
    }

    pub fn shutdown(&self) {
        self.merge_task.abort();
        if let Some(t) = &self.stream_task {
            t.abort();
        }
    }
}

/// Book state tracked locally so stream events can be priced without a
/// round trip.
#[derive(Default)]
struct LocalQuote {
    best_bid: Option<f64>,
    best_ask: Option<f64>,
    last_trade: Option<f64>,
}

impl LocalQuote {
    /// Same rule the exchange uses for its displayed price.
    fn derive_price(&self) -> Option<f64> {
        if let (Some(bid), Some(ask)) = (self.best_bid, self.best_ask) {
            if ask - bid <= MAX_SPREAD_FOR_MIDPOINT {
                return Some((bid + ask) / 2.0);
            }
            if let Some(last) = self.last_trade {
                return Some(last);
            }
            return Some((bid + ask) / 2.0);
        }
        self.last_trade
    }
}

struct Emitter {
    seq: u64,
    last_emitted_price: Option<f64>,
    last_emitted_ts: i64,
    shared: Arc<PriceShared>,
    tx: mpsc::Sender<PriceUpdate>,
}

impl Emitter {
    /// Dedup, stamp, record, publish. Returns false when the consumer
    /// side is gone.
    async fn emit(
        &mut self,
        ts_ms: i64,
        price: f64,
        quote: &LocalQuote,
        source: PriceSource,
        fallback: bool,
    ) -> bool {
        if !(price > 0.0 && price < 1.0) {
            return true;
        }
        let unchanged = self.last_emitted_price.map_or(false, |p| p == price);
        if unchanged && ts_ms - self.last_emitted_ts < DEDUP_REEMIT_AFTER_MS {
            return true;
        }

        // Duplicate timestamps are clamped forward so downstream
        // ordering stays strict.
        let ts_ms = ts_ms.max(self.last_emitted_ts + 1);
        self.seq += 1;
        let update = PriceUpdate {
            seq: self.seq,
            ts_ms,
            price,
            best_bid: quote.best_bid,
            best_ask: quote.best_ask,
            source,
            fallback_pricing: fallback,
        };

        self.last_emitted_price = Some(price);
        self.last_emitted_ts = ts_ms;
        {
            let mut history = self.shared.history.write().expect("history lock poisoned");
            history.append(ts_ms, price);
        }
        *self.shared.latest.write().expect("price lock poisoned") = Some(update);

        self.tx.send(update).await.is_ok()
    }
}

async fn merge_loop(
    exchange: Arc<dyn ExchangeApi>,
    token_id: String,
    shared: Arc<PriceShared>,
    tx: mpsc::Sender<PriceUpdate>,
    mut events: Option<mpsc::Receiver<MarketEvent>>,
    connected: watch::Receiver<bool>,
) {
    let mut quote = LocalQuote::default();
    let mut emitter = Emitter {
        seq: 0,
        last_emitted_price: None,
        last_emitted_ts: 0,
        shared,
        tx,
    };
    let mut last_stream_emit: Option<tokio::time::Instant> = None;
    let mut poll_deadline = tokio::time::Instant::now();

    loop {
        let stream_live = *connected.borrow();

        tokio::select! {
            event = async {
                match events.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                let Some(event) = event else {
                    // Stream task gone; polling carries on alone.
                    events = None;
                    continue;
                };
                let ts_ms = match &event {
                    MarketEvent::Book(book) => {
                        quote.best_bid = book.best_bid();
                        quote.best_ask = book.best_ask();
                        book.timestamp
                    }
                    MarketEvent::PriceChange { best_bid, best_ask, ts_ms, .. } => {
                        if best_bid.is_some() {
                            quote.best_bid = *best_bid;
                        }
                        if best_ask.is_some() {
                            quote.best_ask = *best_ask;
                        }
                        *ts_ms
                    }
                    MarketEvent::LastTrade { price, ts_ms, .. } => {
                        quote.last_trade = Some(*price);
                        *ts_ms
                    }
                };
                if let Some(price) = quote.derive_price() {
                    last_stream_emit = Some(tokio::time::Instant::now());
                    if !emitter.emit(ts_ms, price, &quote, PriceSource::Stream, false).await {
                        return;
                    }
                }
            }

            _ = tokio::time::sleep_until(poll_deadline) => {
                let interval = if stream_live { POLL_INTERVAL_LIVE } else { POLL_INTERVAL_FALLBACK };
                poll_deadline = tokio::time::Instant::now() + interval;

                match exchange.get_market_price(&token_id).await {
                    Ok(price) => {
                        let stream_stale = last_stream_emit
                            .map_or(true, |at| at.elapsed() >= STALENESS_THRESHOLD);
                        // While the stream is fresh its ordering wins;
                        // polls only fill silence.
                        if stream_stale {
                            let ts = Utc::now().timestamp_millis();
                            if !emitter
                                .emit(ts, price, &quote, PriceSource::Poll, !stream_live)
                                .await
                            {
                                return;
                            }
                        } else {
                            debug!(price, "poll skipped, stream is fresh");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "price poll failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_quote_pricing_rule() {
        let mut q = LocalQuote::default();
        assert!(q.derive_price().is_none());

        q.best_bid = Some(0.48);
        q.best_ask = Some(0.52);
        assert!((q.derive_price().unwrap() - 0.50).abs() < 1e-9);

        // Wide spread falls back to last trade.
        q.best_ask = Some(0.70);
        q.last_trade = Some(0.55);
        assert!((q.derive_price().unwrap() - 0.55).abs() < 1e-9);

        // Wide spread with no trade: midpoint still better than nothing.
        q.last_trade = None;
        assert!((q.derive_price().unwrap() - 0.59).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_emitter_dedups_and_clamps() {
        let shared = Arc::new(PriceShared::new(16));
        let (tx, mut rx) = mpsc::channel(16);
        let mut em = Emitter {
            seq: 0,
            last_emitted_price: None,
            last_emitted_ts: 0,
            shared: shared.clone(),
            tx,
        };
        let quote = LocalQuote::default();

        assert!(em.emit(1_000, 0.50, &quote, PriceSource::Stream, false).await);
        // Same price, same instant: suppressed.
        assert!(em.emit(1_000, 0.50, &quote, PriceSource::Stream, false).await);
        // Different price at a duplicate timestamp: clamped forward.
        assert!(em.emit(1_000, 0.51, &quote, PriceSource::Stream, false).await);
        // Same price after the re-emit window: published.
        assert!(em.emit(2_500, 0.51, &quote, PriceSource::Stream, false).await);

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        let c = rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err());

        assert_eq!((a.seq, a.ts_ms), (1, 1_000));
        assert_eq!(b.seq, 2);
        assert_eq!(b.ts_ms, 1_001, "duplicate ts must clamp to prev + 1ms");
        assert_eq!(c.ts_ms, 2_500);
        assert_eq!(shared.with_history(|h| h.len()), 3);
        assert!(shared.is_warm());
    }

    #[tokio::test]
    async fn test_emitter_rejects_out_of_range_prices() {
        let shared = Arc::new(PriceShared::new(16));
        let (tx, mut rx) = mpsc::channel(16);
        let mut em = Emitter {
            seq: 0,
            last_emitted_price: None,
            last_emitted_ts: 0,
            shared,
            tx,
        };
        let quote = LocalQuote::default();
        assert!(em.emit(1, 0.0, &quote, PriceSource::Poll, false).await);
        assert!(em.emit(2, 1.5, &quote, PriceSource::Poll, false).await);
        assert!(rx.try_recv().is_err());
    }
}
