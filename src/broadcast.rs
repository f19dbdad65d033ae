//! Process-wide event bus.
//!
//! Sessions publish typed events; dashboard connections subscribe.
//! Each subscriber has a bounded queue: when it falls behind, the
//! oldest events are dropped and the connection learns about the gap
//! through a lag marker instead of blocking any publisher.

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Per-subscriber queue capacity.
const BUS_CAPACITY: usize = 512;

/// Event types pushed to dashboard clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Init,
    PriceUpdate,
    PositionUpdate,
    TargetUpdate,
    SpikeDetected,
    Activity,
    TradeExecuted,
    PositionClosed,
    BotCreated,
    BotUpdated,
    BotDeleted,
    BotStarted,
    BotStopped,
    BotPaused,
    BotResumed,
    SettingsUpdated,
    Error,
    SubscriberLagged,
}

/// One push frame: `{type, bot_id?, timestamp, data}`.
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub data: serde_json::Value,
}

impl BusEvent {
    pub fn new(kind: EventKind, bot_id: Option<String>, data: impl Serialize) -> Self {
        Self {
            kind,
            bot_id,
            timestamp: Utc::now().timestamp_millis(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn for_bot(kind: EventKind, bot_id: impl Into<String>, data: impl Serialize) -> Self {
        Self::new(kind, Some(bot_id.into()), data)
    }

    pub fn global(kind: EventKind, data: impl Serialize) -> Self {
        Self::new(kind, None, data)
    }
}

/// Fan-out handle. Cheap to clone; sessions hold one for publishing
/// only.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<BusEvent>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Publish to all current subscribers. No subscribers is fine.
    pub fn publish(&self, event: BusEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!(error = %e, "broadcast dropped (no subscribers)");
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}
