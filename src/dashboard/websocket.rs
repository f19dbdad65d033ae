//! Dashboard push channel.
//!
//! One duplex websocket per client: an `init` snapshot on connect,
//! then every bus event as a `{type, bot_id?, timestamp, data}` frame.
//! Clients may send `subscribe_bot` to focus on one bot; bot-scoped
//! events are then routed to interested connections only, while global
//! events always flow. A slow client gets a `subscriber_lagged` frame
//! instead of back-pressuring publishers.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::types::ClientMessage;
use crate::broadcast::{BusEvent, EventKind};
use crate::registry::Registry;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<Registry>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, registry))
}

fn frame(event: &BusEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            warn!(error = %e, "failed to serialize bus event");
            None
        }
    }
}

async fn handle_connection(mut socket: WebSocket, registry: Arc<Registry>) {
    // Full snapshot first so the client can render immediately.
    let init = BusEvent::global(
        EventKind::Init,
        json!({
            "bots": registry.snapshots(),
            "killswitch": registry.controls.killswitch(),
            "uptime_seconds": registry.uptime_seconds(),
        }),
    );
    if let Some(msg) = frame(&init) {
        if socket.send(msg).await.is_err() {
            return;
        }
    }

    let mut events = registry.bus.subscribe();
    let mut focus: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        // Routing: bot events go to interested clients;
                        // global events go to everyone.
                        if let Some(bot_id) = &event.bot_id {
                            if !focus.is_empty() && !focus.contains(bot_id) {
                                continue;
                            }
                        }
                        let Some(msg) = frame(&event) else { continue };
                        if socket.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        let lag = BusEvent::global(
                            EventKind::SubscriberLagged,
                            json!({ "missed_events": missed }),
                        );
                        if let Some(msg) = frame(&lag) {
                            if socket.send(msg).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::SubscribeBot { bot_id }) => {
                                debug!(bot_id, "client subscribed to bot");
                                focus.insert(bot_id);
                            }
                            Ok(ClientMessage::UnsubscribeAll) => focus.clear(),
                            Err(_) => debug!("ignoring unknown client message"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }
    debug!("dashboard client disconnected");
}
