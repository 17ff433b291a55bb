// =============================================================================
// WebSocket Handler — live bucket stream with per-connection filters
// =============================================================================
//
// Clients connect to `/api/v1/fo/stream` and drive their subscription with
// JSON control messages:
//
//   { "op": "subscribe", "symbols": ["NIFTY"], "expiries": ["2025-11-06"],
//     "strike_range": { "low": 24500, "high": 25500 }, "indicators": ["oi"] }
//   { "op": "unsubscribe" }
//
// A subscribe registers a filtered hub handle (replacing any earlier one) and
// the connection then receives bucket and event pushes as they flush. The hub
// enforces the slow-consumer policy; when it closes the handle the connection
// is told and dropped. Ping frames are answered with Pong.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::hub::{SubscriberHandle, SubscriptionFilter};
use crate::types::{parse_expiry, Indicator, StrikeRange};

// =============================================================================
// Control messages
// =============================================================================

#[derive(Debug, Deserialize)]
struct ControlMessage {
    op: String,
    #[serde(default)]
    symbols: Option<Vec<String>>,
    #[serde(default)]
    expiries: Option<Vec<String>>,
    #[serde(default)]
    strike_range: Option<StrikeRange>,
    #[serde(default)]
    indicators: Option<Vec<String>>,
}

impl ControlMessage {
    fn filter(&self) -> SubscriptionFilter {
        SubscriptionFilter {
            symbols: self
                .symbols
                .as_ref()
                .map(|v| v.iter().map(|s| s.to_uppercase()).collect()),
            expiries: self.expiries.as_ref().map(|v| {
                v.iter().filter_map(|s| parse_expiry(s)).collect()
            }),
            strike_range: self.strike_range,
            indicators: self.indicators.as_ref().map(|v| {
                v.iter()
                    .filter_map(|s| Indicator::parse(s))
                    .collect::<HashSet<_>>()
            }),
        }
    }
}

// =============================================================================
// Upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("bucket-stream connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscription: Option<SubscriberHandle> = None;

    loop {
        tokio::select! {
            // ── Hub push: forward matched messages to the client ────────
            msg = recv_from_hub(&subscription) => {
                match msg {
                    Some(msg) => {
                        let payload = match serde_json::to_string(msg.as_ref()) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "failed to serialise hub message");
                                continue;
                            }
                        };
                        if sender.send(Message::Text(payload)).await.is_err() {
                            debug!("bucket-stream send failed — disconnecting");
                            break;
                        }
                    }
                    None => {
                        // The hub closed us (slow-consumer policy).
                        let _ = sender
                            .send(Message::Text(
                                r#"{"type":"closed","reason":"slow_consumer"}"#.into(),
                            ))
                            .await;
                        info!("subscriber closed by hub — disconnecting");
                        break;
                    }
                }
            }

            // ── Client messages: control frames and keepalive ───────────
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_control(&text, &state, &mut subscription, &mut sender).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("bucket-stream close frame received");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Pong / Binary — ignored.
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "bucket-stream receive error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    // Dropping the handle deregisters it from the hub.
    drop(subscription);
    info!("bucket-stream connection closed");
}

/// Await the next hub message, or park forever while unsubscribed.
async fn recv_from_hub(
    subscription: &Option<SubscriberHandle>,
) -> Option<Arc<crate::hub::HubMessage>> {
    match subscription {
        Some(handle) => handle.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_control<S>(
    text: &str,
    state: &Arc<AppState>,
    subscription: &mut Option<SubscriberHandle>,
    sender: &mut S,
) where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let control: ControlMessage = match serde_json::from_str(text) {
        Ok(c) => c,
        Err(e) => {
            debug!(error = %e, "malformed control message");
            let _ = sender
                .send(Message::Text(
                    r#"{"type":"error","message":"malformed control message"}"#.into(),
                ))
                .await;
            return;
        }
    };

    match control.op.as_str() {
        "subscribe" => {
            let handle = state.hub.subscribe(control.filter());
            info!(subscriber = %handle.id(), "bucket-stream subscribed");
            *subscription = Some(handle);
            let _ = sender
                .send(Message::Text(r#"{"type":"subscribed"}"#.into()))
                .await;
        }
        "unsubscribe" => {
            *subscription = None;
            info!("bucket-stream unsubscribed");
            let _ = sender
                .send(Message::Text(r#"{"type":"unsubscribed"}"#.into()))
                .await;
        }
        other => {
            debug!(op = %other, "unknown control op");
            let _ = sender
                .send(Message::Text(
                    r#"{"type":"error","message":"unknown op"}"#.into(),
                ))
                .await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_control_builds_filter() {
        let raw = r#"{
            "op": "subscribe",
            "symbols": ["nifty"],
            "expiries": ["2025-11-06", "garbage"],
            "strike_range": { "low": 24500.0, "high": 25500.0 },
            "indicators": ["oi", "iv", "bogus"]
        }"#;
        let control: ControlMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(control.op, "subscribe");

        let filter = control.filter();
        assert!(filter.symbols.unwrap().contains("NIFTY"));
        // Unparseable expiries and indicators are silently skipped.
        assert_eq!(filter.expiries.unwrap().len(), 1);
        let indicators = filter.indicators.unwrap();
        assert_eq!(indicators.len(), 2);
        assert!(indicators.contains(&Indicator::Oi));
        assert_eq!(filter.strike_range.unwrap().low, 24_500.0);
    }

    #[test]
    fn bare_subscribe_matches_everything() {
        let control: ControlMessage = serde_json::from_str(r#"{"op":"subscribe"}"#).unwrap();
        let filter = control.filter();
        assert!(filter.symbols.is_none());
        assert!(filter.expiries.is_none());
        assert!(filter.strike_range.is_none());
        assert!(filter.indicators.is_none());
    }
}
