//! Event stream at `/ws/events`.
//!
//! Every client starts out receiving all bus events. Sending
//! `{"subscribe": "process:exited:*"}` narrows the stream to matching topics;
//! `{"unsubscribe": ...}` drops a pattern again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::state::SharedState;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClientMessage {
    Subscribe { subscribe: String },
    Unsubscribe { unsubscribe: String },
}

#[derive(Serialize)]
struct WsEvent {
    event_type: String,
    payload: serde_json::Value,
}

/// Subscription patterns of one client. Empty means everything.
#[derive(Default)]
struct Filter {
    patterns: Mutex<HashSet<String>>,
}

impl Filter {
    fn apply(&self, msg: ClientMessage) {
        let mut patterns = self.patterns.lock().unwrap_or_else(PoisonError::into_inner);
        match msg {
            ClientMessage::Subscribe { subscribe } => {
                log::debug!("websocket subscribed to {}", subscribe);
                patterns.insert(subscribe);
            }
            ClientMessage::Unsubscribe { unsubscribe } => {
                log::debug!("websocket unsubscribed from {}", unsubscribe);
                patterns.remove(&unsubscribe);
            }
        }
    }

    fn admits(&self, event_type: &str) -> bool {
        let patterns = self.patterns.lock().unwrap_or_else(PoisonError::into_inner);
        patterns.is_empty() || patterns.iter().any(|p| matches_pattern(event_type, p))
    }
}

/// GET /ws/events
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SharedState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<SharedState>) {
    let (mut sender, mut receiver) = socket.split();
    let filter = Arc::new(Filter::default());
    let mut event_rx = state.plane.event_bus.subscribe();

    let incoming = Arc::clone(&filter);
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => incoming.apply(msg),
                    Err(err) => log::debug!("ignoring websocket message: {}", err),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    let send_task = tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => {
                    if !filter.admits(&event.event_type) {
                        continue;
                    }
                    let ws_event = WsEvent {
                        event_type: event.event_type,
                        payload: event.payload,
                    };
                    let Ok(json) = serde_json::to_string(&ws_event) else {
                        continue;
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(count)) => {
                    log::warn!("websocket client lagged by {} events", count);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        _ = recv_task => {},
        _ = send_task => {},
    }

    log::debug!("websocket connection closed");
}

/// Topic matching for subscriptions.
///
/// - exact: `process:exited:abc` matches only itself
/// - `prefix:*` matches any topic continuing past `prefix:`
/// - a bare `*` segment matches exactly one segment
fn matches_pattern(event_type: &str, pattern: &str) -> bool {
    if event_type == pattern {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix(":*") {
        if event_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with(':'))
        {
            return true;
        }
    }

    if !pattern.contains('*') {
        return false;
    }
    let pattern_parts: Vec<&str> = pattern.split(':').collect();
    let event_parts: Vec<&str> = event_type.split(':').collect();
    pattern_parts.len() == event_parts.len()
        && pattern_parts
            .iter()
            .zip(&event_parts)
            .all(|(p, e)| *p == "*" || p == e)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    mod patterns {
        use super::*;

        #[test]
        fn exact() {
            assert!(matches_pattern("process:exited:calm-otter", "process:exited:calm-otter"));
            assert!(!matches_pattern("process:exited:calm-otter", "process:exited:bold-fox"));
        }

        #[test]
        fn suffix_wildcard() {
            assert!(matches_pattern("process:exited:calm-otter", "process:exited:*"));
            assert!(matches_pattern("process:spawned:x", "process:*"));
            assert!(!matches_pattern("process:spawned:x", "process:exited:*"));
            assert!(!matches_pattern("processes:x", "process:*"));
        }

        #[test]
        fn segment_wildcard() {
            assert!(matches_pattern("approval:requested:abc", "*:requested:abc"));
            assert!(matches_pattern("process:removed:abc", "process:*:abc"));
            assert!(!matches_pattern("process:removed:abc", "process:*:xyz"));
        }

        #[test]
        fn unrelated_topics() {
            assert!(!matches_pattern("capabilities:changed", "process:*"));
            assert!(!matches_pattern("capabilities:changed", "capabilities"));
        }
    }

    mod filter {
        use super::*;

        #[test]
        fn empty_filter_admits_everything() {
            assert!(Filter::default().admits("capabilities:changed"));
        }

        #[test]
        fn subscribe_then_unsubscribe() {
            let filter = Filter::default();
            filter.apply(serde_json::from_str(r#"{"subscribe": "approval:*"}"#).unwrap());
            assert!(filter.admits("approval:requested:1"));
            assert!(!filter.admits("process:spawned:1"));

            filter.apply(serde_json::from_str(r#"{"unsubscribe": "approval:*"}"#).unwrap());
            assert!(filter.admits("process:spawned:1"));
        }

        #[test]
        fn unknown_messages_do_not_parse() {
            assert!(serde_json::from_str::<ClientMessage>(r#"{"hello": 1}"#).is_err());
        }
    }

    #[test]
    fn ws_event_shape() {
        let event = WsEvent {
            event_type: "process:exited:abc".to_string(),
            payload: serde_json::json!({"exitCode": 0}),
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "process:exited:abc");
        assert_eq!(json["payload"]["exitCode"], 0);
    }
}
