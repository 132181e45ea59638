//! WebSocket handler for dashboard clients.
//!
//! Each connection gets one immediate snapshot, then receives the broadcast
//! frames published by the snapshot loop. The only client messages are
//! `getConfig` (answered directly) and `updateSettings` (reserved, logged
//! and ignored); malformed JSON is logged and dropped.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

use super::{config_frame, playout_states_frame, AppState};

/// Incoming WebSocket message envelope.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum WsIncoming {
    GetConfig,
    /// Reserved: accepted but has no effect.
    UpdateSettings {
        #[serde(flatten)]
        _rest: serde_json::Value,
    },
}

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Main WebSocket connection loop.
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut broadcast_rx = state.broadcast_tx.subscribe();

    log::info!("[WS] Client connected");

    // One immediate snapshot so a fresh dashboard renders without waiting
    // for the next broadcast tick.
    let snapshot = playout_states_frame(&state);
    if sender.send(Message::Text(snapshot.into())).await.is_err() {
        log::debug!("[WS] Client went away before the initial snapshot");
        return;
    }

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&state, &mut sender, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            frame = broadcast_rx.recv() => {
                match frame {
                    Ok(frame) => {
                        if sender.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    // Missed frames are stale snapshots; skip ahead.
                    Err(RecvError::Lagged(skipped)) => {
                        log::debug!("[WS] Client lagged {skipped} frames");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    log::info!("[WS] Client disconnected");
}

async fn handle_client_message(
    state: &AppState,
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    text: &str,
) {
    match serde_json::from_str::<WsIncoming>(text) {
        Ok(WsIncoming::GetConfig) => {
            let reply = config_frame(state).to_string();
            let _ = sender.send(Message::Text(reply.into())).await;
        }
        Ok(WsIncoming::UpdateSettings { .. }) => {
            log::info!("[WS] updateSettings received, ignored (reserved)");
        }
        Err(e) => {
            log::debug!("[WS] Ignoring malformed client message: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_deserialize() {
        assert!(matches!(
            serde_json::from_str::<WsIncoming>(r#"{"type":"getConfig"}"#),
            Ok(WsIncoming::GetConfig)
        ));
        assert!(matches!(
            serde_json::from_str::<WsIncoming>(
                r#"{"type":"updateSettings","updateIntervalMs":250}"#
            ),
            Ok(WsIncoming::UpdateSettings { .. })
        ));
        assert!(serde_json::from_str::<WsIncoming>("not json").is_err());
        assert!(serde_json::from_str::<WsIncoming>(r#"{"type":"reboot"}"#).is_err());
    }
}
