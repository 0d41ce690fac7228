//! Push channel (spec.md §6: "each message is a JSON object with a `type`
//! field drawn from `{job_update, title_update, drive_event,
//! titles_discovered, subtitle_event}`"). One connection per subscriber;
//! every [`DomainEvent`] published to the bus is forwarded verbatim as a
//! JSON text frame.
//!
//! Grounded on the teacher's `handle_websocket.rs`: split the socket,
//! spawn a forwarding task for outgoing messages, and loop on incoming
//! frames in the handler task for ping/close handling and cleanup.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};

use crate::state::AppState;

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.events.subscribe();

    let mut forward_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "websocket subscriber fell behind the event bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "websocket read error");
                        break;
                    }
                }
            }
            _ = &mut forward_task => break,
        }
    }

    forward_task.abort();
}
