//! WebSocket transport for browser-hosted webviews.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::{
    bridge::WebviewBridge,
    protocol::{OutboundMessage, WebviewMessage},
};

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(bridge): State<WebviewBridge>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, bridge))
}

async fn handle_socket(socket: WebSocket, bridge: WebviewBridge) {
    let (mut sender, mut receiver) = socket.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<WebviewMessage>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });
    let serve_task = tokio::spawn(bridge.serve(in_rx, out_tx.clone()));

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s.into(),
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        match serde_json::from_str::<WebviewMessage>(&msg) {
            Ok(message) => {
                if in_tx.send(message).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("Invalid webview message: {e}");
                let _ = out_tx.send(OutboundMessage::error(format!("Invalid message: {e}")));
            }
        }
    }

    drop(in_tx);
    let _ = serve_task.await;
    send_task.abort();
    tracing::info!("webview socket closed");
}

/// Create WebSocket router serving `/ws`.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(bridge));
/// ```
#[must_use]
pub fn create_ws_router(bridge: WebviewBridge) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(bridge)
}
