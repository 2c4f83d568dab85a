//! Interactive terminal over WebSocket.
//!
//! Message framing: client sends `input`/`resize`, server sends
//! `output`/`error`/`exit`. All sandbox output passes through the sanitizer
//! before transmission. Closing the socket closes the sandbox's stdin but
//! never the sandbox itself, so a later reconnect is possible until the
//! session's own lifecycle tears it down.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use lablite::sanitizer::sanitize_output;

use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

pub async fn terminal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_terminal(state, id, socket))
}

async fn handle_terminal(state: AppState, id: String, socket: WebSocket) {
    let session = match state.manager.get_session(&id) {
        Ok(session) => session,
        Err(_) => return reject(socket, "session not found").await,
    };
    let Some(sandbox_id) = session.sandbox_id.clone() else {
        return reject(socket, "session has no sandbox yet").await;
    };
    if !session.status.terminal_attachable() {
        return reject(socket, &format!("session is {}", session.status)).await;
    }

    let handle = match state.manager.provider().attach(&sandbox_id).await {
        Ok(handle) => handle,
        Err(error) => {
            warn!(session_id = %id, sandbox_id = %sandbox_id, %error, "terminal attach failed");
            return reject(socket, "failed to attach to sandbox").await;
        }
    };
    let (mut output, mut input, resize) = handle.split();
    let (mut sender, mut receiver) = socket.split();
    debug!(session_id = %id, sandbox_id = %sandbox_id, "terminal attached");

    let pump = tokio::spawn(async move {
        while let Some(chunk) = output.next().await {
            let message = match chunk {
                Ok(bytes) => {
                    let text = sanitize_output(&String::from_utf8_lossy(&bytes));
                    json!({ "type": "output", "data": text })
                }
                Err(error) => {
                    warn!(%error, "sandbox output stream error");
                    json!({ "type": "error", "message": "sandbox output stream error" })
                }
            };
            if sender
                .send(Message::Text(message.to_string().into()))
                .await
                .is_err()
            {
                return;
            }
        }
        let _ = sender
            .send(Message::Text(json!({ "type": "exit" }).to_string().into()))
            .await;
    });

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Input { data }) => {
                    if input.write_all(data.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Ok(ClientMessage::Resize { cols, rows }) => resize(cols, rows),
                Err(error) => debug!(%error, "ignoring malformed terminal message"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Client is gone: close the sandbox's stdin, leave the sandbox running.
    let _ = input.shutdown().await;
    pump.abort();
    debug!(session_id = %id, "terminal detached");
}

async fn reject(mut socket: WebSocket, message: &str) {
    let _ = socket
        .send(Message::Text(
            json!({ "type": "error", "message": message }).to_string().into(),
        ))
        .await;
    let _ = socket.send(Message::Close(None)).await;
}
