use crate::server::history_body;
use crate::state::AppState;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use maestro_core::SessionEvent;
use maestro_session::SessionStore;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Attach to an existing session instead of opening a fresh one.
    pub session_id: Option<Uuid>,
}

/// Client frames on the bidirectional socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Message {
        content: String,
        context: Option<serde_json::Value>,
    },
    Ping,
    GetHistory,
    Close,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.session_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, requested: Option<Uuid>) {
    // Adopt the requested session when it is still alive, otherwise open a
    // fresh one. A socket disconnect never closes the session.
    let session_id = match requested {
        Some(id) if state.sessions.get(id).await.is_ok() => id,
        _ => state.sessions.create(None, HashMap::new()).await.id,
    };
    info!(session_id = %session_id, "socket connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let _ = tx.send(
        serde_json::json!({"type": "connected", "session_id": session_id}).to_string(),
    );

    // Event queue → outbound channel. Every transport shares the session's
    // queue, so this socket sees the same ordering as any SSE reader.
    let forward_cancel = CancellationToken::new();
    let forwarder = tokio::spawn(forward_events(
        state.sessions.clone(),
        session_id,
        tx.clone(),
        forward_cancel.clone(),
    ));

    // Outbound channel → socket.
    let sender = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            WsMessage::Text(text) => {
                if handle_frame(&state, session_id, &text, &tx).await {
                    break;
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    forward_cancel.cancel();
    forwarder.abort();
    sender.abort();
    info!(session_id = %session_id, "socket disconnected");
}

/// Returns true when the connection should end.
async fn handle_frame(
    state: &Arc<AppState>,
    session_id: Uuid,
    text: &str,
    tx: &mpsc::UnboundedSender<String>,
) -> bool {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(session_id = %session_id, error = %e, "unparseable socket frame");
            let _ = tx.send(
                serde_json::json!({
                    "type": "error",
                    "code": "InvalidRequest",
                    "message": format!("unrecognized frame: {e}"),
                })
                .to_string(),
            );
            return false;
        }
    };

    match frame {
        ClientFrame::Ping => {
            let _ = tx.send(serde_json::json!({"type": "pong"}).to_string());
            false
        }
        ClientFrame::GetHistory => {
            match state.sessions.get(session_id).await {
                Ok(session) => {
                    let _ = tx.send(history_body(&session.messages).to_string());
                }
                Err(e) => {
                    let _ = tx.send(
                        serde_json::json!({
                            "type": "error",
                            "code": e.kind(),
                            "message": e.to_string(),
                        })
                        .to_string(),
                    );
                }
            }
            false
        }
        ClientFrame::Message { content, context } => {
            // Run the request in its own task so pings keep being served;
            // progress and the terminal event arrive via the forwarder.
            let state = state.clone();
            tokio::spawn(async move {
                if let Err(e) = state
                    .scheduler
                    .handle_message(session_id, &content, context.as_ref(), None, None)
                    .await
                {
                    // Already surfaced as a terminal error event.
                    warn!(session_id = %session_id, error = %e, "socket request failed");
                }
            });
            false
        }
        ClientFrame::Close => {
            if let Err(e) = state.sessions.close(session_id).await {
                warn!(session_id = %session_id, error = %e, "close failed");
            }
            // Let the forwarder flush the terminal `closed` event first.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            true
        }
    }
}

/// Pump retained and future events into the outbound channel, stopping at
/// session close or socket teardown.
async fn forward_events(
    sessions: Arc<SessionStore>,
    session_id: Uuid,
    tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) {
    let mut cursor = 0;
    loop {
        let (batch, next) = match sessions.dequeue_events(session_id, cursor, &cancel).await {
            Ok(pair) => pair,
            Err(_) => break,
        };
        if batch.is_empty() {
            break;
        }
        cursor = next;
        let mut session_closed = false;
        for queued in batch {
            if matches!(queued.event, SessionEvent::Closed) {
                session_closed = true;
            }
            let frame =
                serde_json::to_string(&queued.event).unwrap_or_else(|_| "{}".to_string());
            if tx.send(frame).is_err() {
                return;
            }
        }
        if session_closed {
            break;
        }
    }
}
