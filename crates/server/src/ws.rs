//! WebSocket handler
//!
//! `/ws/sessions/{id}` streams a session's live events as JSON text frames.
//! Only the session owner may subscribe. A disconnect never cancels an
//! in-flight turn; the client recovers missed output from history. A
//! subscriber that lags past its buffer is dropped so it cannot hold back
//! the producer or its peers.

use axum::{
    extract::{
        ws::{Message as WsFrame, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;

use parley_core::ChatEvent;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Handle the WebSocket upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let session_id = user.owned_session(&id)?;
    let events = state.orchestrator.subscribe(&session_id).await?;

    tracing::debug!(session_id = %session_id, "WebSocket subscriber joined");
    Ok(ws.on_upgrade(move |socket| forward_events(socket, events)))
}

/// Pump bus events to the client until either side goes away.
async fn forward_events(socket: WebSocket, mut events: broadcast::Receiver<ChatEvent>) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let frame = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!(error = %e, "Event serialization failed");
                            continue;
                        }
                    };
                    if sink.send(WsFrame::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Slow consumer: drop it rather than stall the bus.
                    tracing::warn!(missed, "WebSocket subscriber lagged, dropping");
                    let _ = sink.send(WsFrame::Close(None)).await;
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // Session binding torn down (deletion or eviction).
                    let _ = sink.send(WsFrame::Close(None)).await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                // Clients only ever send pings/close; any payload is ignored.
                Some(Ok(WsFrame::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
        }
    }

    tracing::debug!("WebSocket subscriber left");
}
