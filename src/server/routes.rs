//! HTTP/websocket surface for the relay hub.
//!
//! One websocket endpoint per document plus a health check. The socket handler
//! owns nothing but plumbing: frames are decoded, handed to the room, and the
//! room's fan-out queue is drained by a dedicated writer task so a slow peer
//! only ever backs up its own queue.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{Json, Response},
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::server::hub::RelayHub;
use crate::sync::protocol::WireMessage;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
}

/// Basic health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "relay hub is running".to_string(),
    })
}

/// Websocket upgrade handler for one document's room.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(doc_id): Path<String>,
    State(hub): State<Arc<RelayHub>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub, doc_id))
}

/// Drives one attached session: reader loop here, writer loop in a spawned
/// task draining the session's bounded queue.
async fn handle_socket(socket: WebSocket, hub: Arc<RelayHub>, doc_id: String) {
    let (session, room, mut queue) = hub.join(&doc_id);
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(msg) = queue.recv().await {
            let Ok(text) = msg.encode() else { continue };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        // Queue closed: the hub dropped this session, or the room is gone.
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match WireMessage::decode(&text) {
                Ok(msg) => {
                    for reply in room.handle_message(session, msg) {
                        if room.send_to(session, reply).is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    warn!(doc = %doc_id, session, error = %e, "undecodable frame, ignoring");
                }
            },
            Ok(Message::Close(_)) => {
                info!(doc = %doc_id, session, "session closed by client");
                break;
            }
            Ok(_) => {
                // Ping/pong are answered by the websocket layer; binary frames
                // are not part of the protocol.
            }
            Err(e) => {
                warn!(doc = %doc_id, session, error = %e, "websocket error");
                break;
            }
        }
    }

    hub.leave(&doc_id, session);
    writer.abort();
}

/// Creates and configures the relay hub router.
pub fn create_router(hub: Arc<RelayHub>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/:doc_id", get(ws_handler))
        .with_state(hub)
}
