//! Relay WebSocket host
//!
//! axum application exposing the room endpoint plus health and room-info.
//! Identity problems are rejected with a plain 400 before the upgrade; once
//! a socket is up, its frames map onto room operations and nothing a single
//! peer does can take the room down.

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use frontdesk_core::{RelayConfig, identity};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::RelayMessage;
use crate::registry::RoomRegistry;
use crate::room::RoomHandle;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<RoomRegistry>,
}

/// The relay host service.
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<RoomRegistry>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self { config, registry: RoomRegistry::new() }
    }

    pub fn registry(&self) -> Arc<RoomRegistry> {
        self.registry.clone()
    }

    /// Bind and serve until the process is stopped.
    pub async fn serve(&self) -> Result<()> {
        let addr = self.config.listen_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind relay host on {addr}"))?;
        info!("Relay host listening on {}", addr);
        axum::serve(listener, build_router(self.registry.clone()))
            .await
            .context("relay host stopped unexpectedly")?;
        Ok(())
    }
}

/// Build the axum router. Split out so tests can serve it on an ephemeral
/// listener. The widget is embedded cross-origin, hence the permissive CORS.
pub fn build_router(registry: Arc<RoomRegistry>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/chat/room/{room_id}", get(relay_ws_handler))
        .route("/chat/room/{room_id}/info", get(room_info_handler))
        .layer(CorsLayer::permissive())
        .with_state(RelayState { registry })
}

/// Connection query parameters. The wire casing comes from the widget.
#[derive(Debug, Deserialize)]
struct RelayQuery {
    #[serde(rename = "peerID")]
    peer_id: Option<String>,
    #[serde(rename = "roomID")]
    room_id: Option<String>,
    nickname: Option<String>,
}

async fn health_handler(State(state): State<RelayState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "frontdesk-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "rooms": state.registry.len(),
    }))
}

async fn room_info_handler(
    Path(room_id): Path<String>,
    State(state): State<RelayState>,
) -> Response {
    match state.registry.room_info(&room_id).await {
        Some(info) => Json(info).into_response(),
        None => (StatusCode::NOT_FOUND, "Room not found").into_response(),
    }
}

async fn relay_ws_handler(
    ws: WebSocketUpgrade,
    Path(path_room_id): Path<String>,
    Query(query): Query<RelayQuery>,
    State(state): State<RelayState>,
) -> Response {
    let (Some(peer_id), Some(room_id)) = (
        query.peer_id.filter(|id| !id.trim().is_empty()),
        query.room_id.filter(|id| !id.trim().is_empty()),
    ) else {
        return (StatusCode::BAD_REQUEST, "Missing peerID or roomID").into_response();
    };

    if let Err(e) = identity::validate_identity(&peer_id, &room_id) {
        warn!("Rejecting relay connection for {}: {}", peer_id, e);
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    if path_room_id != room_id {
        // The query parameter is authoritative; the path only routes.
        debug!("Path room {} differs from query room {}", path_room_id, room_id);
    }

    let display_name = identity::sanitize_display_name(query.nickname.as_deref(), &peer_id);
    ws.on_upgrade(move |socket| handle_relay_socket(socket, state, room_id, peer_id, display_name))
}

async fn handle_relay_socket(
    socket: WebSocket,
    state: RelayState,
    room_id: String,
    peer_id: String,
    display_name: String,
) {
    let conn_id = Uuid::new_v4().to_string();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (room, ack) = state
        .registry
        .join(&room_id, &peer_id, &display_name, &conn_id, outbound_tx)
        .await;
    info!(
        "Peer {} connected to room {} (conn {}, {} peers{})",
        peer_id,
        room_id,
        conn_id,
        ack.peers,
        if ack.superseded { ", superseded previous connection" } else { "" }
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            // Room → socket. The queue closing means the session was removed
            // or superseded; close the socket from our side.
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(msg) => {
                        let frame = match serde_json::to_string(&msg) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("Failed to serialize {} frame for {}: {}", msg.kind(), peer_id, e);
                                continue;
                            }
                        };
                        if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                            debug!("Socket send to peer {} failed", peer_id);
                            break;
                        }
                    }
                    None => {
                        debug!("Session for peer {} ended by the room, closing socket", peer_id);
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            // Socket → room.
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => handle_frame(&room, &peer_id, &text).await,
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Peer {} disconnected from room {}", peer_id, room_id);
                        break;
                    }
                    Some(Err(e)) => {
                        debug!("Socket error for peer {}: {}", peer_id, e);
                        break;
                    }
                    // Binary and ping/pong control frames carry nothing here.
                    _ => {}
                }
            }
        }
    }

    room.leave(&peer_id, &conn_id);
}

/// Map one inbound text frame to a room operation. Malformed or out-of-place
/// frames are logged and dropped; the connection stays open.
async fn handle_frame(room: &RoomHandle, peer_id: &str, text: &str) {
    let msg: RelayMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Unparseable frame from peer {}: {}", peer_id, e);
            return;
        }
    };

    match msg {
        RelayMessage::Chat { display_name, text, .. } => {
            let advisory = (!display_name.trim().is_empty()).then_some(display_name);
            if let Err(e) = room.relay(peer_id, advisory, text).await {
                warn!("Chat from peer {} dropped: {}", peer_id, e);
            }
        }
        RelayMessage::Ping => room.keep_alive(peer_id),
        RelayMessage::RosterRequest => room.roster(peer_id),
        RelayMessage::Unknown => {
            warn!("Peer {} sent an unrecognized frame type, dropping", peer_id);
        }
        other if other.is_room_originated() => {
            warn!("Peer {} sent a room-originated {} frame, dropping", peer_id, other.kind());
        }
        other => {
            warn!("Peer {} sent an unexpected {} frame, dropping", peer_id, other.kind());
        }
    }
}
