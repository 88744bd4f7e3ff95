//! Client-side relay connection
//!
//! Owns the WebSocket to a hand-off room. A pump task parses inbound frames
//! and flushes outbound sends; the session talks to it through channels and
//! never touches the socket. Closing is idempotent via a cancellation token,
//! so the session can close on timeout, cancel, and teardown without caring
//! which happened first.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use frontdesk_relay::protocol::RelayMessage;

/// Identity a visitor joins a hand-off room with.
#[derive(Debug, Clone)]
pub struct HandoffTicket {
    pub room_id: String,
    pub peer_id: String,
    pub display_name: String,
}

/// Events surfaced from a live relay link.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Message(RelayMessage),
    /// The link is gone, whatever the reason. Nothing follows it.
    Closed,
}

/// A live connection to a relay room.
pub struct RelayLink {
    outbound: mpsc::UnboundedSender<RelayMessage>,
    events: mpsc::UnboundedReceiver<RelayEvent>,
    cancel: CancellationToken,
}

impl RelayLink {
    pub(crate) fn new(
        outbound: mpsc::UnboundedSender<RelayMessage>,
        events: mpsc::UnboundedReceiver<RelayEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self { outbound, events, cancel }
    }

    /// Queue a frame for the room. Fails only once the link is closed.
    pub fn send(&self, msg: RelayMessage) -> Result<()> {
        self.outbound.send(msg).map_err(|_| anyhow!("relay link is closed"))
    }

    /// Next event from the room. `None` after the pump has shut down.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        self.events.recv().await
    }

    /// Idempotent. The pump sends a close frame and tears the socket down.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// How the widget reaches a relay room. Production uses
/// [`WsRelayConnector`]; tests substitute scripted links.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, ticket: &HandoffTicket) -> Result<RelayLink>;
}

/// Connector speaking WebSocket to the relay host.
pub struct WsRelayConnector {
    base_url: String,
}

impl WsRelayConnector {
    /// `base_url` is the relay host in http, https, ws, or wss form; the
    /// scheme is normalized to WebSocket.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into() }
    }

    /// Room URL with the join identity in the query string.
    pub fn room_url(&self, ticket: &HandoffTicket) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("Invalid relay URL: {}", self.base_url))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => bail!("Unsupported relay URL scheme: {other}"),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("Cannot use {scheme} scheme on {}", self.base_url))?;
        url.set_path(&format!("/chat/room/{}", ticket.room_id));
        url.set_query(None);
        url.query_pairs_mut()
            .append_pair("peerID", &ticket.peer_id)
            .append_pair("roomID", &ticket.room_id)
            .append_pair("nickname", &ticket.display_name);
        Ok(url)
    }
}

#[async_trait]
impl RelayConnector for WsRelayConnector {
    async fn connect(&self, ticket: &HandoffTicket) -> Result<RelayLink> {
        let url = self.room_url(ticket)?;
        debug!("Connecting to relay room at {}", url);
        let (socket, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("Failed to connect to relay room {}", ticket.room_id))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(pump(socket, outbound_rx, event_tx, cancel.clone()));

        Ok(RelayLink::new(outbound_tx, event_rx, cancel))
    }
}

async fn pump(
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound_rx: mpsc::UnboundedReceiver<RelayMessage>,
    event_tx: mpsc::UnboundedSender<RelayEvent>,
    cancel: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            outbound = outbound_rx.recv() => {
                let Some(msg) = outbound else {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                };
                let frame = match serde_json::to_string(&msg) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Failed to serialize relay frame: {}", e);
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<RelayMessage>(&text) {
                        Ok(RelayMessage::Unknown) => {
                            warn!("Relay sent a frame of unknown type, dropping it");
                        }
                        Ok(msg) => {
                            if event_tx.send(RelayEvent::Message(msg)).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Unparseable relay frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("Relay socket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    let _ = event_tx.send(RelayEvent::Closed);
    debug!("Relay link pump ended");
}
