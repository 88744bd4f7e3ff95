//! Relay wire protocol — JSON text frames between peers and a room
//!
//! One closed, internally tagged message set, symmetric across visitor and
//! agent connections. Unknown `type` values fall into [`RelayMessage::Unknown`]
//! so a newer client never kills an older room; unknown fields inside a known
//! variant are ignored.

use chrono::{DateTime, Utc};
use frontdesk_core::PeerRole;
use serde::{Deserialize, Serialize};

/// Directory entry for one peer in a room, as exposed on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: String,
    pub display_name: String,
    pub role: PeerRole,
    pub connected_at: DateTime<Utc>,
}

/// A relay frame. Tag values are kebab-case, payload fields camelCase.
///
/// Inbound `chat` frames may carry only `text` (plus an advisory
/// `displayName`); the room stamps `fromPeerId`, `timestamp`, and `roomId`
/// authoritatively on the outbound copy, never trusting the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RelayMessage {
    /// Welcome to the joiner; `roster` excludes the joiner itself.
    Connected {
        peer_id: String,
        room_id: String,
        display_name: String,
        roster: Vec<PeerInfo>,
    },
    /// Broadcast to everyone else when a peer joins.
    PresenceJoined {
        peer_id: String,
        display_name: String,
        room_id: String,
    },
    /// Broadcast to everyone else when a peer leaves.
    PresenceLeft {
        peer_id: String,
        display_name: String,
        room_id: String,
    },
    /// Chat payload, relayed to every other peer in the room.
    Chat {
        #[serde(default)]
        from_peer_id: String,
        #[serde(default)]
        display_name: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default)]
        room_id: String,
    },
    /// Liveness probe from a peer.
    Ping,
    /// Liveness ack; carries the full roster snapshot.
    Pong {
        timestamp: DateTime<Utc>,
        roster: Vec<PeerInfo>,
        room_id: String,
    },
    /// Explicit roster query from a peer.
    RosterRequest,
    /// Full peer directory, sent only to the requester.
    RosterResponse {
        roster: Vec<PeerInfo>,
        room_id: String,
    },
    /// Any unrecognized `type`: logged and dropped, connection stays open.
    #[serde(other)]
    Unknown,
}

impl RelayMessage {
    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::Connected { .. } => "connected",
            RelayMessage::PresenceJoined { .. } => "presence-joined",
            RelayMessage::PresenceLeft { .. } => "presence-left",
            RelayMessage::Chat { .. } => "chat",
            RelayMessage::Ping => "ping",
            RelayMessage::Pong { .. } => "pong",
            RelayMessage::RosterRequest => "roster-request",
            RelayMessage::RosterResponse { .. } => "roster-response",
            RelayMessage::Unknown => "unknown",
        }
    }

    /// Frames only a room may originate. A client sending one of these is a
    /// protocol error and the frame is dropped.
    pub fn is_room_originated(&self) -> bool {
        matches!(
            self,
            RelayMessage::Connected { .. }
                | RelayMessage::PresenceJoined { .. }
                | RelayMessage::PresenceLeft { .. }
                | RelayMessage::Pong { .. }
                | RelayMessage::RosterResponse { .. }
        )
    }

    /// Minimal outbound chat frame as a client sends it.
    pub fn outgoing_chat(text: impl Into<String>, display_name: impl Into<String>) -> Self {
        RelayMessage::Chat {
            from_peer_id: String::new(),
            display_name: display_name.into(),
            text: text.into(),
            timestamp: None,
            room_id: String::new(),
        }
    }
}
