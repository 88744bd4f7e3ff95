//! Peer, room, and device identity
//!
//! Identity strings travel in URLs and log lines, so the relay validates
//! them at the connection boundary before any room sees them.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Namespace prefix that marks a peer id as a support agent.
pub const AGENT_PEER_PREFIX: &str = "agent_";

/// Maximum peer id length
const MAX_PEER_ID_LEN: usize = 128;

/// Maximum room id length
const MAX_ROOM_ID_LEN: usize = 128;

/// Maximum display name length
pub const MAX_DISPLAY_NAME_LEN: usize = 64;

/// Role of a peer inside a relay room, derived from the peer id namespace.
/// The role is never taken from a payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Visitor,
    Agent,
}

impl PeerRole {
    /// Classify a peer id by its namespace prefix. Anything not
    /// agent-namespaced is a visitor.
    pub fn from_peer_id(peer_id: &str) -> Self {
        if peer_id.starts_with(AGENT_PEER_PREFIX) {
            PeerRole::Agent
        } else {
            PeerRole::Visitor
        }
    }

    pub fn is_agent(&self) -> bool {
        matches!(self, PeerRole::Agent)
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Visitor => write!(f, "visitor"),
            PeerRole::Agent => write!(f, "agent"),
        }
    }
}

/// Why an identity string was rejected at the connection boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),
    #[error("{0} too long")]
    TooLong(&'static str),
    #[error("{0} contains invalid characters")]
    InvalidCharacters(&'static str),
}

fn validate_field(value: &str, label: &'static str, max_len: usize) -> Result<(), IdentityError> {
    if value.trim().is_empty() {
        return Err(IdentityError::Empty(label));
    }
    if value.len() > max_len {
        return Err(IdentityError::TooLong(label));
    }
    // Ids end up in URLs and filenames on the agent side; reject path
    // separators, traversal patterns, and control characters outright.
    if value.contains('/') || value.contains('\\') || value.contains("..") || value.contains('\0') {
        return Err(IdentityError::InvalidCharacters(label));
    }
    if value.chars().any(|c| c.is_control()) {
        return Err(IdentityError::InvalidCharacters(label));
    }
    Ok(())
}

/// Validate a peer id presented on a relay connection.
pub fn validate_peer_id(peer_id: &str) -> Result<(), IdentityError> {
    validate_field(peer_id, "peer id", MAX_PEER_ID_LEN)
}

/// Validate a room id presented on a relay connection.
pub fn validate_room_id(room_id: &str) -> Result<(), IdentityError> {
    validate_field(room_id, "room id", MAX_ROOM_ID_LEN)
}

/// Validate the identity pair a connection presents. Runs before the
/// WebSocket upgrade, so failures map to a plain HTTP rejection.
pub fn validate_identity(peer_id: &str, room_id: &str) -> Result<(), IdentityError> {
    validate_peer_id(peer_id)?;
    validate_room_id(room_id)?;
    Ok(())
}

/// Clamp a display name to something printable, falling back to the peer id
/// when the nickname is absent or empty.
pub fn sanitize_display_name(raw: Option<&str>, peer_id: &str) -> String {
    let name = raw.map(str::trim).filter(|s| !s.is_empty()).unwrap_or(peer_id);
    let cleaned: String = name.chars().filter(|c| !c.is_control()).collect();
    if cleaned.chars().count() > MAX_DISPLAY_NAME_LEN {
        cleaned.chars().take(MAX_DISPLAY_NAME_LEN).collect()
    } else {
        cleaned
    }
}

/// Mint a room id for a fresh hand-off conversation.
pub fn mint_room_id(device_id: &str) -> String {
    format!("support_{}_{}", device_id, Utc::now().timestamp_millis())
}

/// Mint the visitor-side peer id paired with a hand-off room.
pub fn mint_visitor_peer_id(device_id: &str) -> String {
    format!("visitor_{}_{}", device_id, Utc::now().timestamp_millis())
}

/// Mint an agent-namespaced peer id for a support console.
pub fn mint_agent_peer_id(tag: &str) -> String {
    format!("{}{}", AGENT_PEER_PREFIX, tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_peer_id() {
        assert_eq!(PeerRole::from_peer_id("agent_kav"), PeerRole::Agent);
        assert_eq!(PeerRole::from_peer_id("visitor_abc_17"), PeerRole::Visitor);
        assert_eq!(PeerRole::from_peer_id("something_else"), PeerRole::Visitor);
        // Prefix must match exactly, no case folding
        assert_eq!(PeerRole::from_peer_id("Agent_kav"), PeerRole::Visitor);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(PeerRole::Agent.to_string(), "agent");
        assert_eq!(PeerRole::Visitor.to_string(), "visitor");
    }

    #[test]
    fn test_validate_identity_accepts_minted_ids() {
        let room = mint_room_id("dev42");
        let peer = mint_visitor_peer_id("dev42");
        assert!(validate_identity(&peer, &room).is_ok());
        assert!(room.starts_with("support_dev42_"));
        assert!(peer.starts_with("visitor_dev42_"));
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert_eq!(validate_peer_id(""), Err(IdentityError::Empty("peer id")));
        assert_eq!(validate_peer_id("   "), Err(IdentityError::Empty("peer id")));
        assert_eq!(validate_room_id(""), Err(IdentityError::Empty("room id")));
    }

    #[test]
    fn test_validate_rejects_path_traversal() {
        assert!(validate_peer_id("../etc/passwd").is_err());
        assert!(validate_peer_id("foo/bar").is_err());
        assert!(validate_room_id("foo\\bar").is_err());
        assert!(validate_room_id("..").is_err());
    }

    #[test]
    fn test_validate_rejects_control_chars() {
        assert!(validate_peer_id("foo\0bar").is_err());
        assert!(validate_peer_id("foo\nbar").is_err());
    }

    #[test]
    fn test_validate_rejects_too_long() {
        let long = "a".repeat(129);
        assert!(validate_peer_id(&long).is_err());
        assert!(validate_room_id(&long).is_err());
    }

    #[test]
    fn test_sanitize_display_name() {
        assert_eq!(sanitize_display_name(Some("Sam"), "visitor_1"), "Sam");
        assert_eq!(sanitize_display_name(Some("  "), "visitor_1"), "visitor_1");
        assert_eq!(sanitize_display_name(None, "visitor_1"), "visitor_1");
        assert_eq!(sanitize_display_name(Some("a\u{7}b"), "p"), "ab");
        let long = "x".repeat(200);
        assert_eq!(sanitize_display_name(Some(&long), "p").len(), MAX_DISPLAY_NAME_LEN);
    }

    #[test]
    fn test_agent_peer_id_classifies_as_agent() {
        let id = mint_agent_peer_id("console-1");
        assert_eq!(PeerRole::from_peer_id(&id), PeerRole::Agent);
    }
}
