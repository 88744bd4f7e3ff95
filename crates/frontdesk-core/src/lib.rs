//! Shared vocabulary for the frontdesk support-chat stack
//!
//! Identity (peers, rooms, devices), conversation transcripts, and
//! configuration used by both the relay service and the visitor widget.

pub mod config;
pub mod identity;
pub mod transcript;

pub use config::{FrontdeskConfig, RelayConfig, WidgetConfig};
pub use identity::{IdentityError, PeerRole};
pub use transcript::{ChatRole, Transcript, TranscriptEntry, RECENT_HISTORY_LIMIT};
