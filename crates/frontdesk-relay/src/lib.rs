//! frontdesk-relay — hand-off relay service
//!
//! Per-conversation rooms over WebSocket: presence, chat fan-out, liveness
//! probes, and the registry that owns room lifecycle. One actor task per
//! room serializes all of its state changes.

pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;

pub use protocol::{PeerInfo, RelayMessage};
pub use registry::RoomRegistry;
pub use room::{JoinAck, Room, RoomClosed, RoomHandle, RoomInfo};
pub use server::{RelayServer, build_router};
