//! Visitor-side support widget
//!
//! Drives one visitor conversation: assistant turns through the gated
//! backend, and the hand-off lifecycle onto a relay room when a human is
//! needed. Hosts spawn a [`WidgetSession`] and speak to it through a
//! [`WidgetHandle`], rendering the [`WidgetUpdate`] stream however they
//! like; nothing in here assumes a particular UI.

pub mod backend;
pub mod gate;
pub mod machine;
pub mod relay_link;
pub mod session;

pub use backend::{
    AssistantReply, ChatBootstrap, HttpSupportBackend, InitChatOutcome, SendOutcome,
    SupportBackend,
};
pub use gate::{GateDecision, QuotaTracker, QuotaWindow};
pub use machine::ConversationMode;
pub use relay_link::{HandoffTicket, RelayConnector, RelayEvent, RelayLink, WsRelayConnector};
pub use session::{WidgetCommand, WidgetHandle, WidgetSession, WidgetUpdate};
