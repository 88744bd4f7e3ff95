//! Conversation modes for the visitor widget
//!
//! The widget is always in exactly one mode, and every network event and
//! visitor action is interpreted against it. Transitions outside the table
//! below are refused, which is what makes late timers and stale relay
//! events harmless.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the widget currently routes visitor input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    /// Default mode: messages go through the gate to the automated assistant.
    Assistant,
    /// Hand-off requested, waiting for the backend to acknowledge it.
    RequestingHandoff,
    /// Relay connection opening or open, welcome not yet received.
    WaitingForAgent,
    /// Live relay session: messages go to the hand-off room.
    ConnectedToAgent,
    /// Terminal mode: all input is inert and no network activity remains.
    Banned,
}

impl ConversationMode {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConversationMode::Banned)
    }

    /// True while a hand-off attempt is somewhere in flight.
    pub fn in_handoff(&self) -> bool {
        matches!(
            self,
            ConversationMode::RequestingHandoff
                | ConversationMode::WaitingForAgent
                | ConversationMode::ConnectedToAgent
        )
    }

    /// Whether visitor input reaches anything in this mode.
    pub fn accepts_input(&self) -> bool {
        matches!(self, ConversationMode::Assistant | ConversationMode::ConnectedToAgent)
    }

    /// Legal mode changes. `Banned` is reachable from everywhere and never
    /// left; everything else follows the hand-off lifecycle.
    pub fn can_transition_to(&self, next: ConversationMode) -> bool {
        use ConversationMode::*;
        if self.is_terminal() {
            return false;
        }
        if next == Banned {
            return true;
        }
        matches!(
            (*self, next),
            (Assistant, RequestingHandoff)
                | (RequestingHandoff, WaitingForAgent)
                | (RequestingHandoff, Assistant)
                | (WaitingForAgent, ConnectedToAgent)
                | (WaitingForAgent, Assistant)
                | (ConnectedToAgent, Assistant)
        )
    }
}

impl fmt::Display for ConversationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConversationMode::Assistant => "assistant",
            ConversationMode::RequestingHandoff => "requesting-handoff",
            ConversationMode::WaitingForAgent => "waiting-for-agent",
            ConversationMode::ConnectedToAgent => "connected-to-agent",
            ConversationMode::Banned => "banned",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConversationMode::*;

    const ALL: [ConversationMode; 5] =
        [Assistant, RequestingHandoff, WaitingForAgent, ConnectedToAgent, Banned];

    #[test]
    fn test_handoff_lifecycle_is_allowed() {
        assert!(Assistant.can_transition_to(RequestingHandoff));
        assert!(RequestingHandoff.can_transition_to(WaitingForAgent));
        assert!(WaitingForAgent.can_transition_to(ConnectedToAgent));
        assert!(ConnectedToAgent.can_transition_to(Assistant));
    }

    #[test]
    fn test_every_waiting_mode_can_fall_back_to_assistant() {
        assert!(RequestingHandoff.can_transition_to(Assistant));
        assert!(WaitingForAgent.can_transition_to(Assistant));
        assert!(ConnectedToAgent.can_transition_to(Assistant));
    }

    #[test]
    fn test_no_skipping_forward() {
        assert!(!Assistant.can_transition_to(WaitingForAgent));
        assert!(!Assistant.can_transition_to(ConnectedToAgent));
        assert!(!RequestingHandoff.can_transition_to(ConnectedToAgent));
        assert!(!ConnectedToAgent.can_transition_to(WaitingForAgent));
    }

    #[test]
    fn test_banned_reachable_from_everywhere_except_itself() {
        for mode in ALL {
            if mode == Banned {
                continue;
            }
            assert!(mode.can_transition_to(Banned), "{mode} should reach banned");
        }
    }

    #[test]
    fn test_banned_is_terminal() {
        for next in ALL {
            assert!(!Banned.can_transition_to(next), "banned must not reach {next}");
        }
        assert!(Banned.is_terminal());
        assert!(!Banned.accepts_input());
    }

    #[test]
    fn test_input_acceptance() {
        assert!(Assistant.accepts_input());
        assert!(ConnectedToAgent.accepts_input());
        assert!(!RequestingHandoff.accepts_input());
        assert!(!WaitingForAgent.accepts_input());
    }

    #[test]
    fn test_in_handoff() {
        assert!(!Assistant.in_handoff());
        assert!(RequestingHandoff.in_handoff());
        assert!(WaitingForAgent.in_handoff());
        assert!(ConnectedToAgent.in_handoff());
        assert!(!Banned.in_handoff());
    }

    #[test]
    fn test_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&WaitingForAgent).unwrap(), "\"waiting_for_agent\"");
        assert_eq!(format!("{ConnectedToAgent}"), "connected-to-agent");
    }
}
