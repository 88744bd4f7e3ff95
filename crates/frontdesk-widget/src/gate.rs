//! Admission decisions for visitor messages
//!
//! Ban status and quota refusals arrive fused with backend responses; this
//! module owns the decision vocabulary and the session-local quota
//! bookkeeping.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which rate-limit window refused the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaWindow {
    Daily,
    ShortWindow,
}

/// Outcome of consulting the gate for one visitor message.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Allow {
        remaining: u32,
    },
    /// Terminal for the session: the widget freezes and stops all traffic.
    Banned {
        reason: String,
    },
    QuotaExceeded {
        window: QuotaWindow,
        retry_hint: Option<String>,
    },
}

impl GateDecision {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GateDecision::Banned { .. })
    }
}

/// Session-local remaining-quota bookkeeping.
///
/// Server reports only ever move the counter down. Responses can arrive out
/// of order, so a value above the current one is stale and is ignored.
#[derive(Debug, Clone)]
pub struct QuotaTracker {
    remaining: u32,
}

impl QuotaTracker {
    pub fn new(initial: u32) -> Self {
        Self { remaining: initial }
    }

    /// Fold in a server-reported remaining count. Returns true when the
    /// counter moved.
    pub fn observe(&mut self, server_value: u32) -> bool {
        if server_value < self.remaining {
            self.remaining = server_value;
            return true;
        }
        if server_value > self.remaining {
            debug!(
                "Ignoring stale quota report {} (current {})",
                server_value, self.remaining
            );
        }
        false
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}
