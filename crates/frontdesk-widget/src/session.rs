//! The visitor-side conversation automaton
//!
//! One task owns all session state and consumes a single stream of events:
//! host commands, relay traffic, dial outcomes, and timer firings. Backend
//! calls are awaited inline; the relay dial runs as its own task so a relay
//! that accepts the socket but never finishes the handshake cannot starve
//! the queue. Every event is interpreted against the mode that is current
//! when it is processed, not when it was produced. Stale timer, dial, and
//! relay events are dropped by attempt and mode guards.

use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use frontdesk_core::{
    ChatRole, RECENT_HISTORY_LIMIT, Transcript, TranscriptEntry, WidgetConfig, identity,
};
use frontdesk_relay::protocol::RelayMessage;

use crate::backend::{InitChatOutcome, SendOutcome, SupportBackend};
use crate::gate::{GateDecision, QuotaTracker, QuotaWindow};
use crate::machine::ConversationMode;
use crate::relay_link::{HandoffTicket, RelayConnector, RelayEvent, RelayLink};

const GREETING: &str = "Hi! How can we help you today?";
const INIT_FAILED_MSG: &str = "Chat could not be initialized. Please reload the page.";
const NOT_READY_MSG: &str = "Chat is not ready. Please reload the page.";
const GENERIC_ERROR_MSG: &str = "Something went wrong. Please try again.";
const DAILY_LIMIT_MSG: &str = "You have reached today's message limit. Please come back tomorrow.";
const SHORT_WINDOW_MSG: &str = "You're sending messages too quickly. Give it a few seconds.";
const CONNECTING_MSG: &str = "Connecting you to a support agent...";
const CONNECTED_MSG: &str = "You are connected. An agent will be with you shortly.";
const TIMEOUT_MSG: &str = "No agent is available right now. You're back with the assistant.";
const CANCELLED_MSG: &str = "Request cancelled. You're back with the assistant.";
const CONNECT_FAILED_MSG: &str = "Could not reach live support. You're back with the assistant.";
const HANDOFF_FAILED_MSG: &str = "Could not request live support. Please try again.";
const DISCONNECTED_MSG: &str = "The live session ended.";

/// Host → session commands.
#[derive(Debug, Clone)]
pub enum WidgetCommand {
    SendMessage(String),
    RequestHandoff,
    CancelHandoff,
    Shutdown,
}

/// Session → host updates, in the order the UI should apply them.
#[derive(Debug, Clone, PartialEq)]
pub enum WidgetUpdate {
    /// A transcript line: visitor, assistant, or system notice.
    Message { role: ChatRole, content: String },
    /// A live message from a human agent.
    AgentMessage { display_name: String, content: String },
    InputState { enabled: bool },
    Quota { remaining: u32 },
    Mode { mode: ConversationMode },
    /// The assistant suggests a hand-off. Requires explicit confirmation;
    /// nothing changes until the visitor acts on it.
    HandoffOffered,
    /// Terminal freeze with the ban reason.
    Frozen { reason: String },
}

enum SessionEvent {
    Command(WidgetCommand),
    Relay(RelayEvent),
    DialFinished { attempt: u64, result: Result<RelayLink> },
    HandoffTimeout { attempt: u64 },
    DisconnectGraceElapsed { attempt: u64 },
    CooldownElapsed,
}

/// Clone-able front for a running widget session.
#[derive(Clone)]
pub struct WidgetHandle {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl WidgetHandle {
    pub fn send_message(&self, text: impl Into<String>) {
        self.command(WidgetCommand::SendMessage(text.into()));
    }

    pub fn request_handoff(&self) {
        self.command(WidgetCommand::RequestHandoff);
    }

    pub fn cancel_handoff(&self) {
        self.command(WidgetCommand::CancelHandoff);
    }

    pub fn shutdown(&self) {
        self.command(WidgetCommand::Shutdown);
    }

    pub fn command(&self, cmd: WidgetCommand) {
        let _ = self.tx.send(SessionEvent::Command(cmd));
    }
}

/// The session task. Construct with [`WidgetSession::spawn`].
pub struct WidgetSession {
    config: WidgetConfig,
    backend: Arc<dyn SupportBackend>,
    connector: Arc<dyn RelayConnector>,
    updates: mpsc::UnboundedSender<WidgetUpdate>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    mode: ConversationMode,
    transcript: Transcript,
    device_id: Option<String>,
    quota: Option<QuotaTracker>,
    daily_exhausted: bool,
    cooldown_active: bool,
    link: Option<RelayLink>,
    ticket: Option<HandoffTicket>,
    /// Bumped on every hand-off attempt; timer events carry the value they
    /// were armed with so a late firing from a finished attempt is inert.
    attempt: u64,
    dial_task: Option<JoinHandle<()>>,
    handoff_timer: Option<JoinHandle<()>>,
    grace_timer: Option<JoinHandle<()>>,
}

impl WidgetSession {
    /// Start the session task. The session initializes against the backend
    /// before it processes any command; updates stream out in UI order.
    pub fn spawn(
        config: WidgetConfig,
        backend: Arc<dyn SupportBackend>,
        connector: Arc<dyn RelayConnector>,
        fingerprint: Value,
    ) -> (WidgetHandle, mpsc::UnboundedReceiver<WidgetUpdate>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let session = WidgetSession {
            config,
            backend,
            connector,
            updates: updates_tx,
            events_tx: events_tx.clone(),
            mode: ConversationMode::Assistant,
            transcript: Transcript::new(),
            device_id: None,
            quota: None,
            daily_exhausted: false,
            cooldown_active: false,
            link: None,
            ticket: None,
            attempt: 0,
            dial_task: None,
            handoff_timer: None,
            grace_timer: None,
        };
        tokio::spawn(session.run(events_rx, fingerprint));

        (WidgetHandle { tx: events_tx }, updates_rx)
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>, fingerprint: Value) {
        self.initialize(&fingerprint).await;

        loop {
            let event = tokio::select! {
                relay = async {
                    match self.link.as_mut() {
                        Some(link) => link.recv().await,
                        None => std::future::pending::<Option<RelayEvent>>().await,
                    }
                } => match relay {
                    Some(event) => SessionEvent::Relay(event),
                    None => SessionEvent::Relay(RelayEvent::Closed),
                },
                command = events.recv() => match command {
                    Some(event) => event,
                    None => break,
                },
            };

            if !self.handle_event(event).await {
                break;
            }
        }

        self.teardown();
    }

    async fn initialize(&mut self, fingerprint: &Value) {
        match self.backend.init_chat(fingerprint).await {
            Ok(InitChatOutcome::Ready(bootstrap)) => {
                let remaining =
                    bootstrap.remaining_quota.unwrap_or(self.config.default_quota);
                self.device_id = Some(bootstrap.device_id);
                self.quota = Some(QuotaTracker::new(remaining));

                if bootstrap.history.is_empty() {
                    // Greeting is display-only; the transcript starts with
                    // the first real exchange.
                    self.emit(WidgetUpdate::Message {
                        role: ChatRole::Assistant,
                        content: GREETING.to_string(),
                    });
                } else {
                    for entry in &bootstrap.history {
                        self.emit(WidgetUpdate::Message {
                            role: entry.role,
                            content: entry.content.clone(),
                        });
                    }
                    self.transcript.extend(bootstrap.history);
                }

                self.emit(WidgetUpdate::Quota { remaining });
                self.emit(WidgetUpdate::InputState { enabled: true });
                info!("Widget session ready ({} quota left)", remaining);
            }
            Ok(InitChatOutcome::Banned { message }) => {
                info!("Visitor is banned, freezing the widget");
                self.freeze(message);
            }
            Err(e) => {
                warn!("Chat initialization failed: {:#}", e);
                self.notice(INIT_FAILED_MSG);
                self.emit(WidgetUpdate::InputState { enabled: false });
            }
        }
    }

    /// Returns false when the session should stop.
    async fn handle_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Command(WidgetCommand::Shutdown) => return false,
            SessionEvent::Command(cmd) => self.handle_command(cmd).await,
            SessionEvent::Relay(event) => self.handle_relay_event(event),
            SessionEvent::DialFinished { attempt, result } => {
                self.handle_dial_finished(attempt, result)
            }
            SessionEvent::HandoffTimeout { attempt } => self.handle_handoff_timeout(attempt),
            SessionEvent::DisconnectGraceElapsed { attempt } => self.handle_grace_elapsed(attempt),
            SessionEvent::CooldownElapsed => self.handle_cooldown_elapsed(),
        }
        true
    }

    async fn handle_command(&mut self, cmd: WidgetCommand) {
        if self.mode.is_terminal() {
            // A banned session stays inert; nothing reaches the network.
            debug!("Ignoring command in banned mode");
            return;
        }
        match cmd {
            WidgetCommand::SendMessage(text) => self.send_visitor_message(text).await,
            WidgetCommand::RequestHandoff => self.request_handoff().await,
            WidgetCommand::CancelHandoff => self.cancel_handoff(),
            WidgetCommand::Shutdown => {}
        }
    }

    async fn send_visitor_message(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        match self.mode {
            ConversationMode::ConnectedToAgent => self.send_relay_chat(text),
            ConversationMode::Assistant => self.send_assistant_message(text).await,
            _ => {
                // Input is disabled while a hand-off is being set up.
                debug!("Dropping visitor message while {}", self.mode);
            }
        }
    }

    fn send_relay_chat(&mut self, text: String) {
        let Some(link) = &self.link else {
            self.notice(DISCONNECTED_MSG);
            self.set_mode(ConversationMode::Assistant);
            return;
        };
        self.emit(WidgetUpdate::Message { role: ChatRole::User, content: text.clone() });
        if let Err(e) =
            link.send(RelayMessage::outgoing_chat(text, self.config.display_name.clone()))
        {
            // The pump is gone; its closed event is already queued and will
            // drive the disconnect path.
            warn!("Relay send failed: {}", e);
            self.notice(DISCONNECTED_MSG);
        }
    }

    async fn send_assistant_message(&mut self, text: String) {
        let Some(device_id) = self.device_id.clone() else {
            self.notice(NOT_READY_MSG);
            return;
        };
        if self.daily_exhausted {
            self.notice(DAILY_LIMIT_MSG);
            return;
        }
        if self.cooldown_active {
            debug!("Dropping message during the rate-limit cooldown");
            return;
        }

        self.transcript.push(TranscriptEntry::user(text.clone()));
        self.emit(WidgetUpdate::Message { role: ChatRole::User, content: text.clone() });
        self.emit(WidgetUpdate::InputState { enabled: false });

        let recent = self.transcript.recent(RECENT_HISTORY_LIMIT).to_vec();
        match self.backend.send_message(&device_id, &text, &recent).await {
            Ok(SendOutcome::Reply(reply)) => {
                self.transcript.push(TranscriptEntry::assistant(reply.text.clone()));
                self.emit(WidgetUpdate::Message {
                    role: ChatRole::Assistant,
                    content: reply.text,
                });
                if let Some(remaining) = reply.remaining_quota {
                    self.observe_quota(remaining);
                }
                self.emit(WidgetUpdate::InputState { enabled: true });
                if reply.needs_human_support {
                    debug!("Assistant flagged the question for human support");
                    self.emit(WidgetUpdate::HandoffOffered);
                }
            }
            Ok(SendOutcome::Refused(decision)) => self.apply_refusal(decision),
            Err(e) => {
                warn!("Assistant request failed: {:#}", e);
                self.notice(GENERIC_ERROR_MSG);
                self.emit(WidgetUpdate::InputState { enabled: true });
            }
        }
    }

    fn observe_quota(&mut self, remaining: u32) {
        let moved = match self.quota.as_mut() {
            Some(quota) => quota.observe(remaining),
            None => false,
        };
        if moved {
            let value = self.quota.as_ref().map(QuotaTracker::remaining).unwrap_or(0);
            self.emit(WidgetUpdate::Quota { remaining: value });
        }
    }

    fn apply_refusal(&mut self, decision: GateDecision) {
        match decision {
            GateDecision::Banned { reason } => {
                info!("Visitor banned mid-session, freezing the widget");
                self.freeze(reason);
            }
            GateDecision::QuotaExceeded { window: QuotaWindow::Daily, retry_hint } => {
                // Input stays disabled; the daily window resets outside
                // this session's lifetime.
                self.daily_exhausted = true;
                self.notice(retry_hint.unwrap_or_else(|| DAILY_LIMIT_MSG.to_string()));
                self.emit(WidgetUpdate::InputState { enabled: false });
            }
            GateDecision::QuotaExceeded { window: QuotaWindow::ShortWindow, retry_hint } => {
                self.cooldown_active = true;
                self.notice(retry_hint.unwrap_or_else(|| SHORT_WINDOW_MSG.to_string()));
                self.emit(WidgetUpdate::InputState { enabled: false });
                let events = self.events_tx.clone();
                let cooldown = self.config.quota_cooldown();
                tokio::spawn(async move {
                    tokio::time::sleep(cooldown).await;
                    let _ = events.send(SessionEvent::CooldownElapsed);
                });
            }
            GateDecision::Allow { remaining } => {
                // Refusals never carry this variant; fold the number anyway.
                self.observe_quota(remaining);
                self.emit(WidgetUpdate::InputState { enabled: true });
            }
        }
    }

    fn handle_cooldown_elapsed(&mut self) {
        if !self.cooldown_active || self.mode.is_terminal() {
            return;
        }
        self.cooldown_active = false;
        if self.mode == ConversationMode::Assistant && !self.daily_exhausted {
            self.emit(WidgetUpdate::InputState { enabled: true });
        }
    }

    async fn request_handoff(&mut self) {
        if self.mode != ConversationMode::Assistant {
            debug!("Hand-off request ignored while {}", self.mode);
            return;
        }
        let Some(device_id) = self.device_id.clone() else {
            self.notice(NOT_READY_MSG);
            return;
        };

        self.set_mode(ConversationMode::RequestingHandoff);
        self.emit(WidgetUpdate::InputState { enabled: false });
        self.notice(CONNECTING_MSG);

        let ticket = HandoffTicket {
            room_id: identity::mint_room_id(&device_id),
            peer_id: identity::mint_visitor_peer_id(&device_id),
            display_name: self.config.display_name.clone(),
        };

        if let Err(e) = self
            .backend
            .request_human_support(&device_id, &ticket.room_id, &ticket.peer_id)
            .await
        {
            warn!("Hand-off request failed: {:#}", e);
            self.notice(HANDOFF_FAILED_MSG);
            self.set_mode(ConversationMode::Assistant);
            self.emit(WidgetUpdate::InputState { enabled: true });
            return;
        }

        self.set_mode(ConversationMode::WaitingForAgent);
        self.attempt += 1;
        self.arm_handoff_timer(self.attempt);
        self.ticket = Some(ticket.clone());
        self.spawn_dial(ticket);
    }

    /// Dial the relay off the event loop. A relay that accepts the socket
    /// but never completes the handshake must not keep commands and timer
    /// firings from being processed, so the outcome comes back as an event
    /// carrying the attempt that started the dial.
    fn spawn_dial(&mut self, ticket: HandoffTicket) {
        self.abort_dial();
        let attempt = self.attempt;
        let connector = Arc::clone(&self.connector);
        let events = self.events_tx.clone();
        self.dial_task = Some(tokio::spawn(async move {
            let result = connector.connect(&ticket).await;
            let _ = events.send(SessionEvent::DialFinished { attempt, result });
        }));
    }

    fn handle_dial_finished(&mut self, attempt: u64, result: Result<RelayLink>) {
        if attempt != self.attempt || self.mode != ConversationMode::WaitingForAgent {
            debug!("Discarding a relay link from a finished attempt");
            if let Ok(link) = result {
                link.close();
            }
            return;
        }
        self.dial_task = None;
        match result {
            Ok(link) => {
                info!("Relay link open for hand-off attempt {}", attempt);
                self.link = Some(link);
            }
            Err(e) => {
                warn!("Relay connection failed: {:#}", e);
                self.abort_waiting(CONNECT_FAILED_MSG);
            }
        }
    }

    fn abort_dial(&mut self) {
        if let Some(task) = self.dial_task.take() {
            task.abort();
        }
    }

    fn cancel_handoff(&mut self) {
        match self.mode {
            ConversationMode::WaitingForAgent | ConversationMode::ConnectedToAgent => {
                info!("Hand-off cancelled by the visitor");
                self.cancel_handoff_timer();
                self.cancel_grace_timer();
                self.close_link();
                self.notice(CANCELLED_MSG);
                self.set_mode(ConversationMode::Assistant);
                self.emit(WidgetUpdate::InputState { enabled: true });
            }
            _ => debug!("Cancel ignored while {}", self.mode),
        }
    }

    fn handle_relay_event(&mut self, event: RelayEvent) {
        if self.mode.is_terminal() {
            return;
        }
        match event {
            RelayEvent::Message(msg) => self.handle_relay_message(msg),
            RelayEvent::Closed => self.handle_relay_closed(),
        }
    }

    fn handle_relay_message(&mut self, msg: RelayMessage) {
        match msg {
            RelayMessage::Connected { room_id, .. } => {
                if self.mode != ConversationMode::WaitingForAgent {
                    debug!("Ignoring relay welcome while {}", self.mode);
                    return;
                }
                self.cancel_handoff_timer();
                self.set_mode(ConversationMode::ConnectedToAgent);
                self.notice(CONNECTED_MSG);
                self.emit(WidgetUpdate::InputState { enabled: true });
                info!("Joined hand-off room {}", room_id);
            }
            RelayMessage::Chat { from_peer_id, display_name, text, .. } => {
                // The room never echoes a sender's own frame; the guard
                // covers a misbehaving relay.
                if self.ticket.as_ref().is_some_and(|t| t.peer_id == from_peer_id) {
                    return;
                }
                self.emit(WidgetUpdate::AgentMessage { display_name, content: text });
            }
            RelayMessage::PresenceJoined { peer_id, display_name, .. } => {
                if frontdesk_core::PeerRole::from_peer_id(&peer_id).is_agent() {
                    self.notice(format!("{display_name} joined the conversation"));
                } else {
                    debug!("Peer {} joined the room", peer_id);
                }
            }
            RelayMessage::PresenceLeft { peer_id, display_name, .. } => {
                if frontdesk_core::PeerRole::from_peer_id(&peer_id).is_agent() {
                    self.notice(format!("{display_name} left the conversation"));
                } else {
                    debug!("Peer {} left the room", peer_id);
                }
            }
            RelayMessage::Pong { roster, .. } | RelayMessage::RosterResponse { roster, .. } => {
                debug!("Room roster has {} other peers", roster.len());
            }
            other => debug!("Ignoring relay {} frame", other.kind()),
        }
    }

    fn handle_relay_closed(&mut self) {
        match self.mode {
            ConversationMode::ConnectedToAgent => {
                info!("Relay link closed, returning to the assistant after a grace pause");
                self.close_link();
                self.notice(DISCONNECTED_MSG);
                self.emit(WidgetUpdate::InputState { enabled: false });
                let attempt = self.attempt;
                let events = self.events_tx.clone();
                let grace = self.config.disconnect_grace();
                self.cancel_grace_timer();
                self.grace_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = events.send(SessionEvent::DisconnectGraceElapsed { attempt });
                }));
            }
            ConversationMode::WaitingForAgent => {
                // The connection dropped before the welcome arrived.
                self.abort_waiting(CONNECT_FAILED_MSG);
            }
            _ => debug!("Relay closed while {}, nothing to do", self.mode),
        }
    }

    fn handle_handoff_timeout(&mut self, attempt: u64) {
        if attempt != self.attempt || self.mode != ConversationMode::WaitingForAgent {
            debug!("Ignoring stale hand-off timer");
            return;
        }
        info!("Hand-off timed out after {:?}", self.config.handoff_timeout());
        self.handoff_timer = None;
        self.close_link();
        self.notice(TIMEOUT_MSG);
        self.set_mode(ConversationMode::Assistant);
        self.emit(WidgetUpdate::InputState { enabled: true });
    }

    fn handle_grace_elapsed(&mut self, attempt: u64) {
        if attempt != self.attempt || self.mode != ConversationMode::ConnectedToAgent {
            debug!("Ignoring stale disconnect-grace timer");
            return;
        }
        self.grace_timer = None;
        self.set_mode(ConversationMode::Assistant);
        if !self.daily_exhausted && !self.cooldown_active {
            self.emit(WidgetUpdate::InputState { enabled: true });
        }
    }

    /// Give up on a pending hand-off and return to the assistant.
    fn abort_waiting(&mut self, message: &str) {
        self.cancel_handoff_timer();
        self.close_link();
        self.notice(message);
        self.set_mode(ConversationMode::Assistant);
        self.emit(WidgetUpdate::InputState { enabled: true });
    }

    fn freeze(&mut self, reason: String) {
        self.set_mode(ConversationMode::Banned);
        self.cancel_handoff_timer();
        self.cancel_grace_timer();
        self.close_link();
        self.emit(WidgetUpdate::Frozen { reason });
        self.emit(WidgetUpdate::InputState { enabled: false });
    }

    fn set_mode(&mut self, next: ConversationMode) {
        if self.mode == next {
            return;
        }
        if !self.mode.can_transition_to(next) {
            warn!("Refusing mode change {} -> {}", self.mode, next);
            return;
        }
        debug!("Mode {} -> {}", self.mode, next);
        self.mode = next;
        self.emit(WidgetUpdate::Mode { mode: next });
    }

    fn arm_handoff_timer(&mut self, attempt: u64) {
        self.cancel_handoff_timer();
        let events = self.events_tx.clone();
        let timeout = self.config.handoff_timeout();
        self.handoff_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(SessionEvent::HandoffTimeout { attempt });
        }));
    }

    fn cancel_handoff_timer(&mut self) {
        if let Some(timer) = self.handoff_timer.take() {
            timer.abort();
        }
    }

    fn cancel_grace_timer(&mut self) {
        if let Some(timer) = self.grace_timer.take() {
            timer.abort();
        }
    }

    /// Dropping the link also drops any relay events still queued on it, so
    /// nothing from a finished attempt leaks into the next one. A dial that
    /// is still in flight is aborted for the same reason.
    fn close_link(&mut self) {
        self.abort_dial();
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.ticket = None;
    }

    fn notice(&self, text: impl Into<String>) {
        self.emit(WidgetUpdate::Message { role: ChatRole::System, content: text.into() });
    }

    fn emit(&self, update: WidgetUpdate) {
        let _ = self.updates.send(update);
    }

    fn teardown(&mut self) {
        self.cancel_handoff_timer();
        self.cancel_grace_timer();
        self.close_link();
        debug!("Widget session ended");
    }
}
