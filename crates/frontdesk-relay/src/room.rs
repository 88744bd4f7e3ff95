//! Room — per-conversation message broker
//!
//! One actor task per active conversation. The actor owns the session map
//! exclusively; every operation arrives as a [`RoomCommand`] on the queue,
//! so joins, chat fan-out, and departures are serialized per room without
//! locks. The actor exits as soon as the room empties, signalling the
//! registry through a vacancy channel.

use chrono::{DateTime, Utc};
use frontdesk_core::PeerRole;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::protocol::{PeerInfo, RelayMessage};

/// One live peer connection registered in a room.
#[derive(Debug)]
struct Session {
    peer_id: String,
    display_name: String,
    role: PeerRole,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    /// Unique per physical connection. A superseded connection's late leave
    /// carries its old conn id and must not evict the replacement session.
    conn_id: String,
    /// Cleared when a delivery fails so the same broadcast pass stops
    /// sending to a peer that is already gone.
    is_alive: bool,
    outbound: mpsc::UnboundedSender<RelayMessage>,
}

impl Session {
    fn send(&self, msg: RelayMessage) -> bool {
        self.outbound.send(msg).is_ok()
    }

    fn roster_entry(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
            connected_at: self.connected_at,
        }
    }
}

/// Acknowledgment returned to a joining connection.
#[derive(Debug, Clone, Copy)]
pub struct JoinAck {
    /// True when this join replaced a previous session under the same peer id.
    pub superseded: bool,
    /// Peers in the room after the join, the joiner included.
    pub peers: usize,
}

/// Read-only snapshot served by the room-info endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_id: String,
    pub peer_count: usize,
    pub peers: Vec<PeerInfo>,
    pub created_at: DateTime<Utc>,
}

/// The room actor has exited; callers go back through the registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("room {0} is closed")]
pub struct RoomClosed(pub String);

/// Commands a room actor processes, one at a time.
pub enum RoomCommand {
    Join {
        peer_id: String,
        display_name: String,
        conn_id: String,
        outbound: mpsc::UnboundedSender<RelayMessage>,
        reply: oneshot::Sender<JoinAck>,
    },
    Relay {
        from_peer_id: String,
        /// Advisory name from the frame; the session's registered name is
        /// used when empty.
        display_name: Option<String>,
        text: String,
        reply: oneshot::Sender<usize>,
    },
    Leave {
        peer_id: String,
        conn_id: String,
    },
    KeepAlive {
        peer_id: String,
    },
    Roster {
        peer_id: String,
    },
    Info {
        reply: oneshot::Sender<RoomInfo>,
    },
}

/// Clone-able front for one room's command queue.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    room_id: String,
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// True once the actor has exited. A closed handle is replaced by the
    /// registry on the next `get_or_create`.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// True when both handles front the same actor.
    pub fn same_room(&self, other: &RoomHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Register a connection and wait for the acknowledgment.
    pub async fn join(
        &self,
        peer_id: impl Into<String>,
        display_name: impl Into<String>,
        conn_id: impl Into<String>,
        outbound: mpsc::UnboundedSender<RelayMessage>,
    ) -> Result<JoinAck, RoomClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::Join {
                peer_id: peer_id.into(),
                display_name: display_name.into(),
                conn_id: conn_id.into(),
                outbound,
                reply,
            })
            .map_err(|_| RoomClosed(self.room_id.clone()))?;
        rx.await.map_err(|_| RoomClosed(self.room_id.clone()))
    }

    /// Relay a chat line from a registered peer; resolves to the number of
    /// peers it was delivered to.
    pub async fn relay(
        &self,
        from_peer_id: impl Into<String>,
        display_name: Option<String>,
        text: impl Into<String>,
    ) -> Result<usize, RoomClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::Relay {
                from_peer_id: from_peer_id.into(),
                display_name,
                text: text.into(),
                reply,
            })
            .map_err(|_| RoomClosed(self.room_id.clone()))?;
        rx.await.map_err(|_| RoomClosed(self.room_id.clone()))
    }

    /// Remove a session if `conn_id` still matches it. Fire-and-forget:
    /// a closed room has nothing left to leave.
    pub fn leave(&self, peer_id: impl Into<String>, conn_id: impl Into<String>) {
        let _ = self.tx.send(RoomCommand::Leave {
            peer_id: peer_id.into(),
            conn_id: conn_id.into(),
        });
    }

    /// Record liveness; the pong goes out on the peer's own queue.
    pub fn keep_alive(&self, peer_id: impl Into<String>) {
        let _ = self.tx.send(RoomCommand::KeepAlive { peer_id: peer_id.into() });
    }

    /// Ask for the roster; the response goes out on the peer's own queue.
    pub fn roster(&self, peer_id: impl Into<String>) {
        let _ = self.tx.send(RoomCommand::Roster { peer_id: peer_id.into() });
    }

    pub async fn info(&self) -> Result<RoomInfo, RoomClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::Info { reply })
            .map_err(|_| RoomClosed(self.room_id.clone()))?;
        rx.await.map_err(|_| RoomClosed(self.room_id.clone()))
    }
}

/// Per-conversation broker state, owned by the actor task.
pub struct Room {
    room_id: String,
    created_at: DateTime<Utc>,
    sessions: HashMap<String, Session>,
    /// Set by the first join. An empty map before that is a room waiting for
    /// its first peer, not a vacated one.
    occupied_once: bool,
    vacancy_tx: mpsc::UnboundedSender<String>,
}

impl Room {
    /// Start the actor for `room_id` and return its handle.
    pub fn spawn(room_id: String, vacancy_tx: mpsc::UnboundedSender<String>) -> RoomHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let room = Room {
            room_id: room_id.clone(),
            created_at: Utc::now(),
            sessions: HashMap::new(),
            occupied_once: false,
            vacancy_tx,
        };
        tokio::spawn(room.run(rx));
        RoomHandle { room_id, tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RoomCommand>) {
        debug!("Room {} opened", self.room_id);
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd);
            if self.occupied_once && self.sessions.is_empty() {
                break;
            }
        }
        // Close the queue before signalling vacancy so the registry never
        // observes a vacated room that still looks live. Commands queued
        // behind the emptying one are dropped; their callers retry through
        // the registry.
        drop(rx);
        let _ = self.vacancy_tx.send(self.room_id.clone());
        info!("Room {} closed", self.room_id);
    }

    fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join { peer_id, display_name, conn_id, outbound, reply } => {
                let ack = self.join(peer_id, display_name, conn_id, outbound);
                let _ = reply.send(ack);
            }
            RoomCommand::Relay { from_peer_id, display_name, text, reply } => {
                let delivered = self.relay(&from_peer_id, display_name.as_deref(), &text);
                let _ = reply.send(delivered);
            }
            RoomCommand::Leave { peer_id, conn_id } => self.leave(&peer_id, &conn_id),
            RoomCommand::KeepAlive { peer_id } => self.keep_alive(&peer_id),
            RoomCommand::Roster { peer_id } => self.send_roster(&peer_id),
            RoomCommand::Info { reply } => {
                let _ = reply.send(self.info());
            }
        }
    }

    fn join(
        &mut self,
        peer_id: String,
        display_name: String,
        conn_id: String,
        outbound: mpsc::UnboundedSender<RelayMessage>,
    ) -> JoinAck {
        self.occupied_once = true;

        // Supersede: a second join under the same peer id closes the previous
        // session before the new one is registered. Dropping the old outbound
        // sender is what closes the old socket. No presence-left goes out; to
        // the rest of the room this peer never left.
        let prior = self.sessions.remove(&peer_id);
        let superseded = prior.is_some();
        if superseded {
            info!(
                "Peer {} rejoined room {}, closing its previous connection",
                peer_id, self.room_id
            );
        }

        let now = Utc::now();
        let role = PeerRole::from_peer_id(&peer_id);
        let session = Session {
            peer_id: peer_id.clone(),
            display_name: display_name.clone(),
            role,
            connected_at: now,
            last_activity: now,
            conn_id,
            is_alive: true,
            outbound,
        };

        // Welcome carries the roster as it stands without the joiner.
        let welcome = RelayMessage::Connected {
            peer_id: peer_id.clone(),
            room_id: self.room_id.clone(),
            display_name: display_name.clone(),
            roster: self.roster_snapshot(),
        };
        if !session.send(welcome) {
            // The connection died before the welcome; it was never part of
            // the room as far as the other peers are concerned. A prior
            // session removed by the supersede has no replacement now, so
            // that removal is announced like any other departure.
            warn!("Peer {} vanished before joining room {}", peer_id, self.room_id);
            if let Some(prior) = prior {
                let left = RelayMessage::PresenceLeft {
                    peer_id: prior.peer_id,
                    display_name: prior.display_name,
                    room_id: self.room_id.clone(),
                };
                self.broadcast(&left, None);
            }
            return JoinAck { superseded, peers: self.sessions.len() };
        }
        self.sessions.insert(peer_id.clone(), session);

        let joined = RelayMessage::PresenceJoined {
            peer_id: peer_id.clone(),
            display_name,
            room_id: self.room_id.clone(),
        };
        let notified = self.broadcast(&joined, Some(&peer_id));
        info!(
            "Peer {} ({}) joined room {} ({} peers, {} notified)",
            peer_id,
            role,
            self.room_id,
            self.sessions.len(),
            notified
        );
        JoinAck { superseded, peers: self.sessions.len() }
    }

    fn leave(&mut self, peer_id: &str, conn_id: &str) {
        match self.sessions.get(peer_id) {
            Some(session) if session.conn_id == conn_id => {}
            Some(_) => {
                debug!(
                    "Stale leave for peer {} in room {} ignored",
                    peer_id, self.room_id
                );
                return;
            }
            None => return,
        }
        if let Some(session) = self.sessions.remove(peer_id) {
            info!(
                "Peer {} left room {} ({} remain)",
                peer_id,
                self.room_id,
                self.sessions.len()
            );
            let left = RelayMessage::PresenceLeft {
                peer_id: session.peer_id,
                display_name: session.display_name,
                room_id: self.room_id.clone(),
            };
            self.broadcast(&left, None);
        }
    }

    fn relay(&mut self, from_peer_id: &str, advisory_name: Option<&str>, text: &str) -> usize {
        let display_name = match self.sessions.get_mut(from_peer_id) {
            Some(session) if session.is_alive => {
                session.last_activity = Utc::now();
                advisory_name
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(String::from)
                    .unwrap_or_else(|| session.display_name.clone())
            }
            _ => {
                warn!(
                    "Dropping chat from unregistered peer {} in room {}",
                    from_peer_id, self.room_id
                );
                return 0;
            }
        };

        // The room is authoritative for sender identity and timestamp.
        let frame = RelayMessage::Chat {
            from_peer_id: from_peer_id.to_string(),
            display_name,
            text: text.to_string(),
            timestamp: Some(Utc::now()),
            room_id: self.room_id.clone(),
        };
        let delivered = self.broadcast(&frame, Some(from_peer_id));
        debug!(
            "Chat from {} relayed to {} peers in room {}",
            from_peer_id, delivered, self.room_id
        );
        delivered
    }

    fn keep_alive(&mut self, peer_id: &str) {
        match self.sessions.get_mut(peer_id) {
            Some(session) => session.last_activity = Utc::now(),
            None => return,
        }
        let pong = RelayMessage::Pong {
            timestamp: Utc::now(),
            roster: self.roster_snapshot(),
            room_id: self.room_id.clone(),
        };
        self.send_to(peer_id, pong);
    }

    fn send_roster(&mut self, peer_id: &str) {
        if !self.sessions.contains_key(peer_id) {
            return;
        }
        let response = RelayMessage::RosterResponse {
            roster: self.roster_snapshot(),
            room_id: self.room_id.clone(),
        };
        self.send_to(peer_id, response);
    }

    fn info(&self) -> RoomInfo {
        RoomInfo {
            room_id: self.room_id.clone(),
            peer_count: self.sessions.len(),
            peers: self.roster_snapshot(),
            created_at: self.created_at,
        }
    }

    /// Full directory of live peers, oldest connection first.
    fn roster_snapshot(&self) -> Vec<PeerInfo> {
        let mut roster: Vec<PeerInfo> = self
            .sessions
            .values()
            .filter(|session| session.is_alive)
            .map(Session::roster_entry)
            .collect();
        roster.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        roster
    }

    /// Deliver to every live session except `exclude`. A failed delivery
    /// marks that session dead; dead sessions are then removed as if they
    /// had disconnected, cascading until the live set is stable. Returns the
    /// delivered count.
    fn broadcast(&mut self, msg: &RelayMessage, exclude: Option<&str>) -> usize {
        let mut delivered = 0;
        let mut dead: Vec<String> = Vec::new();
        for session in self.sessions.values_mut() {
            if Some(session.peer_id.as_str()) == exclude || !session.is_alive {
                continue;
            }
            if session.outbound.send(msg.clone()).is_ok() {
                delivered += 1;
            } else {
                session.is_alive = false;
                dead.push(session.peer_id.clone());
            }
        }
        self.sweep(dead);
        delivered
    }

    /// Remove dead sessions and tell the remaining peers.
    fn sweep(&mut self, dead: Vec<String>) {
        for peer_id in dead {
            if let Some(session) = self.sessions.remove(&peer_id) {
                warn!(
                    "Peer {} dropped from room {} (delivery failed)",
                    peer_id, self.room_id
                );
                let left = RelayMessage::PresenceLeft {
                    peer_id: session.peer_id,
                    display_name: session.display_name,
                    room_id: self.room_id.clone(),
                };
                self.broadcast(&left, None);
            }
        }
    }

    /// Mark one session dead and reap it.
    fn send_to(&mut self, peer_id: &str, msg: RelayMessage) {
        let ok = match self.sessions.get(peer_id) {
            Some(session) if session.is_alive => session.send(msg),
            _ => return,
        };
        if !ok {
            if let Some(session) = self.sessions.get_mut(peer_id) {
                session.is_alive = false;
            }
            self.sweep(vec![peer_id.to_string()]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_room(id: &str) -> (RoomHandle, mpsc::UnboundedReceiver<String>) {
        let (vacancy_tx, vacancy_rx) = mpsc::unbounded_channel();
        (Room::spawn(id.to_string(), vacancy_tx), vacancy_rx)
    }

    async fn join_peer(
        room: &RoomHandle,
        peer_id: &str,
        name: &str,
        conn_id: &str,
    ) -> (JoinAck, mpsc::UnboundedReceiver<RelayMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ack = room.join(peer_id, name, conn_id, tx).await.unwrap();
        (ack, rx)
    }

    #[tokio::test]
    async fn test_join_sends_welcome_with_roster_excluding_self() {
        let (room, _vacancy) = new_room("support_r1");

        let (ack, mut visitor_rx) = join_peer(&room, "visitor_1", "Sam", "c1").await;
        assert!(!ack.superseded);
        assert_eq!(ack.peers, 1);
        match visitor_rx.recv().await.unwrap() {
            RelayMessage::Connected { peer_id, room_id, roster, .. } => {
                assert_eq!(peer_id, "visitor_1");
                assert_eq!(room_id, "support_r1");
                assert!(roster.is_empty());
            }
            other => panic!("expected connected, got {}", other.kind()),
        }

        let (ack, mut agent_rx) = join_peer(&room, "agent_kav", "Kav", "c2").await;
        assert_eq!(ack.peers, 2);
        match agent_rx.recv().await.unwrap() {
            RelayMessage::Connected { roster, .. } => {
                assert_eq!(roster.len(), 1);
                assert_eq!(roster[0].peer_id, "visitor_1");
                assert_eq!(roster[0].role, PeerRole::Visitor);
            }
            other => panic!("expected connected, got {}", other.kind()),
        }

        // The visitor hears about the agent, not about itself.
        match visitor_rx.recv().await.unwrap() {
            RelayMessage::PresenceJoined { peer_id, .. } => assert_eq!(peer_id, "agent_kav"),
            other => panic!("expected presence-joined, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_chat_is_stamped_and_not_echoed() {
        let (room, _vacancy) = new_room("support_r1");
        let (_, mut visitor_rx) = join_peer(&room, "visitor_1", "Sam", "c1").await;
        let (_, mut agent_rx) = join_peer(&room, "agent_kav", "Kav", "c2").await;
        let _ = visitor_rx.recv().await; // welcome
        let _ = visitor_rx.recv().await; // agent joined
        let _ = agent_rx.recv().await; // welcome

        let delivered = room.relay("visitor_1", None, "hello there").await.unwrap();
        assert_eq!(delivered, 1);

        match agent_rx.recv().await.unwrap() {
            RelayMessage::Chat { from_peer_id, display_name, text, timestamp, room_id } => {
                assert_eq!(from_peer_id, "visitor_1");
                assert_eq!(display_name, "Sam");
                assert_eq!(text, "hello there");
                assert!(timestamp.is_some());
                assert_eq!(room_id, "support_r1");
            }
            other => panic!("expected chat, got {}", other.kind()),
        }

        // No echo back to the sender.
        assert!(visitor_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_chat_advisory_name_overrides_registered() {
        let (room, _vacancy) = new_room("support_r1");
        let (_, _visitor_rx) = join_peer(&room, "visitor_1", "Sam", "c1").await;
        let (_, mut agent_rx) = join_peer(&room, "agent_kav", "Kav", "c2").await;
        let _ = agent_rx.recv().await; // welcome

        room.relay("visitor_1", Some("Samuel".to_string()), "hi").await.unwrap();
        match agent_rx.recv().await.unwrap() {
            RelayMessage::Chat { display_name, .. } => assert_eq!(display_name, "Samuel"),
            other => panic!("expected chat, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_relay_from_unregistered_peer_is_dropped() {
        let (room, _vacancy) = new_room("support_r1");
        let (_, _rx) = join_peer(&room, "visitor_1", "Sam", "c1").await;
        let delivered = room.relay("ghost", None, "boo").await.unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_broadcast_count_excludes_sender() {
        let (room, _vacancy) = new_room("support_r1");
        let (_, _v) = join_peer(&room, "visitor_1", "Sam", "c1").await;
        let (_, _a1) = join_peer(&room, "agent_one", "One", "c2").await;
        let (_, _a2) = join_peer(&room, "agent_two", "Two", "c3").await;

        let delivered = room.relay("visitor_1", None, "hi all").await.unwrap();
        assert_eq!(delivered, 2);
    }

    #[tokio::test]
    async fn test_keep_alive_pongs_with_full_roster() {
        let (room, _vacancy) = new_room("support_r1");
        let (_, mut visitor_rx) = join_peer(&room, "visitor_1", "Sam", "c1").await;
        let (_, _agent_rx) = join_peer(&room, "agent_kav", "Kav", "c2").await;
        let _ = visitor_rx.recv().await; // welcome
        let _ = visitor_rx.recv().await; // presence-joined

        room.keep_alive("visitor_1");
        match visitor_rx.recv().await.unwrap() {
            RelayMessage::Pong { roster, room_id, .. } => {
                assert_eq!(room_id, "support_r1");
                let mut ids: Vec<_> = roster.iter().map(|p| p.peer_id.as_str()).collect();
                ids.sort_unstable();
                assert_eq!(ids, vec!["agent_kav", "visitor_1"]);
            }
            other => panic!("expected pong, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_roster_request_answers_only_requester() {
        let (room, _vacancy) = new_room("support_r1");
        let (_, mut visitor_rx) = join_peer(&room, "visitor_1", "Sam", "c1").await;
        let (_, mut agent_rx) = join_peer(&room, "agent_kav", "Kav", "c2").await;
        let _ = visitor_rx.recv().await;
        let _ = visitor_rx.recv().await;
        let _ = agent_rx.recv().await;

        room.roster("agent_kav");
        match agent_rx.recv().await.unwrap() {
            RelayMessage::RosterResponse { roster, .. } => assert_eq!(roster.len(), 2),
            other => panic!("expected roster-response, got {}", other.kind()),
        }
        assert!(visitor_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_second_join_supersedes_and_closes_old_connection() {
        let (room, _vacancy) = new_room("support_r1");
        let (_, mut old_rx) = join_peer(&room, "visitor_1", "Sam", "c1").await;
        let _ = old_rx.recv().await; // welcome

        let (ack, mut new_rx) = join_peer(&room, "visitor_1", "Sam", "c2").await;
        assert!(ack.superseded);
        assert_eq!(ack.peers, 1);

        // Old outbound is dropped by the supersede, which closes the channel.
        assert!(old_rx.recv().await.is_none());
        match new_rx.recv().await.unwrap() {
            RelayMessage::Connected { roster, .. } => assert!(roster.is_empty()),
            other => panic!("expected connected, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_dead_rejoin_announces_the_departure() {
        let (room, _vacancy) = new_room("support_r1");
        let (_, mut observer_rx) = join_peer(&room, "agent_kav", "Kav", "c1").await;
        let (_, _visitor_rx) = join_peer(&room, "visitor_1", "Sam", "c2").await;
        let _ = observer_rx.recv().await; // welcome
        let _ = observer_rx.recv().await; // visitor joined

        // The replacement connection is already gone when the rejoin lands:
        // the supersede removed the old session and no new one registers.
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        drop(dead_rx);
        let ack = room.join("visitor_1", "Sam", "c3", dead_tx).await.unwrap();
        assert!(ack.superseded);
        assert_eq!(ack.peers, 1);

        match observer_rx.recv().await.unwrap() {
            RelayMessage::PresenceLeft { peer_id, .. } => assert_eq!(peer_id, "visitor_1"),
            other => panic!("expected presence-left, got {}", other.kind()),
        }
        let info = room.info().await.unwrap();
        assert_eq!(info.peer_count, 1);
        assert_eq!(info.peers[0].peer_id, "agent_kav");
    }

    #[tokio::test]
    async fn test_dead_rejoin_of_last_peer_vacates_the_room() {
        let (room, mut vacancy) = new_room("support_r1");
        let (_, _old_rx) = join_peer(&room, "visitor_1", "Sam", "c1").await;

        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        drop(dead_rx);
        let ack = room.join("visitor_1", "Sam", "c2", dead_tx).await.unwrap();
        assert!(ack.superseded);
        assert_eq!(ack.peers, 0);

        assert_eq!(vacancy.recv().await.unwrap(), "support_r1");
        assert!(room.is_closed());
    }

    #[tokio::test]
    async fn test_stale_leave_does_not_evict_replacement() {
        let (room, mut vacancy) = new_room("support_r1");
        let (_, _old_rx) = join_peer(&room, "visitor_1", "Sam", "c1").await;
        let (_, _new_rx) = join_peer(&room, "visitor_1", "Sam", "c2").await;

        // The superseded connection's cleanup fires with its old conn id.
        room.leave("visitor_1", "c1");
        let info = room.info().await.unwrap();
        assert_eq!(info.peer_count, 1);

        room.leave("visitor_1", "c2");
        assert_eq!(vacancy.recv().await.unwrap(), "support_r1");
        assert!(room.is_closed());
    }

    #[tokio::test]
    async fn test_leave_broadcasts_presence_left() {
        let (room, _vacancy) = new_room("support_r1");
        let (_, mut visitor_rx) = join_peer(&room, "visitor_1", "Sam", "c1").await;
        let (_, _agent_rx) = join_peer(&room, "agent_kav", "Kav", "c2").await;
        let _ = visitor_rx.recv().await;
        let _ = visitor_rx.recv().await;

        room.leave("agent_kav", "c2");
        match visitor_rx.recv().await.unwrap() {
            RelayMessage::PresenceLeft { peer_id, .. } => assert_eq!(peer_id, "agent_kav"),
            other => panic!("expected presence-left, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_empty_room_disposes_and_signals_vacancy() {
        let (room, mut vacancy) = new_room("support_r1");
        let (_, _rx) = join_peer(&room, "visitor_1", "Sam", "c1").await;
        room.leave("visitor_1", "c1");

        // Vacancy is signalled only after the command queue is closed.
        assert_eq!(vacancy.recv().await.unwrap(), "support_r1");
        assert!(room.is_closed());
        assert!(room.relay("visitor_1", None, "late").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_delivery_removes_peer_and_cascades_presence() {
        let (room, _vacancy) = new_room("support_r1");
        let (_, mut visitor_rx) = join_peer(&room, "visitor_1", "Sam", "c1").await;
        let (_, agent_rx) = join_peer(&room, "agent_kav", "Kav", "c2").await;
        let (_, mut observer_rx) = join_peer(&room, "agent_obs", "Obs", "c3").await;
        let _ = visitor_rx.recv().await; // welcome
        let _ = visitor_rx.recv().await; // agent_kav joined
        let _ = visitor_rx.recv().await; // agent_obs joined
        let _ = observer_rx.recv().await; // welcome

        // Simulate a dead socket: the receiver side goes away.
        drop(agent_rx);

        let delivered = room.relay("visitor_1", None, "anyone there?").await.unwrap();
        assert_eq!(delivered, 1);

        // The observer got the chat, then the departure of the dead peer.
        match observer_rx.recv().await.unwrap() {
            RelayMessage::Chat { text, .. } => assert_eq!(text, "anyone there?"),
            other => panic!("expected chat, got {}", other.kind()),
        }
        match observer_rx.recv().await.unwrap() {
            RelayMessage::PresenceLeft { peer_id, .. } => assert_eq!(peer_id, "agent_kav"),
            other => panic!("expected presence-left, got {}", other.kind()),
        }
        // The sender hears about the departure too.
        match visitor_rx.recv().await.unwrap() {
            RelayMessage::PresenceLeft { peer_id, .. } => assert_eq!(peer_id, "agent_kav"),
            other => panic!("expected presence-left, got {}", other.kind()),
        }

        let info = room.info().await.unwrap();
        assert_eq!(info.peer_count, 2);
    }

    #[tokio::test]
    async fn test_info_snapshot() {
        let (room, _vacancy) = new_room("support_r1");
        let (_, _v) = join_peer(&room, "visitor_1", "Sam", "c1").await;
        let (_, _a) = join_peer(&room, "agent_kav", "Kav", "c2").await;

        let info = room.info().await.unwrap();
        assert_eq!(info.room_id, "support_r1");
        assert_eq!(info.peer_count, 2);
        assert_eq!(info.peers.len(), 2);
        assert!(info.created_at <= Utc::now());
    }
}
