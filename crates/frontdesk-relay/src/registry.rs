//! Room registry — the process-wide map of live rooms
//!
//! Owned by the server state and injected wherever rooms are looked up.
//! At most one live room exists per id; vacated rooms signal the registry
//! and a reaper task withdraws their handles.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::protocol::RelayMessage;
use crate::room::{JoinAck, Room, RoomClosed, RoomHandle, RoomInfo};

pub struct RoomRegistry {
    rooms: DashMap<String, RoomHandle>,
    vacancy_tx: mpsc::UnboundedSender<String>,
}

impl RoomRegistry {
    /// Create the registry and start its reaper task. The reaper holds a
    /// weak reference, so dropping the last external `Arc` shuts it down.
    pub fn new() -> Arc<Self> {
        let (vacancy_tx, vacancy_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self { rooms: DashMap::new(), vacancy_tx });
        tokio::spawn(Self::reap_vacated(Arc::downgrade(&registry), vacancy_rx));
        registry
    }

    /// Handle for `room_id`, spawning a room if the id is unknown or its
    /// previous actor already exited. The map entry API makes the
    /// get-or-spawn atomic, so concurrent callers share one room.
    pub fn get_or_create(&self, room_id: &str) -> RoomHandle {
        match self.rooms.entry(room_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_closed() {
                    debug!("Room {} handle was closed, spawning a fresh room", room_id);
                    let handle = Room::spawn(room_id.to_string(), self.vacancy_tx.clone());
                    entry.insert(handle.clone());
                    handle
                } else {
                    entry.get().clone()
                }
            }
            Entry::Vacant(entry) => {
                info!("Room {} created", room_id);
                let handle = Room::spawn(room_id.to_string(), self.vacancy_tx.clone());
                entry.insert(handle.clone());
                handle
            }
        }
    }

    /// Join a room, creating it on demand. A room that empties between the
    /// lookup and the join is replaced with a fresh one and the join
    /// retried, so the caller always lands on a live actor.
    pub async fn join(
        &self,
        room_id: &str,
        peer_id: &str,
        display_name: &str,
        conn_id: &str,
        outbound: mpsc::UnboundedSender<RelayMessage>,
    ) -> (RoomHandle, JoinAck) {
        loop {
            let handle = self.get_or_create(room_id);
            match handle.join(peer_id, display_name, conn_id, outbound.clone()).await {
                Ok(ack) => return (handle, ack),
                Err(RoomClosed(_)) => {
                    debug!("Room {} closed mid-join, retrying", room_id);
                }
            }
        }
    }

    /// Lookup without creating.
    pub fn room(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms
            .get(room_id)
            .map(|entry| entry.value().clone())
            .filter(|handle| !handle.is_closed())
    }

    /// Snapshot for the room-info endpoint; `None` for unknown or vacated
    /// rooms.
    pub async fn room_info(&self, room_id: &str) -> Option<RoomInfo> {
        self.room(room_id)?.info().await.ok()
    }

    /// Number of live rooms.
    pub fn len(&self) -> usize {
        self.rooms.iter().filter(|entry| !entry.value().is_closed()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn reap_vacated(
        registry: Weak<RoomRegistry>,
        mut vacancy_rx: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(room_id) = vacancy_rx.recv().await {
            let Some(registry) = registry.upgrade() else { break };
            // Remove only a genuinely closed handle; the id may already be
            // occupied by a successor room.
            let removed = registry.rooms.remove_if(&room_id, |_, handle| handle.is_closed());
            if removed.is_some() {
                info!("Room {} withdrawn from registry", room_id);
            }
        }
        debug!("Room reaper stopped");
    }
}
