//! Terminal agent console for answering hand-off rooms
//!
//! Joins the room the backend paged, prints room traffic, and relays typed
//! lines as chat. Pings the room on an interval so the session stays fresh
//! on quiet conversations.

use anyhow::Result;
use chrono::Local;
use std::time::Duration;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;
use tracing::info;

use frontdesk_core::identity;
use frontdesk_relay::protocol::RelayMessage;
use frontdesk_widget::relay_link::{HandoffTicket, RelayConnector, RelayEvent, WsRelayConnector};

const PING_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run(relay_url: &str, room_id: &str, display_name: &str) -> Result<()> {
    let tag = uuid::Uuid::new_v4().simple().to_string();
    let peer_id = identity::mint_agent_peer_id(&tag[..8]);

    let connector = WsRelayConnector::new(relay_url);
    let ticket = HandoffTicket {
        room_id: room_id.to_string(),
        peer_id: peer_id.clone(),
        display_name: display_name.to_string(),
    };
    let mut link = connector.connect(&ticket).await?;
    info!("Agent console {} connected to {}", peer_id, room_id);
    println!("Type to chat, /roster for the peer list, /quit to leave.");

    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = link.recv() => {
                match event {
                    Some(RelayEvent::Message(msg)) => {
                        if let Some(line) = render(&msg) {
                            println!("{line}");
                        }
                    }
                    Some(RelayEvent::Closed) | None => {
                        println!("Connection closed.");
                        break;
                    }
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match line {
                    "/quit" => break,
                    "/roster" => link.send(RelayMessage::RosterRequest)?,
                    _ => link.send(RelayMessage::outgoing_chat(line, display_name))?,
                }
            }
            _ = ping.tick() => {
                link.send(RelayMessage::Ping)?;
            }
        }
    }

    link.close();
    Ok(())
}

/// One printable line per frame; liveness frames stay quiet.
fn render(msg: &RelayMessage) -> Option<String> {
    match msg {
        RelayMessage::Connected { room_id, roster, .. } => {
            let mut out = format!("Joined {room_id}.");
            if roster.is_empty() {
                out.push_str(" Nobody else is here yet.");
            } else {
                for peer in roster {
                    out.push_str(&format!(
                        "\n  {} ({}, {})",
                        peer.display_name, peer.peer_id, peer.role
                    ));
                }
            }
            Some(out)
        }
        RelayMessage::Chat { display_name, text, timestamp, .. } => {
            let when = timestamp
                .as_ref()
                .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "--:--:--".to_string());
            Some(format!("[{when}] {display_name}: {text}"))
        }
        RelayMessage::PresenceJoined { display_name, .. } => {
            Some(format!("* {display_name} joined"))
        }
        RelayMessage::PresenceLeft { display_name, .. } => Some(format!("* {display_name} left")),
        RelayMessage::RosterResponse { roster, .. } => {
            let mut out = format!("{} peer(s) in the room:", roster.len());
            for peer in roster {
                out.push_str(&format!(
                    "\n  {} ({}, {})",
                    peer.display_name, peer.peer_id, peer.role
                ));
            }
            Some(out)
        }
        _ => None,
    }
}
