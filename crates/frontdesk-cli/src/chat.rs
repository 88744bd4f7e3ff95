//! Terminal visitor client driving a widget session from stdin

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use tokio::io::{self, AsyncBufReadExt, BufReader};

use frontdesk_core::{ChatRole, WidgetConfig};
use frontdesk_widget::{HttpSupportBackend, WidgetSession, WidgetUpdate, WsRelayConnector};

enum LineAction<'a> {
    Send(&'a str),
    Human,
    Cancel,
    Quit,
    Nothing,
}

fn parse_line(line: &str) -> LineAction<'_> {
    let line = line.trim();
    if line.is_empty() {
        return LineAction::Nothing;
    }
    match line {
        "/quit" | "/exit" => LineAction::Quit,
        "/human" => LineAction::Human,
        "/cancel" => LineAction::Cancel,
        _ => LineAction::Send(line),
    }
}

fn render_update(update: &WidgetUpdate) -> Option<String> {
    match update {
        // The visitor's own line is already on the terminal.
        WidgetUpdate::Message { role: ChatRole::User, .. } => None,
        WidgetUpdate::Message { role: ChatRole::Assistant, content } => {
            Some(format!("assistant: {content}"))
        }
        WidgetUpdate::Message { role: ChatRole::System, content } => Some(format!("* {content}")),
        WidgetUpdate::AgentMessage { display_name, content } => {
            Some(format!("{display_name}: {content}"))
        }
        WidgetUpdate::Quota { remaining } => Some(format!("* {remaining} messages left today")),
        WidgetUpdate::HandoffOffered => {
            Some("* The assistant suggests a human agent. Type /human to connect.".to_string())
        }
        WidgetUpdate::Frozen { reason } => Some(format!("* {reason}")),
        WidgetUpdate::InputState { .. } | WidgetUpdate::Mode { .. } => None,
    }
}

pub async fn run(config: WidgetConfig) -> Result<()> {
    let backend = Arc::new(HttpSupportBackend::new(config.backend_url.clone())?);
    let relay_base = config.relay_url.clone().unwrap_or_else(|| config.backend_url.clone());
    let connector = Arc::new(WsRelayConnector::new(relay_base));
    let fingerprint = json!({
        "client": "frontdesk-cli",
        "version": env!("CARGO_PKG_VERSION"),
        "platform": std::env::consts::OS,
    });

    let (handle, mut updates) = WidgetSession::spawn(config, backend, connector, fingerprint);
    println!("Type a message, /human for an agent, /cancel to stop waiting, /quit to leave.");

    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else { break };
                let frozen = matches!(update, WidgetUpdate::Frozen { .. });
                if let Some(line) = render_update(&update) {
                    println!("{line}");
                }
                if frozen {
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_line(&line) {
                    LineAction::Send(text) => handle.send_message(text),
                    LineAction::Human => handle.request_handoff(),
                    LineAction::Cancel => handle.cancel_handoff(),
                    LineAction::Quit => break,
                    LineAction::Nothing => {}
                }
            }
        }
    }

    handle.shutdown();
    Ok(())
}
