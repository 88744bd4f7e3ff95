//! frontdesk - relay host and terminal clients for support hand-off
//!
//! Usage:
//!   frontdesk serve                      start the relay WebSocket host
//!   frontdesk agent --room <ROOM_ID>     join a hand-off room as an agent
//!   frontdesk chat                       run the visitor widget in the terminal

mod agent;
mod chat;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use frontdesk_core::config::{self, FrontdeskConfig};
use frontdesk_relay::RelayServer;

#[derive(Parser)]
#[command(name = "frontdesk", about = "Customer-support hand-off relay and clients", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file; defaults to ./frontdesk.toml, then ~/.frontdesk/frontdesk.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay WebSocket host.
    Serve {
        /// Override the configured bind address.
        #[arg(long)]
        bind: Option<String>,
        /// Override the configured port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Join a hand-off room as a support agent.
    Agent {
        /// Room id to join, as paged by the backend.
        #[arg(long)]
        room: String,
        /// Relay base URL, e.g. ws://127.0.0.1:8787.
        #[arg(long)]
        relay: Option<String>,
        /// Name shown to the visitor.
        #[arg(long, default_value = "Support")]
        name: String,
    },
    /// Run the visitor widget in the terminal.
    Chat {
        /// Support backend endpoint override.
        #[arg(long)]
        backend: Option<String>,
        /// Name shown to the agent.
        #[arg(long)]
        name: Option<String>,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<FrontdeskConfig> {
    match &cli.config {
        Some(path) => config::load_config(path),
        None => Ok(config::discover_and_load()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let mut cfg = load_config(&cli)?;

    info!("frontdesk v{} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Serve { bind, port } => {
            if let Some(bind) = bind {
                cfg.relay.bind = bind;
            }
            if let Some(port) = port {
                cfg.relay.port = port;
            }
            RelayServer::new(cfg.relay).serve().await
        }
        Commands::Agent { room, relay, name } => {
            let relay_url = relay
                .or_else(|| cfg.widget.relay_url.clone())
                .unwrap_or_else(|| format!("ws://{}", cfg.relay.listen_addr()));
            agent::run(&relay_url, &room, &name).await
        }
        Commands::Chat { backend, name } => {
            if let Some(backend) = backend {
                cfg.widget.backend_url = backend;
            }
            if let Some(name) = name {
                cfg.widget.display_name = name;
            }
            if cfg.widget.relay_url.is_none() {
                cfg.widget.relay_url = Some(format!("ws://{}", cfg.relay.listen_addr()));
            }
            chat::run(cfg.widget).await
        }
    }
}
