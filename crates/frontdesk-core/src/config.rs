//! Configuration loading
//!
//! One TOML file, discovered project-local first and then in `~/.frontdesk/`.
//! Every field has a default so running with no config file works.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Config file name, checked in the working directory and `~/.frontdesk/`.
pub const CONFIG_FILENAME: &str = "frontdesk.toml";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontdeskConfig {
    pub relay: RelayConfig,
    pub widget: WidgetConfig,
}

/// Relay host settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Bind address for the WebSocket host.
    pub bind: String,
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { bind: "127.0.0.1".to_string(), port: 8787 }
    }
}

impl RelayConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Visitor widget settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WidgetConfig {
    /// Support backend endpoint (`initChat` / `sendMessage` / `requestHumanSupport`).
    pub backend_url: String,

    /// Relay base URL override. When unset, the relay address is derived
    /// from `backend_url` (http → ws, https → wss).
    pub relay_url: Option<String>,

    /// Name shown to agents for this visitor.
    pub display_name: String,

    /// How long to wait for an agent before giving up on a hand-off.
    pub handoff_timeout_secs: u64,

    /// Pause between a relay disconnect notice and the return to
    /// assistant mode.
    pub disconnect_grace_secs: u64,

    /// Input lock-out after a short-window rate limit.
    pub quota_cooldown_secs: u64,

    /// Daily message quota assumed when the backend does not report one.
    pub default_quota: u32,
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8787/api/chat".to_string(),
            relay_url: None,
            display_name: "Guest".to_string(),
            handoff_timeout_secs: 180,
            disconnect_grace_secs: 3,
            quota_cooldown_secs: 5,
            default_quota: 15,
        }
    }
}

impl WidgetConfig {
    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_secs(self.handoff_timeout_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    pub fn quota_cooldown(&self) -> Duration {
        Duration::from_secs(self.quota_cooldown_secs)
    }
}

/// User-global config directory (`~/.frontdesk`).
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".frontdesk"))
}

/// Load config from an explicit path.
pub fn load_config(path: &Path) -> Result<FrontdeskConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    Ok(config)
}

/// Discover and load config from standard locations.
///
/// Search order: `./frontdesk.toml`, then `~/.frontdesk/frontdesk.toml`.
/// Returns defaults when no file is found; a file that fails to parse is
/// reported and skipped rather than aborting startup.
pub fn discover_and_load() -> FrontdeskConfig {
    for path in candidate_paths() {
        if !path.exists() {
            continue;
        }
        match load_config(&path) {
            Ok(config) => {
                debug!("Loaded config from {}", path.display());
                return config;
            }
            Err(e) => {
                warn!("Ignoring config {}: {:#}", path.display(), e);
            }
        }
    }
    debug!("No config file found, using defaults");
    FrontdeskConfig::default()
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILENAME)];
    if let Some(dir) = config_dir() {
        paths.push(dir.join(CONFIG_FILENAME));
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FrontdeskConfig::default();
        assert_eq!(config.relay.listen_addr(), "127.0.0.1:8787");
        assert_eq!(config.widget.handoff_timeout(), Duration::from_secs(180));
        assert_eq!(config.widget.disconnect_grace(), Duration::from_secs(3));
        assert_eq!(config.widget.quota_cooldown(), Duration::from_secs(5));
        assert_eq!(config.widget.default_quota, 15);
        assert!(config.widget.relay_url.is_none());
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        std::fs::write(
            &path,
            "[relay]\nport = 9000\n\n[widget]\ndisplay_name = \"Sam\"\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.relay.port, 9000);
        assert_eq!(config.relay.bind, "127.0.0.1");
        assert_eq!(config.widget.display_name, "Sam");
        assert_eq!(config.widget.handoff_timeout_secs, 180);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        std::fs::write(&path, "relay = not toml").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(load_config(Path::new("/nonexistent/frontdesk.toml")).is_err());
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = FrontdeskConfig::default();
        let raw = toml::to_string(&config).unwrap();
        let parsed: FrontdeskConfig = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.relay.port, config.relay.port);
        assert_eq!(parsed.widget.backend_url, config.widget.backend_url);
    }
}
