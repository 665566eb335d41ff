//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.junction/config.json`) and environment.
//! Every field has a default, so an empty file (or no file) is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Hub server settings.
    #[serde(default)]
    pub hub: HubConfig,

    /// Routing, fanout and proxy timing.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Offer/answer store settings.
    #[serde(default)]
    pub handshake: HandshakeConfig,
}

/// Hub bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    /// Port for HTTP and WebSocket (default 8080).
    #[serde(default = "default_hub_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_hub_bind")]
    pub bind: String,

    /// Auth settings. When absent, defaults to no auth for loopback bind.
    #[serde(default)]
    pub auth: HubAuthConfig,
}

/// Hub auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubAuthConfig {
    /// "none" = no shared secret (only safe when bind is loopback). "token" = require `?token=` on connect.
    #[serde(default)]
    pub mode: HubAuthMode,

    /// Shared secret for WebSocket connect and HTTP writes. Overridden by JUNCTION_HUB_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HubAuthMode {
    /// No auth; allow only when bind is loopback.
    #[default]
    None,

    /// Require the configured token.
    Token,
}

fn default_hub_port() -> u16 {
    8080
}

fn default_hub_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: default_hub_port(),
            bind: default_hub_bind(),
            auth: HubAuthConfig::default(),
        }
    }
}

/// Timing and buffering for the relay core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// How long a proxied request waits for the device's response (default 30 s).
    #[serde(default = "default_proxy_timeout_ms")]
    pub proxy_timeout_ms: u64,

    /// Upper bound on a single send to one recipient before it is treated as failed (default 2 s).
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Outbound frames buffered per WebSocket before sends start waiting (default 64).
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

fn default_proxy_timeout_ms() -> u64 {
    30_000
}

fn default_send_timeout_ms() -> u64 {
    2_000
}

fn default_outbound_buffer() -> usize {
    64
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            proxy_timeout_ms: default_proxy_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl RelayConfig {
    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Offer/answer store config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeConfig {
    /// Device id used by the unkeyed `/offer` and `/answer` routes.
    #[serde(default = "default_handshake_device")]
    pub default_device: String,
}

fn default_handshake_device() -> String {
    "default".to_string()
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            default_device: default_handshake_device(),
        }
    }
}

/// Resolve the hub token: env JUNCTION_HUB_TOKEN overrides config.
pub fn resolve_hub_token(config: &Config) -> Option<String> {
    std::env::var("JUNCTION_HUB_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .hub
                .auth
                .token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("JUNCTION_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".junction").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, JUNCTION_CONFIG_PATH, or the default. Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
