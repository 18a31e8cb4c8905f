// Session configuration
//
// JSON file at $VOLTRON_CONFIG or ~/.voltron/config. Every field has a
// default, so a missing file is the same as an empty object.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const CONFIG_ENV: &str = "VOLTRON_CONFIG";
pub const SOCKET_ENV: &str = "VOLTRON_SOCKET";
pub const TCP_ENV: &str = "VOLTRON_TCP";

fn voltron_dir() -> Option<PathBuf> {
    home::home_dir().map(|h| h.join(".voltron"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `null` disables the local socket
    pub unix_socket: Option<PathBuf>,
    /// `host:port`
    pub tcp: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            unix_socket: voltron_dir().map(|d| d.join("sock")),
            tcp: None,
        }
    }
}

/// What each view kind asks for on every update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    pub stack_bytes: u64,
    pub disassembly_count: usize,
    pub backtrace_depth: usize,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            stack_bytes: 256,
            disassembly_count: 32,
            backtrace_depth: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    /// 0 waits indefinitely
    pub wait_timeout_ms: u64,
    pub max_memory_read: u64,
    pub max_stack_depth: usize,
    pub view: ViewConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            wait_timeout_ms: 0,
            max_memory_read: 1024 * 1024,
            max_stack_depth: 512,
            view: ViewConfig::default(),
        }
    }
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        voltron_dir().map(|d| d.join("config"))
    }

    /// Load from the usual location and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .or_else(Self::default_path);
        let mut config = match path {
            Some(path) => Self::load_from(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(
            std::env::var(SOCKET_ENV).ok(),
            std::env::var(TCP_ENV).ok(),
        );
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn apply_overrides(&mut self, socket: Option<String>, tcp: Option<String>) {
        if let Some(socket) = socket.filter(|s| !s.is_empty()) {
            self.server.unix_socket = Some(PathBuf::from(socket));
        }
        if let Some(tcp) = tcp.filter(|s| !s.is_empty()) {
            self.server.tcp = Some(tcp);
        }
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        match self.wait_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
