//! Socket configuration
//!
//! Settings that apply to every connection a handle makes. They can be built
//! in code or loaded from JSON:
//!
//! ```json
//! { "connect_timeout_ms": 2000, "proxy": { "kind": "socks5", "host": "127.0.0.1", "port": 9050 } }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Error, ProxySettings, Result};

/// Per-handle socket settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Bound on each connect attempt and each proxy handshake; 0 blocks
    pub connect_timeout_ms: u64,
    /// TCP_NODELAY on connected stream sockets
    pub nodelay: bool,
    /// Listen backlog
    pub backlog: i32,
    /// SO_REUSEADDR on listening sockets
    pub reuse_address: bool,
    /// Proxy used by `connect_with_config`
    pub proxy: ProxySettings,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            connect_timeout_ms: 5_000,
            nodelay: true,
            backlog: 128,
            reuse_address: true,
            proxy: ProxySettings::none(),
        }
    }
}

impl SocketConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.connect_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
