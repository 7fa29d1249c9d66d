//! Network layer for sockwrap
//!
//! This module provides reference-counted socket handles together with the
//! pieces they are built from: address values, host resolution, SOCKS proxy
//! tunneling and a port-mapping hook for listening sockets.

pub mod addr;
pub mod config;
pub mod portmap;
pub mod proxy;
pub mod resolver;
pub mod socket;

use std::sync::atomic::{AtomicBool, Ordering};

pub use addr::{ip_to_string, AddressUnion, Family, PeerAddr};
pub use config::SocketConfig;
pub use portmap::{NoPortMapper, PortMapper, Protocol};
pub use proxy::{ProxyKind, ProxySettings, ProxyTunnel, Socks4Tunnel, Socks5Tunnel};
pub use resolver::{host_to_ip, AddressParser, HostAddr, ResolvedAddr};
pub use socket::{RecvOutcome, SocketHandle, Status};

/// Result type for network operations
pub type Result<T> = std::result::Result<T, Error>;

/// Network operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid address format: {0}")]
    InvalidAddress(String),

    #[error("Address resolution failed: {0}")]
    ResolutionFailed(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Unsupported address family: {0}")]
    UnsupportedFamily(String),

    #[error("Proxy negotiation failed: {0}")]
    Proxy(String),

    #[error("Port mapping failed: {0}")]
    PortMapping(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Socket not in expected state: expected {expected}, got {actual}")]
    InvalidState { expected: Status, actual: Status },

    #[error("Operation would block")]
    WouldBlock,
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Prepares the platform socket subsystem.
///
/// Must be called before the first socket is created. On Unix there is no
/// library to load, so this only records the state; repeated calls are
/// harmless and return `true`.
pub fn initialize() -> bool {
    if !INITIALIZED.swap(true, Ordering::AcqRel) {
        tracing::debug!("socket subsystem initialized");
    }
    true
}

/// Tears the socket subsystem down again.
///
/// Call only after every handle has been closed.
pub fn shutdown() {
    if INITIALIZED.swap(false, Ordering::AcqRel) {
        tracing::debug!("socket subsystem shut down");
    }
}

/// Whether [`initialize`] has been called without a matching [`shutdown`].
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}
