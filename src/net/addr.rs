//! Socket address handling
//!
//! [`AddressUnion`] holds any address form a socket call can produce or
//! consume, selected by an explicit tag. [`PeerAddr`] wraps it as the concrete
//! address used for connectionless sends and receives.

use std::fmt;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use socket2::{Domain, SockAddr as Socket2Addr};

use super::{Error, Result};

/// Address family of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// IPv6 when `use_ipv6` is set, IPv4 otherwise
    pub fn from_ipv6(use_ipv6: bool) -> Self {
        if use_ipv6 {
            Family::V6
        } else {
            Family::V4
        }
    }

    pub fn domain(self) -> Domain {
        match self {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
        }
    }

    /// Wildcard address of this family on the given port
    pub fn unspecified(self, port: u16) -> SocketAddr {
        match self {
            Family::V4 => SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
            Family::V6 => SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0)),
        }
    }
}

/// Any socket address a call may hand us.
///
/// IP endpoints are stored by value. Addresses of other families (as returned
/// by `recvfrom` or `getpeername` on exotic sockets) are kept as raw storage.
#[derive(Debug, Clone)]
pub enum AddressUnion {
    /// IPv4 socket address
    V4(SocketAddrV4),
    /// IPv6 socket address
    V6(SocketAddrV6),
    /// Raw storage for any other family
    Storage(Socket2Addr),
}

impl AddressUnion {
    /// Size of the largest address form, i.e. `sockaddr_storage`.
    pub const STORAGE_SIZE: usize = mem::size_of::<libc::sockaddr_storage>();

    /// Wrap a raw socket2 address, unpacking IP forms into their tagged variant
    pub fn from_sock_addr(addr: Socket2Addr) -> Self {
        match addr.as_socket() {
            Some(SocketAddr::V4(v4)) => AddressUnion::V4(v4),
            Some(SocketAddr::V6(v6)) => AddressUnion::V6(v6),
            None => AddressUnion::Storage(addr),
        }
    }

    /// Convert into the form socket2 passes to the OS
    pub fn to_sock_addr(&self) -> Socket2Addr {
        match self {
            AddressUnion::V4(v4) => Socket2Addr::from(*v4),
            AddressUnion::V6(v6) => Socket2Addr::from(*v6),
            AddressUnion::Storage(raw) => raw.clone(),
        }
    }

    /// Convert to standard library SocketAddr if possible
    ///
    /// Returns None for non-IP storage
    pub fn to_std(&self) -> Option<SocketAddr> {
        match self {
            AddressUnion::V4(v4) => Some(SocketAddr::V4(*v4)),
            AddressUnion::V6(v6) => Some(SocketAddr::V6(*v6)),
            AddressUnion::Storage(raw) => raw.as_socket(),
        }
    }

    pub fn family(&self) -> Option<Family> {
        match self {
            AddressUnion::V4(_) => Some(Family::V4),
            AddressUnion::V6(_) => Some(Family::V6),
            AddressUnion::Storage(raw) => match raw.domain() {
                d if d == Domain::IPV4 => Some(Family::V4),
                d if d == Domain::IPV6 => Some(Family::V6),
                _ => None,
            },
        }
    }

    /// Get the port number
    ///
    /// Returns 0 for non-IP storage
    pub fn port(&self) -> u16 {
        self.to_std().map(|addr| addr.port()).unwrap_or(0)
    }

    /// Get the IP address if this is an IP socket
    pub fn ip(&self) -> Option<IpAddr> {
        self.to_std().map(|addr| addr.ip())
    }

    /// Length of the family-specific structure, as the OS expects it
    pub fn family_len(&self) -> usize {
        self.to_sock_addr().len() as usize
    }
}

impl PartialEq for AddressUnion {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AddressUnion::V4(a), AddressUnion::V4(b)) => a == b,
            (AddressUnion::V6(a), AddressUnion::V6(b)) => a == b,
            (AddressUnion::Storage(a), AddressUnion::Storage(b)) => {
                a.family() == b.family() && a.len() == b.len() && a.as_socket() == b.as_socket()
            }
            _ => false,
        }
    }
}

impl From<SocketAddr> for AddressUnion {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => AddressUnion::V4(v4),
            SocketAddr::V6(v6) => AddressUnion::V6(v6),
        }
    }
}

impl fmt::Display for AddressUnion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressUnion::V4(v4) => write!(f, "{}", v4),
            AddressUnion::V6(v6) => write!(f, "{}", v6),
            AddressUnion::Storage(raw) => write!(f, "<family {}>", raw.family()),
        }
    }
}

/// Format the IP of an address without its port.
///
/// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are shown as plain IPv4.
/// Non-IP storage yields an empty string.
pub fn ip_to_string(addr: &AddressUnion) -> String {
    match addr.ip() {
        Some(IpAddr::V4(ip)) => ip.to_string(),
        Some(IpAddr::V6(ip)) => match ip.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => ip.to_string(),
        },
        None => String::new(),
    }
}

/// A concrete peer address for addressed (connectionless) I/O.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerAddr {
    addr: AddressUnion,
}

impl Default for PeerAddr {
    /// An unspecified IPv4 address (`0.0.0.0:0`), to be filled by a receive
    fn default() -> Self {
        PeerAddr {
            addr: AddressUnion::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
        }
    }
}

impl PeerAddr {
    pub fn new(addr: AddressUnion) -> Self {
        PeerAddr { addr }
    }

    /// The IPv4 broadcast address `255.255.255.255` on `port`
    pub fn broadcast(port: u16) -> Self {
        PeerAddr {
            addr: AddressUnion::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port)),
        }
    }

    /// Textual IP of the address
    pub fn ip(&self) -> String {
        ip_to_string(&self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Size of the address storage.
    ///
    /// This is always [`AddressUnion::STORAGE_SIZE`], whichever family is
    /// populated. Use [`PeerAddr::family_len`] where the exact structure
    /// length matters.
    pub fn size(&self) -> usize {
        AddressUnion::STORAGE_SIZE
    }

    pub fn family_len(&self) -> usize {
        self.addr.family_len()
    }

    pub fn addr(&self) -> &AddressUnion {
        &self.addr
    }

    pub fn to_sock_addr(&self) -> Socket2Addr {
        self.addr.to_sock_addr()
    }

    pub fn to_std(&self) -> Option<SocketAddr> {
        self.addr.to_std()
    }

    /// Parse a numeric `ip:port` literal, e.g. `127.0.0.1:80` or `[::1]:80`
    pub fn parse(s: &str) -> Result<Self> {
        let addr: SocketAddr = s
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("not a numeric socket address: {}", s)))?;
        Ok(PeerAddr::from(addr))
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        PeerAddr {
            addr: AddressUnion::from(addr),
        }
    }
}

impl From<AddressUnion> for PeerAddr {
    fn from(addr: AddressUnion) -> Self {
        PeerAddr { addr }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}
