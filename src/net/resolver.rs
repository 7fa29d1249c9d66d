//! DNS resolution and address parsing
//!
//! [`HostAddr`] describes an unresolved destination and [`ResolvedAddr`]
//! turns it into concrete [`PeerAddr`] candidates. [`AddressParser`] splits
//! user-supplied endpoint strings into host and port.
//!
//! Supported endpoint formats:
//! - "localhost" - "localhost:80" - "localhost 80"
//! - "127.0.0.1" - "127.0.0.1:80" - "127.0.0.1 80"
//! - "[::1]"     - "[::1]:80"     - "[::1] 80"
//! - "::1"

use std::ffi::{CStr, CString};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ptr;

use super::{Error, Family, PeerAddr, Result};

/// Parsed address components
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    /// The host part (IP address or hostname)
    pub host: Option<String>,
    /// The port part
    pub port: PortSpec,
}

/// Port specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSpec {
    /// No port specified
    None,
    /// Numeric port
    Single(u16),
    /// Port string that needs resolution (e.g., "http")
    Service(String),
}

/// Address parser for handling various address formats
pub struct AddressParser;

impl AddressParser {
    /// Parse an address string into host and port components
    ///
    /// # Examples
    /// ```
    /// use sockwrap::net::resolver::{AddressParser, PortSpec};
    ///
    /// let parsed = AddressParser::parse("localhost:8080", None).unwrap();
    /// assert_eq!(parsed.host.as_deref(), Some("localhost"));
    /// assert_eq!(parsed.port, PortSpec::Single(8080));
    /// ```
    pub fn parse(addr: &str, default_port: Option<&str>) -> Result<ParsedAddress> {
        let (host, port) = Self::split_address(addr)?;

        let port_spec = match port.or(default_port) {
            Some(port_str) => Self::parse_port(port_str),
            None => PortSpec::None,
        };

        Ok(ParsedAddress {
            host: host.map(String::from),
            port: port_spec,
        })
    }

    /// Split an address string into host and port parts
    fn split_address(addr: &str) -> Result<(Option<&str>, Option<&str>)> {
        let addr = addr.trim();

        if addr.is_empty() {
            return Err(Error::InvalidAddress("Empty address".to_string()));
        }

        // [::1]:80 or [::1] 80
        if let Some(bracketed) = addr.strip_prefix('[') {
            let close_bracket = bracketed
                .find(']')
                .ok_or_else(|| Error::InvalidAddress("IPv6 address lacks ']'".to_string()))?;

            let host = &bracketed[..close_bracket];
            let rest = &bracketed[close_bracket + 1..];

            let port = match rest.chars().next() {
                None => return Ok((Some(host), None)),
                Some(' ') | Some(':') => rest[1..].trim(),
                Some(_) => {
                    return Err(Error::InvalidAddress(
                        "IPv6 address has wrong port separator".to_string(),
                    ))
                }
            };
            return Ok((Some(host), non_empty(port)));
        }

        if let Some(space_pos) = addr.find(' ') {
            let host = &addr[..space_pos];
            let port = addr[space_pos + 1..].trim();
            return Ok((non_empty(host), non_empty(port)));
        }

        if let Some(colon_pos) = addr.find(':') {
            // More than one colon: bare IPv6 without port
            if addr[colon_pos + 1..].contains(':') {
                return Ok((Some(addr), None));
            }

            let host = &addr[..colon_pos];
            let port = &addr[colon_pos + 1..];
            return Ok((non_empty(host), non_empty(port)));
        }

        Ok((Some(addr), None))
    }

    fn parse_port(port_str: &str) -> PortSpec {
        match port_str.parse::<u16>() {
            Ok(port) => PortSpec::Single(port),
            Err(_) => PortSpec::Service(port_str.to_string()),
        }
    }
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// An unresolved destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddr {
    pub host: String,
    /// Port as text, as handed to the resolver
    pub port: String,
    pub ipv6: bool,
    pub is_udp: bool,
}

impl Default for HostAddr {
    fn default() -> Self {
        HostAddr {
            host: String::new(),
            port: "0".to_string(),
            ipv6: false,
            is_udp: false,
        }
    }
}

impl HostAddr {
    pub fn new(host: impl Into<String>, port: u16, ipv6: bool, is_udp: bool) -> Self {
        HostAddr {
            host: host.into(),
            port: port.to_string(),
            ipv6,
            is_udp,
        }
    }

    pub fn family(&self) -> Family {
        Family::from_ipv6(self.ipv6)
    }
}

/// The resolved candidates of one [`HostAddr`].
///
/// Resolution never fails loudly: when the host or port cannot be resolved
/// the candidate list is empty and [`ResolvedAddr::is_valid`] is false.
#[derive(Debug, Clone)]
pub struct ResolvedAddr {
    addrs: Vec<PeerAddr>,
    is_udp: bool,
}

impl ResolvedAddr {
    /// Resolve `host_addr`, keeping only candidates of the requested family.
    ///
    /// With `resolve_all` unset at most the first candidate is kept,
    /// otherwise all of them in resolver order. An empty host resolves to
    /// the wildcard address of the family.
    pub fn new(host_addr: &HostAddr, resolve_all: bool) -> Self {
        let mut addrs = match Self::lookup(host_addr) {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::debug!(host = %host_addr.host, port = %host_addr.port, error = %e, "resolution failed");
                Vec::new()
            }
        };

        if !resolve_all {
            addrs.truncate(1);
        }

        ResolvedAddr {
            addrs,
            is_udp: host_addr.is_udp,
        }
    }

    fn lookup(host_addr: &HostAddr) -> Result<Vec<PeerAddr>> {
        let family = host_addr.family();
        let host = if host_addr.host.is_empty() {
            None
        } else {
            Some(host_addr.host.as_str())
        };

        let addrs: Vec<PeerAddr> = getaddrinfo(host, &host_addr.port, family, host_addr.is_udp)?
            .into_iter()
            .filter(|addr| match family {
                Family::V4 => addr.is_ipv4(),
                Family::V6 => addr.is_ipv6(),
            })
            .map(PeerAddr::from)
            .collect();

        if addrs.is_empty() {
            return Err(Error::ResolutionFailed(format!(
                "No {:?} addresses found for {}",
                family, host_addr.host
            )));
        }

        Ok(addrs)
    }

    pub fn is_valid(&self) -> bool {
        !self.addrs.is_empty()
    }

    pub fn first(&self) -> Option<&PeerAddr> {
        self.addrs.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PeerAddr> {
        self.addrs.iter()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Whether the candidates were requested for datagram use
    pub fn is_udp(&self) -> bool {
        self.is_udp
    }
}

impl<'a> IntoIterator for &'a ResolvedAddr {
    type Item = &'a PeerAddr;
    type IntoIter = std::slice::Iter<'a, PeerAddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.addrs.iter()
    }
}

impl IntoIterator for ResolvedAddr {
    type Item = PeerAddr;
    type IntoIter = std::vec::IntoIter<PeerAddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.addrs.into_iter()
    }
}

/// Owned result list of `getaddrinfo`
struct AddrInfoList(*mut libc::addrinfo);

impl Drop for AddrInfoList {
    fn drop(&mut self) {
        if !self.0.is_null() {
            // SAFETY: the pointer came from a successful getaddrinfo call and
            // is freed exactly once here.
            unsafe { libc::freeaddrinfo(self.0) };
        }
    }
}

/// Look up `host` and `service` with family and socket type hints.
///
/// `service` may be a port number or a service name such as "http". Without
/// a host the wildcard address of the family is returned.
fn getaddrinfo(
    host: Option<&str>,
    service: &str,
    family: Family,
    is_udp: bool,
) -> Result<Vec<SocketAddr>> {
    let c_host = host
        .map(CString::new)
        .transpose()
        .map_err(|_| Error::InvalidAddress(format!("Host contains NUL: {:?}", host)))?;
    let c_service = CString::new(service)
        .map_err(|_| Error::InvalidAddress(format!("Service contains NUL: {:?}", service)))?;

    // SAFETY: addrinfo is a plain C struct for which all-zero is a valid value.
    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = match family {
        Family::V4 => libc::AF_INET,
        Family::V6 => libc::AF_INET6,
    };
    hints.ai_socktype = if is_udp {
        libc::SOCK_DGRAM
    } else {
        libc::SOCK_STREAM
    };
    if c_host.is_none() {
        hints.ai_flags = libc::AI_PASSIVE;
    }

    let mut list = AddrInfoList(ptr::null_mut());
    // SAFETY: both strings are NUL-terminated and outlive the call; the
    // result list is owned by `list` and freed on drop.
    let ret = unsafe {
        libc::getaddrinfo(
            c_host.as_ref().map_or(ptr::null(), |h| h.as_ptr()),
            c_service.as_ptr(),
            &hints,
            &mut list.0,
        )
    };
    if ret != 0 {
        // SAFETY: gai_strerror returns a static NUL-terminated string.
        let message = unsafe { CStr::from_ptr(libc::gai_strerror(ret)) }.to_string_lossy();
        return Err(Error::ResolutionFailed(format!(
            "{}:{}: {}",
            host.unwrap_or(""),
            service,
            message
        )));
    }

    let mut addrs = Vec::new();
    let mut current = list.0;
    while !current.is_null() {
        // SAFETY: `current` walks the list returned by getaddrinfo, which
        // stays alive until `list` is dropped.
        let info = unsafe { &*current };
        match info.ai_family {
            libc::AF_INET => {
                // SAFETY: AF_INET entries carry a sockaddr_in.
                let sin = unsafe { &*(info.ai_addr as *const libc::sockaddr_in) };
                addrs.push(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                    u16::from_be(sin.sin_port),
                )));
            }
            libc::AF_INET6 => {
                // SAFETY: AF_INET6 entries carry a sockaddr_in6.
                let sin6 = unsafe { &*(info.ai_addr as *const libc::sockaddr_in6) };
                addrs.push(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    u16::from_be(sin6.sin6_port),
                    u32::from_be(sin6.sin6_flowinfo),
                    sin6.sin6_scope_id,
                )));
            }
            _ => {}
        }
        current = info.ai_next;
    }

    Ok(addrs)
}

/// Resolve `hostname` into numeric [`HostAddr`]s, one per candidate.
///
/// Returns an empty list if the host cannot be resolved.
pub fn host_to_ip(hostname: &str, port: u16, get_ipv6: bool, use_udp: bool) -> Vec<HostAddr> {
    let request = HostAddr::new(hostname, port, get_ipv6, use_udp);
    ResolvedAddr::new(&request, true)
        .iter()
        .map(|peer| HostAddr {
            host: peer.ip(),
            port: port.to_string(),
            ipv6: get_ipv6,
            is_udp: use_udp,
        })
        .collect()
}
