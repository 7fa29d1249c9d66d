//! Forward proxy tunneling
//!
//! Only the client side of the CONNECT exchange is implemented: enough to
//! turn an open TCP connection to a SOCKS proxy into a tunnel to one target.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use socket2::Socket;

use super::resolver::{AddressParser, HostAddr, PortSpec, ResolvedAddr};
use super::{Error, Result};

/// Proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    None,
    Socks4,
    Socks5,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyKind::None => f.write_str("none"),
            ProxyKind::Socks4 => f.write_str("socks4"),
            ProxyKind::Socks5 => f.write_str("socks5"),
        }
    }
}

/// Where and how to reach the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
}

impl ProxySettings {
    /// Direct connections
    pub fn none() -> Self {
        ProxySettings::default()
    }

    pub fn socks4(host: impl Into<String>, port: u16) -> Self {
        ProxySettings {
            kind: ProxyKind::Socks4,
            host: host.into(),
            port,
        }
    }

    pub fn socks5(host: impl Into<String>, port: u16) -> Self {
        ProxySettings {
            kind: ProxyKind::Socks5,
            host: host.into(),
            port,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.kind != ProxyKind::None
    }

    /// The negotiator for this proxy kind, `None` for direct connections
    pub fn tunnel(&self) -> Option<Box<dyn ProxyTunnel>> {
        match self.kind {
            ProxyKind::None => None,
            ProxyKind::Socks4 => Some(Box::new(Socks4Tunnel)),
            ProxyKind::Socks5 => Some(Box::new(Socks5Tunnel)),
        }
    }
}

impl FromStr for ProxySettings {
    type Err = Error;

    /// Parse `socks4://host:port`, `socks5://host:port` or `none`.
    ///
    /// The port defaults to 1080.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("none") || s.is_empty() {
            return Ok(ProxySettings::none());
        }

        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| Error::InvalidAddress(format!("Proxy URL lacks scheme: {}", s)))?;

        let kind = match scheme.to_ascii_lowercase().as_str() {
            "socks4" | "socks4a" => ProxyKind::Socks4,
            "socks5" | "socks5h" | "socks" => ProxyKind::Socks5,
            other => {
                return Err(Error::InvalidAddress(format!(
                    "Unsupported proxy scheme: {}",
                    other
                )))
            }
        };

        let parsed = AddressParser::parse(rest.trim_end_matches('/'), Some("1080"))?;
        let host = parsed
            .host
            .ok_or_else(|| Error::InvalidAddress(format!("Proxy URL lacks host: {}", s)))?;
        let port = match parsed.port {
            PortSpec::Single(port) => port,
            _ => return Err(Error::InvalidAddress(format!("Invalid proxy port in {}", s))),
        };

        Ok(ProxySettings { kind, host, port })
    }
}

/// Negotiates a tunnel over an already-open connection to the proxy.
///
/// On success the connection carries the target's byte stream unchanged.
/// Read/write timeouts on `stream` bound the exchange.
pub trait ProxyTunnel {
    fn open(&self, stream: &Socket, target_host: &str, target_port: u16) -> Result<()>;

    fn kind(&self) -> ProxyKind;
}

/// SOCKS4 CONNECT. The protocol only carries IPv4, so the target is resolved
/// locally first.
#[derive(Debug, Default, Clone, Copy)]
pub struct Socks4Tunnel;

mod socks4 {
    pub const VERSION: u8 = 0x04;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const REPLY_GRANTED: u8 = 0x5a;
}

impl Socks4Tunnel {
    fn target_ip(target_host: &str, target_port: u16) -> Result<Ipv4Addr> {
        if let Ok(ip) = target_host.parse::<Ipv4Addr>() {
            return Ok(ip);
        }
        let resolved = ResolvedAddr::new(&HostAddr::new(target_host, target_port, false, false), false);
        match resolved.first().and_then(|peer| peer.ip().parse::<Ipv4Addr>().ok()) {
            Some(ip) => Ok(ip),
            None => Err(Error::Proxy(format!(
                "SOCKS4 needs an IPv4 address for {}",
                target_host
            ))),
        }
    }
}

impl ProxyTunnel for Socks4Tunnel {
    fn open(&self, stream: &Socket, target_host: &str, target_port: u16) -> Result<()> {
        let ip = Self::target_ip(target_host, target_port)?;

        // VN, CD, DSTPORT, DSTIP, empty USERID
        let mut request = vec![socks4::VERSION, socks4::CMD_CONNECT];
        request.extend_from_slice(&target_port.to_be_bytes());
        request.extend_from_slice(&ip.octets());
        request.push(0);
        write_all(stream, &request)?;

        let mut reply = [0u8; 8];
        read_exact(stream, &mut reply)?;
        if reply[0] != 0 {
            return Err(Error::Proxy(format!("Invalid SOCKS4 reply version {}", reply[0])));
        }
        if reply[1] != socks4::REPLY_GRANTED {
            return Err(Error::Proxy(format!("SOCKS4 request rejected ({})", reply[1])));
        }
        Ok(())
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::Socks4
    }
}

/// SOCKS5 CONNECT without authentication.
#[derive(Debug, Default, Clone, Copy)]
pub struct Socks5Tunnel;

mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const NO_AUTH: u8 = 0x00;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const SUCCEEDED: u8 = 0x00;

    pub fn reply_message(code: u8) -> &'static str {
        match code {
            0x01 => "general failure",
            0x02 => "connection not allowed",
            0x03 => "network unreachable",
            0x04 => "host unreachable",
            0x05 => "connection refused",
            0x06 => "TTL expired",
            0x07 => "command not supported",
            0x08 => "address type not supported",
            _ => "unknown error",
        }
    }
}

impl Socks5Tunnel {
    fn connect_request(target_host: &str, target_port: u16) -> Result<Vec<u8>> {
        let mut request = vec![socks5::VERSION, socks5::CMD_CONNECT, 0x00];
        match target_host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => {
                request.push(socks5::ATYP_IPV4);
                request.extend_from_slice(&ip.octets());
            }
            Ok(IpAddr::V6(ip)) => {
                request.push(socks5::ATYP_IPV6);
                request.extend_from_slice(&ip.octets());
            }
            Err(_) => {
                let len = u8::try_from(target_host.len()).map_err(|_| {
                    Error::Proxy(format!("Host name too long for SOCKS5: {}", target_host))
                })?;
                request.push(socks5::ATYP_DOMAIN);
                request.push(len);
                request.extend_from_slice(target_host.as_bytes());
            }
        }
        request.extend_from_slice(&target_port.to_be_bytes());
        Ok(request)
    }

    /// Consume the bound address of the reply; its value is not needed
    fn skip_bound_address(stream: &Socket, atyp: u8) -> Result<()> {
        let len = match atyp {
            socks5::ATYP_IPV4 => 4,
            socks5::ATYP_IPV6 => 16,
            socks5::ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                read_exact(stream, &mut len)?;
                usize::from(len[0])
            }
            other => return Err(Error::Proxy(format!("Invalid SOCKS5 address type {}", other))),
        };
        let mut rest = vec![0u8; len + 2];
        read_exact(stream, &mut rest)
    }
}

impl ProxyTunnel for Socks5Tunnel {
    fn open(&self, stream: &Socket, target_host: &str, target_port: u16) -> Result<()> {
        write_all(stream, &[socks5::VERSION, 0x01, socks5::NO_AUTH])?;

        let mut greeting = [0u8; 2];
        read_exact(stream, &mut greeting)?;
        if greeting[0] != socks5::VERSION {
            return Err(Error::Proxy(format!("Invalid SOCKS5 version {}", greeting[0])));
        }
        if greeting[1] != socks5::NO_AUTH {
            return Err(Error::Proxy("SOCKS5 proxy requires authentication".to_string()));
        }

        write_all(stream, &Self::connect_request(target_host, target_port)?)?;

        let mut header = [0u8; 4];
        read_exact(stream, &mut header)?;
        if header[0] != socks5::VERSION {
            return Err(Error::Proxy(format!("Invalid SOCKS5 version {}", header[0])));
        }
        // Drain the whole reply so closing after a rejection sends FIN, not RST
        Self::skip_bound_address(stream, header[3])?;
        if header[1] != socks5::SUCCEEDED {
            return Err(Error::Proxy(format!(
                "SOCKS5 connect failed: {} ({})",
                socks5::reply_message(header[1]),
                header[1]
            )));
        }
        Ok(())
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::Socks5
    }
}

fn handshake_error(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout,
        io::ErrorKind::UnexpectedEof => Error::Proxy("Proxy closed the connection".to_string()),
        _ => Error::Io(e),
    }
}

fn write_all(mut stream: &Socket, buf: &[u8]) -> Result<()> {
    stream.write_all(buf).map_err(handshake_error)
}

fn read_exact(mut stream: &Socket, buf: &mut [u8]) -> Result<()> {
    stream.read_exact(buf).map_err(handshake_error)
}
