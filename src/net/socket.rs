//! Reference-counted socket handles
//!
//! A [`SocketHandle`] is a cheap value: cloning it shares the underlying
//! descriptor instead of duplicating it. The descriptor, and any port
//! mapping attached to it, is released when the last clone is closed or
//! dropped.

use std::cmp::Ordering;
use std::fmt;
use std::io::{self, Read};
use std::mem::{self, MaybeUninit};
use std::net::{IpAddr, Shutdown};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Protocol as SockProtocol, SockAddr as Socket2Addr, Socket, Type};
use tracing::{debug, info, warn};

use super::addr::{ip_to_string, AddressUnion, Family, PeerAddr};
use super::portmap::{NoPortMapper, PortMapper, PortMapping, Protocol};
use super::proxy::{ProxyKind, ProxySettings};
use super::resolver::{HostAddr, ResolvedAddr};
use super::{Error, Result, SocketConfig};

/// Lifecycle state of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// No descriptor
    Invalid,
    /// Descriptor allocated, neither listening nor connected
    Valid,
    Listen,
    Connected,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of a successful receive call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// This many bytes were read
    Data(usize),
    /// Non-blocking receive with nothing pending
    WouldBlock,
    /// The peer shut the connection down in order
    Closed,
}

/// State shared by all clones of one handle.
struct SharedSocket {
    socket: Socket,
    mapping: Option<PortMapping>,
}

impl Drop for SharedSocket {
    fn drop(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            mapping.release();
        }
        debug!(fd = self.socket.as_raw_fd(), "closing socket");
    }
}

/// Portable socket handle with shared ownership of its descriptor.
#[derive(Clone)]
pub struct SocketHandle {
    shared: Option<Arc<SharedSocket>>,
    status: Status,
    is_broadcast: bool,
    /// Externally mapped port or 0
    upnp_port: u16,
    config: SocketConfig,
    port_mapper: Arc<dyn PortMapper>,
}

impl Default for SocketHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketHandle {
    /// Create an invalid handle with default settings
    pub fn new() -> Self {
        SocketHandle {
            shared: None,
            status: Status::Invalid,
            is_broadcast: false,
            upnp_port: 0,
            config: SocketConfig::default(),
            port_mapper: Arc::new(NoPortMapper),
        }
    }

    /// Use `config` for subsequent connects and listens
    pub fn with_config(mut self, config: SocketConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `mapper` when [`SocketHandle::listen`] is asked to map the port
    pub fn with_port_mapper(mut self, mapper: Arc<dyn PortMapper>) -> Self {
        self.port_mapper = mapper;
        self
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// Replace whatever this handle holds with `socket`
    fn set(&mut self, socket: Socket, status: Status, mapping: Option<PortMapping>) {
        self.close();
        self.upnp_port = mapping.as_ref().map(PortMapping::external_port).unwrap_or(0);
        self.shared = Some(Arc::new(SharedSocket { socket, mapping }));
        self.status = status;
    }

    /// A fresh handle for an accepted connection, inheriting our settings
    fn adopt(&self, socket: Socket, status: Status) -> SocketHandle {
        let mut handle = SocketHandle::new()
            .with_config(self.config.clone())
            .with_port_mapper(Arc::clone(&self.port_mapper));
        handle.set(socket, status, None);
        handle
    }

    fn socket(&self) -> Result<&Socket> {
        match &self.shared {
            Some(shared) => Ok(&shared.socket),
            None => Err(Error::InvalidState {
                expected: Status::Valid,
                actual: self.status,
            }),
        }
    }

    /// Allocate a new socket of `family`.
    ///
    /// Plain sockets are TCP streams. With `as_broadcast` the socket is a UDP
    /// datagram socket with `SO_BROADCAST` set. Anything held before is
    /// closed first; on failure the handle is left invalid.
    pub fn create(&mut self, family: Family, as_broadcast: bool) -> Result<()> {
        self.close();

        let socket = if as_broadcast {
            let socket = Socket::new(family.domain(), Type::DGRAM, Some(SockProtocol::UDP))?;
            socket.set_broadcast(true)?;
            socket.set_reuse_address(true)?;
            socket
        } else {
            Socket::new(family.domain(), Type::STREAM, Some(SockProtocol::TCP))?
        };

        debug!(fd = socket.as_raw_fd(), ?family, broadcast = as_broadcast, "socket created");
        self.set(socket, Status::Valid, None);
        self.is_broadcast = as_broadcast;
        Ok(())
    }

    /// Allocate a UDP socket for addressed sends and receives.
    pub fn create_datagram(&mut self, family: Family) -> Result<()> {
        self.close();
        let socket = Socket::new(family.domain(), Type::DGRAM, Some(SockProtocol::UDP))?;
        debug!(fd = socket.as_raw_fd(), ?family, "datagram socket created");
        self.set(socket, Status::Valid, None);
        Ok(())
    }

    /// Drop this handle's reference to the descriptor.
    ///
    /// The descriptor itself is closed once no other clone refers to it.
    /// Closing an invalid handle does nothing.
    pub fn close(&mut self) {
        self.shared = None;
        self.status = Status::Invalid;
        self.is_broadcast = false;
        self.upnp_port = 0;
    }

    /// Move the handle out, leaving an invalid one in its place
    pub fn take(&mut self) -> SocketHandle {
        mem::take(self)
    }

    /// Exchange the complete state of two handles
    pub fn swap(&mut self, other: &mut SocketHandle) {
        mem::swap(self, other);
    }

    /// Bind the held socket to `port` on the wildcard address
    pub fn bind(&self, port: u16, use_ipv6: bool) -> Result<()> {
        let socket = self.socket()?;
        let addr = Family::from_ipv6(use_ipv6).unspecified(port);
        socket.bind(&Socket2Addr::from(addr))?;
        Ok(())
    }

    /// Listen for connections on `port` (0 picks a free one).
    ///
    /// With `use_upnp` the configured [`PortMapper`] is asked to expose the
    /// port. A failed mapping is not an error: the socket still listens and
    /// [`SocketHandle::upnp_port`] stays 0. On failure the handle is left
    /// as it was.
    pub fn listen(&mut self, port: u16, use_ipv6: bool, use_upnp: bool) -> Result<()> {
        let family = Family::from_ipv6(use_ipv6);
        let socket = Socket::new(family.domain(), Type::STREAM, Some(SockProtocol::TCP))?;
        socket.set_reuse_address(self.config.reuse_address)?;
        if use_ipv6 {
            socket.set_only_v6(true)?;
        }
        socket.bind(&Socket2Addr::from(family.unspecified(port)))?;
        socket.listen(self.config.backlog)?;

        let local_port = socket
            .local_addr()?
            .as_socket()
            .map(|addr| addr.port())
            .unwrap_or(port);

        let mapping = if use_upnp {
            match PortMapping::request(Arc::clone(&self.port_mapper), local_port, Protocol::Tcp) {
                Ok(mapping) => {
                    info!(port = local_port, external_port = mapping.external_port(), "port mapped");
                    Some(mapping)
                }
                Err(e) => {
                    warn!(port = local_port, error = %e, "port mapping failed, listening locally only");
                    None
                }
            }
        } else {
            None
        };

        self.set(socket, Status::Listen, mapping);
        info!(port = local_port, ipv6 = use_ipv6, upnp_port = self.upnp_port, "listening");
        Ok(())
    }

    /// Accept one pending connection.
    ///
    /// Only valid on a listening handle. The returned handle is Connected
    /// and owns its descriptor alone. On a non-blocking listener with nothing
    /// pending this returns [`Error::WouldBlock`].
    pub fn accept(&self) -> Result<SocketHandle> {
        if self.status != Status::Listen {
            return Err(Error::InvalidState {
                expected: Status::Listen,
                actual: self.status,
            });
        }

        let (socket, peer) = match self.socket()?.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Err(Error::WouldBlock),
            Err(e) => return Err(Error::Io(e)),
        };
        socket.set_nodelay(self.config.nodelay)?;

        debug!(peer = %AddressUnion::from_sock_addr(peer), "connection accepted");
        Ok(self.adopt(socket, Status::Connected))
    }

    /// Connect to `hostname:port` using the proxy from the handle's config
    pub fn connect_with_config(&mut self, hostname: &str, port: u16, use_ipv6: bool) -> Result<()> {
        let proxy = self.config.proxy.clone();
        self.connect(hostname, port, use_ipv6, &proxy)
    }

    /// Connect to `hostname:port`, directly or through `proxy`.
    ///
    /// Every resolved candidate is tried in order until one accepts. With a
    /// proxy the candidates are those of the proxy endpoint, and the handle
    /// only becomes Connected once the tunnel to the target is negotiated.
    /// On failure the handle is left as it was and nothing stays open.
    pub fn connect(
        &mut self,
        hostname: &str,
        port: u16,
        use_ipv6: bool,
        proxy: &ProxySettings,
    ) -> Result<()> {
        let tunnel = proxy.tunnel();

        let endpoint = match tunnel {
            None => HostAddr::new(hostname, port, use_ipv6, false),
            Some(_) => {
                // A literal proxy address picks its own family
                let proxy_ipv6 = match proxy.host.parse::<IpAddr>() {
                    Ok(ip) => ip.is_ipv6(),
                    Err(_) => use_ipv6 && proxy.kind != ProxyKind::Socks4,
                };
                HostAddr::new(proxy.host.as_str(), proxy.port, proxy_ipv6, false)
            }
        };

        let resolved = ResolvedAddr::new(&endpoint, true);
        if !resolved.is_valid() {
            return Err(Error::ResolutionFailed(format!(
                "{}:{}",
                endpoint.host, endpoint.port
            )));
        }

        let mut last_err = None;
        let mut connected = None;
        for candidate in &resolved {
            match self.connect_candidate(candidate) {
                Ok(socket) => {
                    connected = Some(socket);
                    break;
                }
                Err(e) => {
                    debug!(addr = %candidate, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        let socket = match connected {
            Some(socket) => socket,
            None => {
                return Err(last_err.unwrap_or_else(|| {
                    Error::ResolutionFailed(format!("{}:{}", endpoint.host, endpoint.port))
                }))
            }
        };

        if let Some(tunnel) = tunnel {
            let timeout = self.config.connect_timeout();
            socket.set_read_timeout(timeout)?;
            socket.set_write_timeout(timeout)?;
            if let Err(e) = tunnel.open(&socket, hostname, port) {
                warn!(proxy = %proxy.host, kind = %tunnel.kind(), dest = hostname, error = %e, "proxy negotiation failed");
                return Err(e);
            }
            socket.set_read_timeout(None)?;
            socket.set_write_timeout(None)?;
            debug!(proxy = %proxy.host, kind = %tunnel.kind(), dest = hostname, port, "proxy tunnel established");
        }

        socket.set_nodelay(self.config.nodelay)?;
        self.set(socket, Status::Connected, None);
        info!(host = hostname, port, "connected");
        Ok(())
    }

    /// Open a stream socket to one resolved candidate
    fn connect_candidate(&self, candidate: &PeerAddr) -> Result<Socket> {
        let family = candidate
            .addr()
            .family()
            .ok_or_else(|| Error::UnsupportedFamily(candidate.to_string()))?;
        let socket = Socket::new(family.domain(), Type::STREAM, Some(SockProtocol::TCP))?;
        let addr = candidate.to_sock_addr();

        match self.config.connect_timeout() {
            Some(timeout) => {
                socket.set_nonblocking(true)?;
                match socket.connect(&addr) {
                    Ok(()) => {}
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.raw_os_error() == Some(libc::EINPROGRESS) =>
                    {
                        wait_for_connect(&socket, timeout)?;
                    }
                    Err(e) => return Err(Error::from(e)),
                }
                socket.set_nonblocking(false)?;
            }
            None => socket.connect(&addr)?,
        }

        Ok(socket)
    }

    /// Receive on a connected socket.
    ///
    /// With `block` unset and nothing pending this returns
    /// [`RecvOutcome::WouldBlock`] at once. An empty buffer reads nothing.
    pub fn recv(&self, buf: &mut [u8], block: bool) -> Result<RecvOutcome> {
        let mut socket = self.socket()?;
        if buf.is_empty() {
            return Ok(RecvOutcome::Data(0));
        }
        if !block && !poll_readable(socket, 0)? {
            return Ok(RecvOutcome::WouldBlock);
        }

        match socket.read(buf) {
            Ok(0) => Ok(RecvOutcome::Closed),
            Ok(n) => Ok(RecvOutcome::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(RecvOutcome::WouldBlock),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Receive one datagram and the address it came from
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, PeerAddr)> {
        let socket = self.socket()?;
        // SAFETY: recvfrom only writes into the buffer; u8 and MaybeUninit<u8>
        // share a layout and every u8 is already initialized.
        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        let (n, addr) = socket.recv_from(uninit)?;
        Ok((n, PeerAddr::from(AddressUnion::from_sock_addr(addr))))
    }

    /// Send on a connected socket
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        Ok(self.socket()?.send(buf)?)
    }

    /// Send the whole of `buf`, retrying after short writes
    pub fn send_all(&self, mut buf: &[u8]) -> Result<()> {
        let socket = self.socket()?;
        while !buf.is_empty() {
            match socket.send(buf) {
                Ok(0) => return Err(Error::Io(io::ErrorKind::WriteZero.into())),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Send a datagram to `addr`; the socket need not be connected
    pub fn send_to(&self, buf: &[u8], addr: &PeerAddr) -> Result<usize> {
        Ok(self.socket()?.send_to(buf, &addr.to_sock_addr())?)
    }

    /// Number of bytes that can be read without blocking
    pub fn bytes_waiting(&self) -> Result<usize> {
        let fd = self.socket()?.as_raw_fd();
        let mut pending: libc::c_int = 0;
        // SAFETY: FIONREAD writes one c_int through the pointer, which refers
        // to a live local; `fd` is owned by this handle for the call.
        let ret = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut pending) };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(usize::try_from(pending).unwrap_or(0))
    }

    /// Address of the remote end
    pub fn peer_addr(&self) -> Result<PeerAddr> {
        let addr = self.socket()?.peer_addr()?;
        Ok(PeerAddr::from(AddressUnion::from_sock_addr(addr)))
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> Result<PeerAddr> {
        let addr = self.socket()?.local_addr()?;
        Ok(PeerAddr::from(AddressUnion::from_sock_addr(addr)))
    }

    /// IP of the remote end as text
    pub fn peer_ip(&self) -> Result<String> {
        Ok(ip_to_string(self.peer_addr()?.addr()))
    }

    /// IP of the local end as text
    pub fn sock_ip(&self) -> Result<String> {
        Ok(ip_to_string(self.local_addr()?.addr()))
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.local_addr()?.port())
    }

    pub fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        Ok(self.socket()?.set_nodelay(nodelay)?)
    }

    pub fn set_broadcast(&mut self, broadcast: bool) -> Result<()> {
        self.socket()?.set_broadcast(broadcast)?;
        self.is_broadcast = broadcast;
        Ok(())
    }

    /// Set socket to blocking or non-blocking mode
    pub fn set_blocking(&self, blocking: bool) -> Result<()> {
        Ok(self.socket()?.set_nonblocking(!blocking)?)
    }

    /// Shut down one or both directions for every clone.
    ///
    /// A call blocked on another thread returns once the socket is shut down.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        Ok(self.socket()?.shutdown(how)?)
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_valid(&self) -> bool {
        self.status != Status::Invalid
    }

    /// Whether this is a broadcast socket; meaningful only while valid
    pub fn is_broadcast(&self) -> bool {
        self.is_broadcast
    }

    /// Externally mapped port, 0 when unmapped
    pub fn upnp_port(&self) -> u16 {
        self.upnp_port
    }

    /// Number of handles sharing the descriptor, 0 when invalid
    pub fn ref_count(&self) -> usize {
        self.shared.as_ref().map(Arc::strong_count).unwrap_or(0)
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.shared.as_ref().map(|shared| shared.socket.as_raw_fd())
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandle")
            .field("fd", &self.raw_fd())
            .field("status", &self.status)
            .field("is_broadcast", &self.is_broadcast)
            .field("upnp_port", &self.upnp_port)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Handles compare by descriptor; invalid handles sort first.
impl PartialEq for SocketHandle {
    fn eq(&self, other: &Self) -> bool {
        self.raw_fd() == other.raw_fd()
    }
}

impl Eq for SocketHandle {}

impl PartialOrd for SocketHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SocketHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw_fd().cmp(&other.raw_fd())
    }
}

fn poll_readable(socket: &Socket, timeout_ms: i32) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN};

    let mut pfd = pollfd {
        fd: socket.as_raw_fd(),
        events: POLLIN,
        revents: 0,
    };

    // SAFETY: `pfd` is a single valid pollfd for the duration of the call.
    let ret = unsafe { poll(&mut pfd, 1, timeout_ms) };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(ret > 0)
}

/// Wait for a non-blocking connect to complete
fn wait_for_connect(socket: &Socket, timeout: Duration) -> Result<()> {
    use libc::{poll, pollfd, POLLOUT};

    let mut pfd = pollfd {
        fd: socket.as_raw_fd(),
        events: POLLOUT,
        revents: 0,
    };

    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    // SAFETY: `pfd` is a single valid pollfd for the duration of the call.
    let ret = unsafe { poll(&mut pfd, 1, timeout_ms) };

    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    if ret == 0 {
        return Err(Error::Timeout);
    }

    if let Some(err) = socket.take_error()? {
        return Err(Error::Io(err));
    }

    Ok(())
}
