//! sockwrap: portable socket handles
//!
//! [`net::SocketHandle`] wraps one OS socket behind a cloneable, reference-counted
//! value. It resolves host names, connects directly or through a SOCKS proxy,
//! listens (optionally asking a [`net::PortMapper`] to expose the port) and
//! performs connected or addressed I/O.
//!
//! ```no_run
//! use sockwrap::net::{self, ProxySettings, RecvOutcome, SocketHandle};
//!
//! net::initialize();
//! let mut socket = SocketHandle::new();
//! socket.connect("example.com", 80, false, &ProxySettings::none())?;
//! socket.send(b"GET / HTTP/1.0\r\n\r\n")?;
//! let mut buf = [0u8; 512];
//! if let RecvOutcome::Data(n) = socket.recv(&mut buf, true)? {
//!     println!("{}", String::from_utf8_lossy(&buf[..n]));
//! }
//! # Ok::<(), sockwrap::net::Error>(())
//! ```

pub mod logging;
pub mod net;
