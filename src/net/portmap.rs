//! Port-mapping hook for listening sockets
//!
//! A [`PortMapper`] asks something outside this host (typically a UPnP
//! gateway) to forward an external port to a local one. The discovery and
//! mapping protocol itself lives behind the trait.

use std::fmt;
use std::sync::Arc;

use super::{Error, Result};

/// Transport protocol of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
        }
    }
}

/// External port mapping service.
pub trait PortMapper: Send + Sync {
    /// Expose `internal_port` externally, returning the external port.
    fn map_port(&self, internal_port: u16, protocol: Protocol) -> Result<u16>;

    /// Remove a mapping created by [`PortMapper::map_port`].
    fn unmap_port(&self, external_port: u16, protocol: Protocol) -> Result<()>;
}

/// Mapper used when none is configured; every request fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPortMapper;

impl PortMapper for NoPortMapper {
    fn map_port(&self, _internal_port: u16, _protocol: Protocol) -> Result<u16> {
        Err(Error::PortMapping("no port mapper configured".to_string()))
    }

    fn unmap_port(&self, _external_port: u16, _protocol: Protocol) -> Result<()> {
        Ok(())
    }
}

/// A live mapping, released through its mapper.
pub(crate) struct PortMapping {
    mapper: Arc<dyn PortMapper>,
    external_port: u16,
    protocol: Protocol,
}

impl PortMapping {
    /// Request a mapping for `internal_port`
    pub(crate) fn request(
        mapper: Arc<dyn PortMapper>,
        internal_port: u16,
        protocol: Protocol,
    ) -> Result<Self> {
        let external_port = mapper.map_port(internal_port, protocol)?;
        if external_port == 0 {
            return Err(Error::PortMapping("mapper returned port 0".to_string()));
        }
        Ok(PortMapping {
            mapper,
            external_port,
            protocol,
        })
    }

    pub(crate) fn external_port(&self) -> u16 {
        self.external_port
    }

    pub(crate) fn release(self) {
        match self.mapper.unmap_port(self.external_port, self.protocol) {
            Ok(()) => tracing::debug!(port = self.external_port, protocol = %self.protocol, "port mapping released"),
            Err(e) => tracing::warn!(port = self.external_port, error = %e, "failed to release port mapping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedMapper {
        port: u16,
        unmapped: AtomicUsize,
    }

    impl PortMapper for FixedMapper {
        fn map_port(&self, _internal_port: u16, _protocol: Protocol) -> Result<u16> {
            Ok(self.port)
        }

        fn unmap_port(&self, external_port: u16, _protocol: Protocol) -> Result<()> {
            assert_eq!(external_port, self.port);
            self.unmapped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_no_mapper_fails() {
        let err = PortMapping::request(Arc::new(NoPortMapper), 3665, Protocol::Tcp);
        assert!(matches!(err, Err(Error::PortMapping(_))));
    }

    #[test]
    fn test_zero_port_is_failure() {
        let mapper = Arc::new(FixedMapper {
            port: 0,
            unmapped: AtomicUsize::new(0),
        });
        assert!(PortMapping::request(mapper, 3665, Protocol::Udp).is_err());
    }

    #[test]
    fn test_release_unmaps() {
        let mapper = Arc::new(FixedMapper {
            port: 40000,
            unmapped: AtomicUsize::new(0),
        });
        let mapping = PortMapping::request(mapper.clone(), 3665, Protocol::Tcp).unwrap();
        assert_eq!(mapping.external_port(), 40000);
        mapping.release();
        assert_eq!(mapper.unmapped.load(Ordering::SeqCst), 1);
    }
}
