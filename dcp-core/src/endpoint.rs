//! Addressing for KV nodes a DCP channel connects to.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Address of a KV node's memcached port, as reported by the cluster config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress(SocketAddr);

impl NodeAddress {
    /// Wrap a resolved socket address.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    /// Parse a `host:port` or `tcp://host:port` address.
    ///
    /// # Examples
    ///
    /// ```
    /// use dcp_core::endpoint::NodeAddress;
    ///
    /// let addr = NodeAddress::parse("127.0.0.1:11210").unwrap();
    /// assert_eq!(addr.socket_addr().port(), 11210);
    ///
    /// let addr = NodeAddress::parse("tcp://127.0.0.1:11210").unwrap();
    /// assert_eq!(addr.socket_addr().port(), 11210);
    /// ```
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        s.parse()
    }

    /// The underlying resolved socket address.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl FromStr for NodeAddress {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr = s.strip_prefix("tcp://").unwrap_or(s);
        addr.parse::<SocketAddr>()
            .map(NodeAddress)
            .map_err(|_| EndpointError::InvalidTcpAddress(addr.to_string()))
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddr> for NodeAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

/// Errors parsing or resolving a node address.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("invalid node address: {0}")]
    InvalidTcpAddress(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_host_port() {
        let addr = NodeAddress::parse("127.0.0.1:11210").unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:11210");
    }

    #[test]
    fn parse_with_tcp_scheme() {
        let addr = NodeAddress::parse("tcp://127.0.0.1:11210").unwrap();
        assert_eq!(addr.socket_addr().port(), 11210);
    }

    #[test]
    fn parse_ipv6() {
        let addr = NodeAddress::parse("[::1]:11210").unwrap();
        assert_eq!(addr.socket_addr().port(), 11210);
    }

    #[test]
    fn rejects_garbage() {
        let result = NodeAddress::parse("not-an-address");
        assert!(matches!(result, Err(EndpointError::InvalidTcpAddress(_))));
    }
}
