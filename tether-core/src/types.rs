//! # Core Types
//!
//! Identifiers, protocol selectors and addresses shared by every crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a connection.
///
/// UDP pseudo-connections share one OS socket, so the raw descriptor cannot
/// tell them apart; registry lookups use this id instead.
///
/// # Examples
///
/// ```rust
/// use tether_core::ConnectionId;
///
/// let a = ConnectionId::next();
/// let b = ConnectionId::next();
/// assert!(b > a);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocates the next id from the process-wide counter.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Wire protocol used by a socket and all of its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Stream sockets with validator-based framing
    Tcp,
    /// Datagram sockets with the acknowledgement/retransmission header
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// Delivery intent of an outgoing UDP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FailPolicy {
    /// Keep the packet outstanding and resend it until acknowledged
    Resend,
    /// Fire and forget
    #[default]
    Ignore,
    /// Currently handled exactly like [`FailPolicy::Resend`]
    Notify,
}

impl FailPolicy {
    /// Whether packets with this policy are tracked until acknowledged.
    pub fn is_tracked(&self) -> bool {
        !matches!(self, FailPolicy::Ignore)
    }
}

/// Peer address of a connection, resolved once at accept/connect time.
///
/// # Examples
///
/// ```rust
/// use tether_core::PeerAddr;
/// use std::net::SocketAddr;
///
/// let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
/// let peer = PeerAddr::from(addr);
/// assert_eq!(peer.hostname(), "127.0.0.1");
/// assert_eq!(peer.port(), 4000);
/// assert!(peer.as_v4().is_some());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerAddr {
    V4(SocketAddrV4),
    V6(SocketAddrV6),
}

impl PeerAddr {
    pub fn ip(&self) -> IpAddr {
        match self {
            PeerAddr::V4(addr) => IpAddr::V4(*addr.ip()),
            PeerAddr::V6(addr) => IpAddr::V6(*addr.ip()),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            PeerAddr::V4(addr) => addr.port(),
            PeerAddr::V6(addr) => addr.port(),
        }
    }

    /// Textual form of the peer's IP address.
    pub fn hostname(&self) -> String {
        self.ip().to_string()
    }

    pub fn as_v4(&self) -> Option<&SocketAddrV4> {
        match self {
            PeerAddr::V4(addr) => Some(addr),
            PeerAddr::V6(_) => None,
        }
    }

    pub fn as_v6(&self) -> Option<&SocketAddrV6> {
        match self {
            PeerAddr::V4(_) => None,
            PeerAddr::V6(addr) => Some(addr),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        match self {
            PeerAddr::V4(addr) => SocketAddr::V4(*addr),
            PeerAddr::V6(addr) => SocketAddr::V6(*addr),
        }
    }

    /// Whether `addr` designates this same endpoint.
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        self.socket_addr() == *addr
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(addr) => PeerAddr::V4(addr),
            SocketAddr::V6(addr) => PeerAddr::V6(addr),
        }
    }
}

impl From<PeerAddr> for SocketAddr {
    fn from(addr: PeerAddr) -> Self {
        addr.socket_addr()
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_addr_families() {
        let v6: SocketAddr = "[::1]:5000".parse().unwrap();
        let peer = PeerAddr::from(v6);

        assert!(peer.as_v4().is_none());
        assert_eq!(peer.as_v6().unwrap().port(), 5000);
        assert_eq!(peer.hostname(), "::1");
        assert!(peer.matches(&v6));
        assert!(!peer.matches(&"[::1]:5001".parse().unwrap()));
    }

    #[test]
    fn test_fail_policy_tracking() {
        assert!(FailPolicy::Resend.is_tracked());
        assert!(FailPolicy::Notify.is_tracked());
        assert!(!FailPolicy::Ignore.is_tracked());
        assert_eq!(FailPolicy::default(), FailPolicy::Ignore);
    }
}
