//! Peer and client identity types.
//!
//! [`PeerAddress`] names a remote endpoint; [`ClientId`] names one
//! connection for the lifetime of that connection so the pool manager can
//! track which client holds which peer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::error::PeerlinkError;

static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A remote peer endpoint reachable over TCP.
///
/// Equality and hashing use the `(host, port)` pair, so `localhost:80` and
/// `127.0.0.1:80` are distinct peers.
///
/// # Example
///
/// ```
/// use peerlink_common::PeerAddress;
///
/// let peer: PeerAddress = "10.0.0.7:4000".parse().unwrap();
/// assert_eq!(peer, PeerAddress::new("10.0.0.7", 4000));
/// assert_eq!(peer.to_string(), "10.0.0.7:4000");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    host: String,
    port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for PeerAddress {
    type Err = PeerlinkError;

    /// Parses `host:port`, or `[v6addr]:port` for IPv6 literals.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| PeerlinkError::InvalidConfig(format!("peer address '{}' has no port", s)))?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if host.is_empty() {
            return Err(PeerlinkError::InvalidConfig(format!("peer address '{}' has no host", s)));
        }

        let port = port
            .parse::<u16>()
            .map_err(|e| PeerlinkError::InvalidConfig(format!("peer address '{}' has invalid port: {}", s, e)))?;

        Ok(Self::new(host, port))
    }
}

impl From<std::net::SocketAddr> for PeerAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Identifier of one client connection.
///
/// Generated from a process-wide counter, so ids are unique and never
/// reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(u64);

impl ClientId {
    /// Allocates the next unused client id.
    pub fn next() -> Self {
        ClientId(CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps a raw value. Meant for tests and log correlation; ids obtained
    /// this way are not guaranteed unique.
    pub fn from_raw(raw: u64) -> Self {
        ClientId(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}
