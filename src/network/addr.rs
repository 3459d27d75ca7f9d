//! Peer identity and network addresses
//!
//! A peer is identified by a 32-byte id and reached at a `NodeAddr`, written
//! as `<peer-id-hex>@<ip>:<port>`. Routability checks follow the reserved
//! ranges of RFC 1918, 3927, 4193, 4843, 5737, 6598 and friends.

use crate::core::hash::sha256;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Address parse errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    #[error("missing peer id")]
    MissingPeerId,
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),
    #[error("invalid socket address: {0}")]
    InvalidSocket(String),
}

/// Peer identity derived from a 32-byte key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Deterministic id, used by tests and `--seed`
    pub fn from_seed(seed: u64) -> Self {
        PeerId(sha256(&seed.to_be_bytes()))
    }

    pub fn random() -> Self {
        PeerId(rand::thread_rng().gen())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> String {
        let hex = hex::encode(self.0);
        format!("{}..{}", &hex[..6], &hex[hex.len() - 6..])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out).map_err(|_| AddrError::InvalidPeerId(s.to_string()))?;
        Ok(PeerId(out))
    }
}

/// Dialable peer address: identity plus socket
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr {
    pub id: PeerId,
    pub socket: SocketAddr,
}

impl NodeAddr {
    pub fn new(id: PeerId, socket: SocketAddr) -> Self {
        Self { id, socket }
    }

    pub fn ip(&self) -> IpAddr {
        self.socket.ip()
    }

    pub fn is_routable(&self) -> bool {
        is_routable(&self.socket.ip())
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.socket)
    }
}

impl fmt::Debug for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id.short(), self.socket)
    }
}

impl FromStr for NodeAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, socket) = s.trim().split_once('@').ok_or(AddrError::MissingPeerId)?;
        let id: PeerId = id.parse()?;
        let socket: SocketAddr = socket
            .parse()
            .map_err(|_| AddrError::InvalidSocket(socket.to_string()))?;
        if socket.port() == 0 {
            return Err(AddrError::InvalidSocket(socket.to_string()));
        }
        Ok(NodeAddr { id, socket })
    }
}

// =============================================================================
// Routability
// =============================================================================

/// Whether an IP is publicly reachable
pub fn is_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_routable_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_routable_v4(&v4),
            None => is_routable_v6(v6),
        },
    }
}

fn in_v4_range(ip: &Ipv4Addr, base: [u8; 4], prefix: u32) -> bool {
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    (u32::from(*ip) & mask) == (u32::from(Ipv4Addr::from(base)) & mask)
}

fn is_routable_v4(ip: &Ipv4Addr) -> bool {
    let reserved: [([u8; 4], u32); 11] = [
        ([0, 0, 0, 0], 8),        // this network
        ([10, 0, 0, 0], 8),       // RFC 1918
        ([100, 64, 0, 0], 10),    // RFC 6598 shared address space
        ([127, 0, 0, 0], 8),      // loopback
        ([169, 254, 0, 0], 16),   // RFC 3927 link local
        ([172, 16, 0, 0], 12),    // RFC 1918
        ([192, 0, 2, 0], 24),     // RFC 5737 TEST-NET-1
        ([192, 168, 0, 0], 16),   // RFC 1918
        ([198, 18, 0, 0], 15),    // RFC 2544 benchmarking
        ([198, 51, 100, 0], 24),  // RFC 5737 TEST-NET-2
        ([203, 0, 113, 0], 24),   // RFC 5737 TEST-NET-3
    ];
    if reserved.iter().any(|(base, prefix)| in_v4_range(ip, *base, *prefix)) {
        return false;
    }
    !(ip.is_broadcast() || ip.is_multicast() || in_v4_range(ip, [240, 0, 0, 0], 4))
}

fn is_routable_v6(ip: &Ipv6Addr) -> bool {
    if ip.is_unspecified() || ip.is_loopback() || ip.is_multicast() {
        return false;
    }
    let segments = ip.segments();
    let unique_local = (segments[0] & 0xfe00) == 0xfc00; // RFC 4193
    let link_local = (segments[0] & 0xffc0) == 0xfe80; // RFC 4862
    let documentation = segments[0] == 0x2001 && segments[1] == 0x0db8; // RFC 3849
    let orchid = segments[0] == 0x2001 && (segments[1] & 0xfff0) == 0x0010; // RFC 4843
    !(unique_local || link_local || documentation || orchid)
}
