//! Peer model
//!
//! `LocalNode` is this process; `RemotePeer` is a snapshot of everything the
//! registry knows about another node. Both expose the small `Engine`
//! capability interface used by the managers.

use crate::config::NodeConfig;
use crate::network::addr::{NodeAddr, PeerId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

/// Capabilities shared by local and remote nodes
pub trait Engine {
    fn id(&self) -> PeerId;
    fn address(&self) -> NodeAddr;
    fn is_hardcoded_seed(&self) -> bool;

    fn short_id(&self) -> String {
        self.id().short()
    }
}

// =============================================================================
// Remote peer
// =============================================================================

/// A known remote node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
    pub address: NodeAddr,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// A live connection exists
    pub connected: bool,
    /// The live connection was opened by the remote side
    pub inbound: bool,
    /// Configured as a bootstrap node
    pub hardcoded_seed: bool,
}

impl RemotePeer {
    pub fn new(address: NodeAddr) -> Self {
        let now = Utc::now();
        Self {
            address,
            created_at: now,
            last_seen: now,
            connected: false,
            inbound: false,
            hardcoded_seed: false,
        }
    }

    /// Whether the peer was seen within `window` of `now`
    pub fn seen_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_seen <= window
    }
}

impl Engine for RemotePeer {
    fn id(&self) -> PeerId {
        self.address.id
    }

    fn address(&self) -> NodeAddr {
        self.address
    }

    fn is_hardcoded_seed(&self) -> bool {
        self.hardcoded_seed
    }
}

/// Persisted form of a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub address: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Ban end, if banned
    pub ban_end: Option<DateTime<Utc>>,
}

// =============================================================================
// Local node
// =============================================================================

/// This node
pub struct LocalNode {
    address: NodeAddr,
    config: NodeConfig,
    hardcoded: RwLock<HashSet<PeerId>>,
    stopped: AtomicBool,
    network_disabled: AtomicBool,
}

impl LocalNode {
    pub fn new(address: NodeAddr, config: NodeConfig) -> Self {
        Self {
            address,
            config,
            hardcoded: RwLock::new(HashSet::new()),
            stopped: AtomicBool::new(false),
            network_disabled: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn test_mode(&self) -> bool {
        self.config.test_mode
    }

    pub fn dev_mode(&self) -> bool {
        self.config.dev_mode
    }

    pub fn prod_mode(&self) -> bool {
        self.config.is_prod_mode()
    }

    pub fn has_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Mark stopped; returns false if it already was
    pub fn set_stopped(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    pub fn is_network_disabled(&self) -> bool {
        self.network_disabled.load(Ordering::SeqCst)
    }

    pub fn set_network_disabled(&self, disabled: bool) {
        self.network_disabled.store(disabled, Ordering::SeqCst);
    }

    pub fn add_hardcoded_seed(&self, id: PeerId) {
        self.hardcoded
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }

    pub fn is_hardcoded(&self, id: &PeerId) -> bool {
        self.hardcoded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    pub fn is_same(&self, other: &impl Engine) -> bool {
        other.id() == self.address.id
    }

    /// Build a remote peer record for `address`
    pub fn new_remote_node(&self, address: NodeAddr) -> RemotePeer {
        let mut peer = RemotePeer::new(address);
        peer.hardcoded_seed = self.is_hardcoded(&address.id);
        peer
    }
}

impl Engine for LocalNode {
    fn id(&self) -> PeerId {
        self.address.id
    }

    fn address(&self) -> NodeAddr {
        self.address
    }

    fn is_hardcoded_seed(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(seed: u64) -> NodeAddr {
        NodeAddr::new(PeerId::from_seed(seed), "127.0.0.1:9000".parse().unwrap())
    }

    #[test]
    fn test_remote_node_inherits_hardcoded_flag() {
        let local = LocalNode::new(addr(1), NodeConfig::default());
        local.add_hardcoded_seed(PeerId::from_seed(2));

        assert!(local.new_remote_node(addr(2)).is_hardcoded_seed());
        assert!(!local.new_remote_node(addr(3)).is_hardcoded_seed());
        assert!(local.is_same(&local.new_remote_node(addr(1))));
    }

    #[test]
    fn test_stopped_flag() {
        let local = LocalNode::new(addr(1), NodeConfig::default());
        assert!(!local.has_stopped());
        assert!(local.set_stopped());
        assert!(!local.set_stopped());
        assert!(local.has_stopped());
    }

    #[test]
    fn test_seen_within() {
        let mut peer = RemotePeer::new(addr(2));
        let now = Utc::now();
        peer.last_seen = now - Duration::hours(2);
        assert!(peer.seen_within(Duration::hours(3), now));
        assert!(!peer.seen_within(Duration::hours(1), now));
    }
}
