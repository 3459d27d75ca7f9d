//! P2P networking module
//!
//! Provides the gossip layer of the node.
//!
//! # Features
//! - Framed TCP transport with per-protocol streams
//! - Peer registry with persistence, bans and connection failure tracking
//! - Address, intro, transaction and block gossip
//! - Chain synchronization through block hash locators
//! - Inbound/outbound connection limits

pub mod addr;
pub mod broadcast;
pub mod codec;
pub mod conn_manager;
pub mod gossip;
pub mod host;
pub mod message;
pub mod node;
pub mod peer;
pub mod peer_manager;

pub use addr::{is_routable, AddrError, NodeAddr, PeerId};
pub use broadcast::BroadcastPeers;
pub use conn_manager::{ConnectionManager, ConnsInfo};
pub use gossip::{GossipError, GossipManager};
pub use host::{Direction, Host, HostError, Stream};
pub use message::{Protocol, CLIENT_VERSION, MAGIC, NET_VERSION};
pub use node::{Node, NodeError};
pub use peer::{Engine, LocalNode, PeerRecord, RemotePeer};
pub use peer_manager::PeerManager;
