//! Gossip-Node: the peer-to-peer layer of a blockchain node
//!
//! This crate provides:
//! - A gossip engine relaying addresses, intros, transactions and blocks
//! - A peer lifecycle manager (discovery, pinging, cleanup, bans)
//! - Connection accounting with inbound/outbound limits
//! - Chain sync via block hash locators and body batches
//! - Peer persistence on a pluggable key-value store
//!
//! # Example
//!
//! ```no_run
//! use gossip_node::config::NodeConfig;
//! use gossip_node::core::{MemoryChain, MemoryTxPool};
//! use gossip_node::network::Node;
//! use gossip_node::storage::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let node = Node::new(
//!     NodeConfig::default(),
//!     Arc::new(MemoryChain::new()),
//!     Arc::new(MemoryTxPool::new()),
//!     Arc::new(MemoryStore::new()),
//! )
//! .await?;
//! node.start().await;
//! println!("Listening on {}", node.address());
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod core;
pub mod events;
pub mod network;
pub mod storage;

#[cfg(test)]
mod testutil;

pub use config::NodeConfig;
pub use events::{Event, EventBus};
pub use network::{GossipManager, Node, PeerManager};
