//! Node event bus
//!
//! Gossip handlers publish what happened (addresses relayed, blocks processed,
//! transactions pooled...) so other components and tests can react without
//! the gossip layer knowing about them.

use crate::core::{Hash, TotalDifficulty};
use crate::network::addr::PeerId;
use tokio::sync::broadcast;

/// Default number of events buffered per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A peer's chain summary, learned from a handshake, ping or pong
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerChainInfo {
    pub peer_id: PeerId,
    pub best_block_hash: Hash,
    pub best_block_number: u64,
    pub best_block_total_difficulty: TotalDifficulty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PeerChainInfo(PeerChainInfo),
    /// An Addr message from a peer was handled
    AddrProcessed { error: Option<String> },
    /// A relay round finished; `count` is how many peers received the batch
    AddressesRelayed { count: usize },
    IntroReceived { peer_id: String, from: PeerId },
    BlockProcessed {
        hash: Hash,
        number: u64,
        error: Option<String>,
    },
    BlockBodiesProcessed { count: usize },
    BlockHashesRequested { peer: PeerId, locators: usize },
    BlockHashesReceived { peer: PeerId, hashes: Vec<Hash> },
    TxReceived { hash: Hash, from: PeerId },
    TxPooled { hash: Hash },
    TxInvalid { hash: Hash, error: String },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::PeerChainInfo(_) => "peer_chain_info",
            Event::AddrProcessed { .. } => "addr_processed",
            Event::AddressesRelayed { .. } => "addresses_relayed",
            Event::IntroReceived { .. } => "intro_received",
            Event::BlockProcessed { .. } => "block_processed",
            Event::BlockBodiesProcessed { .. } => "block_bodies_processed",
            Event::BlockHashesRequested { .. } => "block_hashes_requested",
            Event::BlockHashesReceived { .. } => "block_hashes_received",
            Event::TxReceived { .. } => "tx_received",
            Event::TxPooled { .. } => "tx_pooled",
            Event::TxInvalid { .. } => "tx_invalid",
        }
    }
}

/// Cloneable publisher over a tokio broadcast channel
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn emit(&self, event: Event) {
        log::trace!("event: {}", event.name());
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
