//! P2P Node implementation
//!
//! The node owns the event bus, the caches and the transport, and wires the
//! peer manager, connection manager and gossip engine together.

use crate::cache::HistoryCache;
use crate::config::{ConfigError, NodeConfig};
use crate::core::{Blockchain, TxPool};
use crate::events::EventBus;
use crate::network::addr::{NodeAddr, PeerId};
use crate::network::gossip::GossipManager;
use crate::network::host::{Host, HostError};
use crate::network::peer::{Engine, LocalNode};
use crate::network::peer_manager::PeerManager;
use crate::storage::{KvStore, StorageError};
use std::sync::Arc;
use thiserror::Error;

/// Capacity of the message history cache
pub const HISTORY_CACHE_SIZE: usize = 50_000;

/// Capacity of the recent-intro cache
pub const INTRO_CACHE_SIZE: usize = 10_000;

/// Node errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Transport error: {0}")]
    Host(#[from] HostError),
    #[error("Invalid bootstrap address {0}")]
    InvalidAddress(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// The main P2P node
pub struct Node {
    local: Arc<LocalNode>,
    host: Arc<Host>,
    events: EventBus,
    history: Arc<HistoryCache>,
    intros: Arc<HistoryCache>,
    pm: Arc<PeerManager>,
    gossip: Arc<GossipManager>,
    seeds: Vec<NodeAddr>,
}

impl Node {
    /// Create a node and bind its listener
    pub async fn new(
        config: NodeConfig,
        blockchain: Arc<dyn Blockchain>,
        tx_pool: Arc<dyn TxPool>,
        store: Arc<dyn KvStore>,
    ) -> Result<Self, NodeError> {
        config.validate()?;

        let seeds = config
            .bootstrap_nodes
            .iter()
            .map(|s| {
                s.parse::<NodeAddr>()
                    .map_err(|e| NodeError::InvalidAddress(format!("{}: {}", s, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let id = match config.seed {
            Some(seed) => PeerId::from_seed(seed),
            None => PeerId::random(),
        };

        let host = Host::bind(id, config.listen_addr, config.message_timeout()).await?;
        let local = Arc::new(LocalNode::new(host.local_addr(), config));
        let events = EventBus::default();
        let history = Arc::new(HistoryCache::new(HISTORY_CACHE_SIZE));
        let intros = Arc::new(HistoryCache::new(INTRO_CACHE_SIZE));

        let pm = PeerManager::new(local.clone(), host.clone(), store);
        host.notify(pm.conn_mgr().clone());

        let gossip = GossipManager::new(
            local.clone(),
            host.clone(),
            pm.clone(),
            blockchain,
            tx_pool,
            history.clone(),
            intros.clone(),
            events.clone(),
        );
        pm.set_gossip(&gossip);
        gossip.register_handlers();

        log::info!("Node {} created ({})", local.short_id(), local.address());

        Ok(Self {
            local,
            host,
            events,
            history,
            intros,
            pm,
            gossip,
            seeds,
        })
    }

    /// Register bootstrap nodes, start the managers and contact the seeds
    pub async fn start(&self) {
        for addr in &self.seeds {
            self.local.add_hardcoded_seed(addr.id);
            self.pm.add_peer(self.local.new_remote_node(*addr)).await;
        }

        self.gossip.start();
        self.pm.manage().await;

        for addr in &self.seeds {
            let pm = self.pm.clone();
            let peer = self.local.new_remote_node(*addr);
            tokio::spawn(async move {
                if let Err(e) = pm.connect_to_node(&peer).await {
                    log::warn!("Failed to connect to bootstrap node {}: {}", peer.short_id(), e);
                }
            });
        }

        log::info!("Node {} started with {} seed(s)", self.local.short_id(), self.seeds.len());
    }

    /// Stop the managers and close the transport
    pub async fn stop(&self) {
        if !self.local.set_stopped() {
            return;
        }
        self.pm.stop().await;
        self.gossip.stop();
        self.host.close();
        log::info!("Node {} stopped", self.local.short_id());
    }

    /// Pause or resume the periodic network loops
    pub fn disable_network(&self, disabled: bool) {
        self.local.set_network_disabled(disabled);
    }

    pub fn id(&self) -> PeerId {
        self.local.id()
    }

    pub fn address(&self) -> NodeAddr {
        self.local.address()
    }

    pub fn local(&self) -> &Arc<LocalNode> {
        &self.local
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.pm
    }

    pub fn gossip(&self) -> &Arc<GossipManager> {
        &self.gossip
    }

    pub fn history(&self) -> &Arc<HistoryCache> {
        &self.history
    }

    pub fn intros(&self) -> &Arc<HistoryCache> {
        &self.intros
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MemoryChain, MemoryTxPool};
    use crate::storage::MemoryStore;
    use crate::testutil::{eventually, make_node, test_config};

    #[tokio::test]
    async fn test_deterministic_identity() {
        let config = NodeConfig {
            seed: Some(42),
            ..test_config()
        };
        let node = make_node(config).await;
        assert_eq!(node.id(), PeerId::from_seed(42));
        assert_ne!(node.address().socket.port(), 0);
        node.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_bootstrap_address() {
        let config = NodeConfig {
            bootstrap_nodes: vec!["not-an-address".to_string()],
            ..test_config()
        };
        let result = Node::new(
            config,
            Arc::new(MemoryChain::new()),
            Arc::new(MemoryTxPool::new()),
            Arc::new(MemoryStore::new()),
        )
        .await;
        assert!(matches!(result, Err(NodeError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_bootstrap_connects_to_seed() {
        let seed = make_node(test_config()).await;
        let config = NodeConfig {
            bootstrap_nodes: vec![seed.address().to_string()],
            ..test_config()
        };
        let node = make_node(config).await;

        let pm = node.peer_manager().clone();
        let seed_id = seed.id();
        assert!(
            eventually(|| {
                let pm = pm.clone();
                async move { pm.is_acquainted(&seed_id).await }
            })
            .await
        );

        let seed_peer = pm.get_peer(&seed_id).await.unwrap();
        assert!(seed_peer.is_hardcoded_seed());
        assert!(node.local().is_hardcoded(&seed_id));

        node.stop().await;
        seed.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let node = make_node(test_config()).await;
        node.stop().await;
        node.stop().await;
        assert!(node.local().has_stopped());
        assert!(node.host().is_stopped());
        assert!(node.peer_manager().is_stopped());
    }
}
