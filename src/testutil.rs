//! Helpers for multi-node tests over loopback TCP

use crate::config::NodeConfig;
use crate::core::{Blockchain, MemoryChain, MemoryTxPool, TxPool};
use crate::events::Event;
use crate::network::node::Node;
use crate::network::peer::RemotePeer;
use crate::storage::MemoryStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

/// How long helpers wait for something to happen
pub const WAIT: Duration = Duration::from_secs(5);

/// Ephemeral port, relaxed acceptance and routability
pub fn test_config() -> NodeConfig {
    NodeConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        test_mode: true,
        message_timeout: 5,
        ..NodeConfig::default()
    }
}

/// Ephemeral port with acceptance checks enabled
pub fn dev_config() -> NodeConfig {
    NodeConfig {
        test_mode: false,
        dev_mode: true,
        ..test_config()
    }
}

pub async fn make_node(config: NodeConfig) -> Node {
    make_node_with(config, Arc::new(MemoryChain::new()), Arc::new(MemoryTxPool::new())).await
}

pub async fn make_node_with(
    config: NodeConfig,
    blockchain: Arc<dyn Blockchain>,
    tx_pool: Arc<dyn TxPool>,
) -> Node {
    let node = Node::new(config, blockchain, tx_pool, Arc::new(MemoryStore::new()))
        .await
        .unwrap();
    node.start().await;
    node
}

/// Handshake `from` → `to`; returns `to` as seen by `from`
pub async fn connect(from: &Node, to: &Node) -> RemotePeer {
    let rp = from.gossip().remote_peer(to.address());
    from.gossip().send_handshake(&rp).await.unwrap();
    from.gossip().remote_peer(to.address())
}

/// Wait for the first event matching `pred`
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<Event>, mut pred: F) -> Option<Event>
where
    F: FnMut(&Event) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Err(_) => return None,
            Ok(Ok(event)) if pred(&event) => return Some(event),
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) => return None,
        }
    }
}

/// Poll `check` until it holds or the wait runs out
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
