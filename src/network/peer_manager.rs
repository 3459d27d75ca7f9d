//! Peer lifecycle manager
//!
//! Owns everything the node believes about other peers:
//! - The peer registry (peer id → `RemotePeer`)
//! - Acquaintance, ban and connection-failure indexes
//! - Persistence of long-lived peers to the key-value store
//! - Peer selection queries used by the gossip engine
//! - The periodic self-advertise, cleanup, ping and getaddr loops
//!
//! The registry and the ban/acquaintance/failure indexes sit behind two
//! separate locks. When both are needed the registry lock is taken first.

use crate::network::addr::{NodeAddr, PeerId};
use crate::network::conn_manager::{ConnectionManager, ConnsInfo};
use crate::network::gossip::{GossipError, GossipManager};
use crate::network::host::Host;
use crate::network::peer::{Engine, LocalNode, PeerRecord, RemotePeer};
use crate::storage::{KvObject, KvStore, StorageError};
use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Constants
// =============================================================================

/// A peer seen within this many hours is active
pub const ACTIVE_WINDOW_HOURS: i64 = 3;

/// New peers start this many hours in the past
pub const NEW_PEER_GRACE_HOURS: i64 = 1;

/// Peers younger than this are not persisted (minutes)
pub const PERSIST_MIN_AGE_MINUTES: i64 = 20;

/// Above this many active peers no new ones are sought
pub const MAX_ACTIVE_PEERS_REQUIRED: usize = 1000;

/// Store prefix of persisted peers
pub const ADDRESS_PREFIX: &[u8] = b"address";

fn active_window() -> Duration {
    Duration::hours(ACTIVE_WINDOW_HOURS)
}

fn grace() -> Duration {
    Duration::hours(NEW_PEER_GRACE_HOURS)
}

#[derive(Default)]
struct PeerState {
    /// Ban end per peer IP
    bans: HashMap<IpAddr, DateTime<Utc>>,
    acquainted: HashSet<PeerId>,
    /// Consecutive connect failures per peer IP
    conn_fail: HashMap<IpAddr, u32>,
}

impl PeerState {
    fn ban_end(&self, peer: &impl Engine) -> Option<DateTime<Utc>> {
        self.bans.get(&peer.address().ip()).copied()
    }

    fn is_banned(&self, peer: &impl Engine, now: DateTime<Utc>) -> bool {
        self.ban_end(peer).map(|end| end > now).unwrap_or(false)
    }

    fn is_active(&self, peer: &RemotePeer, now: DateTime<Utc>) -> bool {
        !self.is_banned(peer, now) && seen_recently(peer, now)
    }
}

fn seen_recently(peer: &RemotePeer, now: DateTime<Utc>) -> bool {
    peer.seen_within(active_window(), now)
}

pub struct PeerManager {
    local: Arc<LocalNode>,
    host: Arc<Host>,
    store: Arc<dyn KvStore>,
    peers: RwLock<HashMap<PeerId, RemotePeer>>,
    state: RwLock<PeerState>,
    conn_mgr: Arc<ConnectionManager>,
    gossip: OnceLock<Weak<GossipManager>>,
    done: CancellationToken,
}

impl PeerManager {
    pub fn new(local: Arc<LocalNode>, host: Arc<Host>, store: Arc<dyn KvStore>) -> Arc<Self> {
        Arc::new_cyclic(|pm| {
            let conn_mgr = Arc::new(ConnectionManager::new(
                pm.clone(),
                Arc::new(ConnsInfo::new()),
                local.clone(),
            ));
            Self {
                local,
                host,
                store,
                peers: RwLock::new(HashMap::new()),
                state: RwLock::new(PeerState::default()),
                conn_mgr,
                gossip: OnceLock::new(),
                done: CancellationToken::new(),
            }
        })
    }

    /// Attach the gossip engine used by connection attempts and the loops
    pub fn set_gossip(&self, gossip: &Arc<GossipManager>) {
        if self.gossip.set(Arc::downgrade(gossip)).is_err() {
            log::warn!("Gossip manager already set");
        }
    }

    fn gossip(&self) -> Option<Arc<GossipManager>> {
        self.gossip.get().and_then(Weak::upgrade)
    }

    pub fn local(&self) -> &Arc<LocalNode> {
        &self.local
    }

    pub fn conn_mgr(&self) -> &Arc<ConnectionManager> {
        &self.conn_mgr
    }

    pub fn conns(&self) -> &Arc<ConnsInfo> {
        self.conn_mgr.conns_info()
    }

    // ===== Registry =====

    /// Record contact with a peer. Unknown peers start one hour in the past;
    /// known peers are refreshed when connected and decayed by an hour
    /// otherwise.
    pub async fn add_or_update_node(&self, mut node: RemotePeer) {
        if self.is_local_node(&node) {
            return;
        }

        let now = Utc::now();
        let connected = node.connected || self.host.is_connected(&node.id());
        {
            let mut peers = self.peers.write().await;
            match peers.get_mut(&node.id()) {
                None => {
                    node.last_seen = now - grace();
                    node.connected = connected;
                    node.hardcoded_seed |= self.local.is_hardcoded(&node.id());
                    peers.insert(node.id(), node);
                }
                Some(peer) => {
                    if connected {
                        peer.last_seen = now;
                    } else {
                        peer.last_seen = peer.last_seen - grace();
                    }
                    peer.connected = connected;
                    peer.address = node.address;
                }
            }
        }

        if let Err(e) = self.save_peers().await {
            log::warn!("Failed to save peers: {}", e);
        }
        self.clean_peers().await;
    }

    /// Insert or replace a peer as-is
    pub async fn add_peer(&self, peer: RemotePeer) {
        if self.is_local_node(&peer) {
            return;
        }
        self.peers.write().await.insert(peer.id(), peer);
    }

    pub async fn peer_exist(&self, id: &PeerId) -> bool {
        self.peers.read().await.contains_key(id)
    }

    pub async fn get_peer(&self, id: &PeerId) -> Option<RemotePeer> {
        self.peers.read().await.get(id).cloned()
    }

    pub fn is_local_node(&self, peer: &impl Engine) -> bool {
        self.local.is_same(peer)
    }

    /// Update connection flags of a known peer
    pub async fn set_connected(&self, id: &PeerId, connected: bool, inbound: bool) {
        if let Some(peer) = self.peers.write().await.get_mut(id) {
            peer.connected = connected;
            peer.inbound = connected && inbound;
        }
    }

    /// A connection to `addr` went away; hasten the peer's removal
    pub async fn has_disconnected(&self, addr: &NodeAddr) -> Result<(), GossipError> {
        {
            let mut peers = self.peers.write().await;
            let peer = peers
                .get_mut(&addr.id)
                .ok_or_else(|| GossipError::Validation("unknown peer".to_string()))?;
            log::debug!("Peer {} has disconnected", peer.short_id());
            peer.last_seen = peer.last_seen - grace();
            peer.connected = false;
            peer.inbound = false;
        }
        self.clean_peers().await;
        Ok(())
    }

    /// Drop peers that are neither active nor serving a short ban. Returns
    /// the number removed.
    pub async fn clean_peers(&self) -> usize {
        let now = Utc::now();
        let mut peers = self.peers.write().await;
        let mut state = self.state.write().await;

        let mut removed = Vec::new();
        peers.retain(|id, peer| {
            let peer: &RemotePeer = peer;
            let keep = if state.is_banned(peer, now) {
                state
                    .ban_end(peer)
                    .map(|end| end < now + active_window())
                    .unwrap_or(false)
            } else {
                seen_recently(peer, now)
            };
            if !keep {
                removed.push(*id);
            }
            keep
        });

        for id in &removed {
            state.acquainted.remove(id);
        }
        removed.len()
    }

    // ===== Queries =====

    /// Snapshot of every known peer with live connection state
    pub async fn get_peers(&self) -> Vec<RemotePeer> {
        self.peers
            .read()
            .await
            .values()
            .cloned()
            .map(|mut p| {
                p.connected = self.host.is_connected(&p.id());
                p
            })
            .collect()
    }

    pub async fn is_active(&self, peer: &RemotePeer) -> bool {
        self.state.read().await.is_active(peer, Utc::now())
    }

    /// Active peers; a zero limit returns all of them
    pub async fn get_active_peers(&self, limit: usize) -> Vec<RemotePeer> {
        let now = Utc::now();
        let peers = self.peers.read().await;
        let state = self.state.read().await;

        let active = peers.values().filter(|p| state.is_active(p, now)).cloned();
        if limit > 0 {
            active.take(limit).collect()
        } else {
            active.collect()
        }
    }

    /// Active peers keyed by id
    pub async fn copy_active_peers(&self, limit: usize) -> HashMap<PeerId, RemotePeer> {
        self.get_active_peers(limit)
            .await
            .into_iter()
            .map(|p| (p.id(), p))
            .collect()
    }

    /// Up to `limit` active peers in random order
    pub async fn get_random_active_peers(&self, limit: usize) -> Vec<RemotePeer> {
        let mut peers = self.get_active_peers(0).await;
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(limit);
        peers
    }

    pub async fn get_connected_peers(&self) -> Vec<RemotePeer> {
        self.get_peers()
            .await
            .into_iter()
            .filter(|p| p.connected)
            .collect()
    }

    pub async fn get_unconnected_peers(&self) -> Vec<RemotePeer> {
        self.get_peers()
            .await
            .into_iter()
            .filter(|p| !p.connected)
            .collect()
    }

    /// Peers that are disconnected or connected but unacquainted
    pub async fn get_lonely_peers(&self) -> Vec<RemotePeer> {
        let peers = self.get_peers().await;
        let state = self.state.read().await;
        peers
            .into_iter()
            .filter(|p| !p.connected || !state.acquainted.contains(&p.id()))
            .collect()
    }

    /// Connected peers that completed a handshake
    pub async fn get_acquainted_peers(&self) -> Vec<RemotePeer> {
        let peers = self.get_peers().await;
        let state = self.state.read().await;
        peers
            .into_iter()
            .filter(|p| p.connected && state.acquainted.contains(&p.id()))
            .collect()
    }

    pub fn has_reached_out_conn_limit(&self) -> bool {
        self.conns().outbound() >= self.local.config().max_outbound_connections
    }

    /// Whether the node should look for more peers
    pub async fn require_peers(&self) -> bool {
        self.get_active_peers(0).await.len() < MAX_ACTIVE_PEERS_REQUIRED
            && !self.has_reached_out_conn_limit()
    }

    // ===== Acquaintance =====

    pub async fn add_acquainted(&self, peer: &impl Engine) {
        self.state.write().await.acquainted.insert(peer.id());
    }

    pub async fn remove_acquainted(&self, peer: &impl Engine) {
        self.state.write().await.acquainted.remove(&peer.id());
    }

    pub async fn is_acquainted(&self, id: &PeerId) -> bool {
        self.state.read().await.acquainted.contains(id)
    }

    /// Whether messages from `node` may be processed. Acquaintance is not
    /// required when `skip_acquaintance` is set; bans ending within the
    /// active window are tolerated.
    pub async fn can_accept_node(
        &self,
        node: &RemotePeer,
        skip_acquaintance: bool,
    ) -> Result<(), GossipError> {
        if self.local.test_mode() {
            return Ok(());
        }

        let state = self.state.read().await;
        if !skip_acquaintance && !state.acquainted.contains(&node.id()) {
            return Err(GossipError::Acceptance("unacquainted node".to_string()));
        }

        let now = Utc::now();
        if let Some(end) = state.ban_end(node) {
            if end > now && end > now + active_window() {
                return Err(GossipError::Acceptance(
                    "currently serving ban time".to_string(),
                ));
            }
        }
        Ok(())
    }

    // ===== Bans =====

    pub async fn is_banned(&self, peer: &impl Engine) -> bool {
        self.state.read().await.is_banned(peer, Utc::now())
    }

    /// Extend a peer's ban by `duration`. An expired ban restarts from now.
    /// Hardcoded seeds are never banned.
    pub async fn add_time_ban(&self, peer: &impl Engine, duration: Duration) {
        if peer.is_hardcoded_seed() || self.local.is_hardcoded(&peer.id()) {
            return;
        }

        let now = Utc::now();
        let mut state = self.state.write().await;
        let current = state.ban_end(peer).filter(|end| *end > now).unwrap_or(now);
        let end = current + duration;
        state.bans.insert(peer.address().ip(), end);
        log::debug!("Banned peer {} until {}", peer.short_id(), end);
    }

    pub async fn get_ban_time(&self, peer: &impl Engine) -> Option<DateTime<Utc>> {
        self.state.read().await.ban_end(peer)
    }

    /// Copy of the ban index
    pub async fn time_ban_index(&self) -> HashMap<IpAddr, DateTime<Utc>> {
        self.state.read().await.bans.clone()
    }

    // ===== Connection failures =====

    pub async fn incr_conn_fail_count(&self, addr: &NodeAddr) {
        *self
            .state
            .write()
            .await
            .conn_fail
            .entry(addr.ip())
            .or_insert(0) += 1;
    }

    pub async fn clear_conn_fail_count(&self, addr: &NodeAddr) {
        self.state.write().await.conn_fail.remove(&addr.ip());
    }

    pub async fn get_conn_fail_count(&self, addr: &NodeAddr) -> u32 {
        self.state
            .read()
            .await
            .conn_fail
            .get(&addr.ip())
            .copied()
            .unwrap_or(0)
    }

    // ===== Persistence =====

    /// Persist peers that are old enough, recently seen and not hardcoded
    pub async fn save_peers(&self) -> Result<usize, StorageError> {
        let now = Utc::now();
        let objs = {
            let peers = self.peers.read().await;
            let state = self.state.read().await;

            let mut objs = Vec::new();
            for peer in peers.values() {
                let old_enough =
                    now - peer.created_at >= Duration::minutes(PERSIST_MIN_AGE_MINUTES);
                if !old_enough || !seen_recently(peer, now) || peer.is_hardcoded_seed() {
                    continue;
                }

                let record = PeerRecord {
                    address: peer.address.to_string(),
                    created_at: peer.created_at,
                    last_seen: peer.last_seen,
                    ban_end: state.ban_end(peer),
                };
                let value = serde_json::to_vec(&record)?;
                objs.push(KvObject::new(
                    ADDRESS_PREFIX,
                    peer.id().to_string().as_bytes(),
                    value,
                ));
            }
            objs
        };

        let count = objs.len();
        if count > 0 {
            // The file store rewrites its whole file on every put
            let store = self.store.clone();
            tokio::task::spawn_blocking(move || store.put(objs))
                .await
                .map_err(|e| StorageError::IoError(io::Error::new(io::ErrorKind::Other, e)))??;
        }
        Ok(count)
    }

    /// Restore persisted peers. Peers already in the registry are kept.
    pub async fn load_peers(&self) -> Result<usize, StorageError> {
        let objs = self.store.get_by_prefix(ADDRESS_PREFIX)?;

        let mut peers = self.peers.write().await;
        let mut state = self.state.write().await;
        let mut loaded = 0;
        for obj in objs {
            let record: PeerRecord = match serde_json::from_slice(&obj.value) {
                Ok(record) => record,
                Err(e) => {
                    log::debug!("Skipping unreadable peer record: {}", e);
                    continue;
                }
            };
            let address: NodeAddr = match record.address.parse() {
                Ok(address) => address,
                Err(e) => {
                    log::debug!("Skipping peer record {}: {}", record.address, e);
                    continue;
                }
            };
            if address.id == self.local.id() || peers.contains_key(&address.id) {
                continue;
            }

            let mut peer = self.local.new_remote_node(address);
            peer.created_at = record.created_at;
            peer.last_seen = record.last_seen;
            if let Some(end) = record.ban_end {
                if !peer.is_hardcoded_seed() {
                    state.bans.insert(address.ip(), end);
                }
            }
            peers.insert(address.id, peer);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Forget every peer, in memory and in the store
    pub async fn forget_peers(&self) -> Result<(), StorageError> {
        let mut peers = self.peers.write().await;
        let mut state = self.state.write().await;
        peers.clear();
        state.acquainted.clear();
        self.store.delete_by_prefix(ADDRESS_PREFIX)
    }

    // ===== Connections =====

    pub async fn connect_to_peer(&self, id: &PeerId) -> Result<(), GossipError> {
        let peer = self
            .get_peer(id)
            .await
            .ok_or_else(|| GossipError::Validation("peer not found".to_string()))?;
        self.connect_to_node(&peer).await
    }

    /// Handshake with a node, then ask it for addresses
    pub async fn connect_to_node(&self, node: &RemotePeer) -> Result<(), GossipError> {
        let gossip = self.gossip().ok_or(GossipError::Stopped)?;
        log::debug!("Attempting to connect to peer {}", node.short_id());
        gossip.send_handshake(node).await?;
        gossip.send_get_addr(vec![node.clone()]).await;
        Ok(())
    }

    // ===== Lifecycle =====

    /// Load persisted peers and start the connection manager and the
    /// periodic loops
    pub async fn manage(self: &Arc<Self>) {
        match self.load_peers().await {
            Ok(n) => log::info!("Loaded {} peers from storage", n),
            Err(e) => log::error!("Failed to load peer addresses: {}", e),
        }

        self.conn_mgr.manage(self.done.clone());

        let config = self.local.config();
        self.spawn_loop("SelfAdvertise", config.self_adv_interval(), |pm| async move {
            if let Some(gossip) = pm.gossip() {
                let peers = pm.get_connected_peers().await;
                if !peers.is_empty() {
                    gossip.self_advertise(&peers).await;
                }
            }
            pm.clean_peers().await;
        });
        self.spawn_loop("CleanUp", config.clean_up_interval(), |pm| async move {
            let cleaned = pm.clean_peers().await;
            if let Err(e) = pm.save_peers().await {
                log::warn!("Failed to save peers: {}", e);
            }
            log::debug!(
                "Cleaned and saved peers (known {}, removed {})",
                pm.peers.read().await.len(),
                cleaned
            );
        });
        self.spawn_loop("Ping", config.ping_interval(), |pm| async move {
            if let Some(gossip) = pm.gossip() {
                gossip.send_ping(pm.get_active_peers(0).await).await;
            }
        });
        self.spawn_loop("GetAddr", config.get_addr_interval(), |pm| async move {
            if let Some(gossip) = pm.gossip() {
                gossip.send_get_addr(pm.get_active_peers(0).await).await;
            }
        });
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, name: &'static str, period: std::time::Duration, f: F)
    where
        F: Fn(Arc<PeerManager>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let pm = self.clone();
        let done = self.done.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = ticker.tick() => {
                        if pm.local.is_network_disabled() {
                            continue;
                        }
                        f(pm.clone()).await;
                    }
                }
            }
            log::debug!("[{}] loop stopped", name);
        });
    }

    /// Clean and save once, then stop the loops
    pub async fn stop(&self) {
        self.clean_peers().await;
        if let Err(e) = self.save_peers().await {
            log::warn!("Failed to save peers: {}", e);
        }

        if !self.done.is_cancelled() {
            self.done.cancel();
            log::info!("Peer manager has stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.done.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::storage::{FileStore, MemoryStore};
    use tempfile::tempdir;

    async fn make_pm(test_mode: bool) -> (Arc<PeerManager>, Arc<MemoryStore>) {
        let config = NodeConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            test_mode,
            ..NodeConfig::default()
        };
        let id = PeerId::random();
        let host = Host::bind(id, config.listen_addr, config.message_timeout())
            .await
            .unwrap();
        let local = Arc::new(LocalNode::new(host.local_addr(), config));
        let store = Arc::new(MemoryStore::new());
        let pm = PeerManager::new(local, host, store.clone());
        (pm, store)
    }

    fn peer(seed: u64, ip: &str) -> RemotePeer {
        let socket = format!("{}:9000", ip).parse().unwrap();
        RemotePeer::new(NodeAddr::new(PeerId::from_seed(seed), socket))
    }

    fn close_to(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        (a - b).num_seconds().abs() <= 5
    }

    #[tokio::test]
    async fn test_add_unknown_peer_starts_in_the_past() {
        let (pm, _) = make_pm(false).await;
        let p = peer(1, "10.0.0.1");
        pm.add_or_update_node(p.clone()).await;

        let stored = pm.get_peer(&p.id()).await.unwrap();
        assert!(close_to(stored.last_seen, Utc::now() - Duration::hours(1)));
        assert!(pm.is_active(&stored).await);
    }

    #[tokio::test]
    async fn test_add_connected_known_peer_refreshes() {
        let (pm, _) = make_pm(false).await;
        let mut p = peer(1, "10.0.0.1");
        pm.add_or_update_node(p.clone()).await;

        p.connected = true;
        pm.add_or_update_node(p.clone()).await;
        let stored = pm.get_peer(&p.id()).await.unwrap();
        assert!(close_to(stored.last_seen, Utc::now()));
    }

    #[tokio::test]
    async fn test_add_disconnected_known_peer_decays() {
        let (pm, _) = make_pm(false).await;
        let p = peer(1, "10.0.0.1");
        pm.add_or_update_node(p.clone()).await;
        let before = pm.get_peer(&p.id()).await.unwrap().last_seen;

        pm.add_or_update_node(p.clone()).await;
        let after = pm.get_peer(&p.id()).await.unwrap().last_seen;
        assert_eq!(before - after, Duration::hours(1));
    }

    #[tokio::test]
    async fn test_local_node_is_never_added() {
        let (pm, _) = make_pm(false).await;
        let me = pm.local().new_remote_node(pm.local().address());
        pm.add_or_update_node(me).await;
        assert!(pm.get_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_time_ban_compounds_only_while_active() {
        let (pm, _) = make_pm(false).await;
        let p = peer(1, "10.0.0.1");

        pm.add_time_ban(&p, Duration::minutes(10)).await;
        let first = pm.get_ban_time(&p).await.unwrap();
        assert!(close_to(first, Utc::now() + Duration::minutes(10)));
        assert!(pm.is_banned(&p).await);

        pm.add_time_ban(&p, Duration::minutes(5)).await;
        assert_eq!(pm.get_ban_time(&p).await.unwrap(), first + Duration::minutes(5));

        // An expired ban restarts from now
        let q = peer(2, "10.0.0.2");
        pm.add_time_ban(&q, Duration::seconds(-60)).await;
        assert!(!pm.is_banned(&q).await);
        pm.add_time_ban(&q, Duration::minutes(5)).await;
        assert!(close_to(
            pm.get_ban_time(&q).await.unwrap(),
            Utc::now() + Duration::minutes(5)
        ));
    }

    #[tokio::test]
    async fn test_hardcoded_seed_cannot_be_banned() {
        let (pm, _) = make_pm(false).await;
        let mut p = peer(1, "10.0.0.1");
        p.hardcoded_seed = true;
        pm.add_time_ban(&p, Duration::hours(1)).await;
        assert!(!pm.is_banned(&p).await);
        assert!(pm.time_ban_index().await.is_empty());
    }

    #[tokio::test]
    async fn test_can_accept_node() {
        let (pm, _) = make_pm(false).await;
        let p = peer(1, "10.0.0.1");

        let err = pm.can_accept_node(&p, false).await.unwrap_err();
        assert_eq!(err.to_string(), "unacquainted node");
        assert!(pm.can_accept_node(&p, true).await.is_ok());

        pm.add_acquainted(&p).await;
        assert!(pm.can_accept_node(&p, false).await.is_ok());

        // Short bans are tolerated
        pm.add_time_ban(&p, Duration::hours(1)).await;
        assert!(pm.can_accept_node(&p, false).await.is_ok());

        pm.add_time_ban(&p, Duration::hours(3)).await;
        let err = pm.can_accept_node(&p, false).await.unwrap_err();
        assert_eq!(err.to_string(), "currently serving ban time");
    }

    #[tokio::test]
    async fn test_test_mode_accepts_everyone() {
        let (pm, _) = make_pm(true).await;
        let p = peer(1, "10.0.0.1");
        pm.add_time_ban(&p, Duration::hours(10)).await;
        assert!(pm.can_accept_node(&p, false).await.is_ok());
    }

    #[tokio::test]
    async fn test_clean_peers() {
        let (pm, _) = make_pm(false).await;
        let now = Utc::now();

        let mut fresh = peer(1, "10.0.0.1");
        fresh.last_seen = now - Duration::hours(2);
        let mut stale = peer(2, "10.0.0.2");
        stale.last_seen = now - Duration::hours(4);
        let mut short_ban = peer(3, "10.0.0.3");
        short_ban.last_seen = now - Duration::hours(5);
        let mut long_ban = peer(4, "10.0.0.4");
        long_ban.last_seen = now;

        for p in [&fresh, &stale, &short_ban, &long_ban] {
            pm.add_peer(p.clone()).await;
            pm.add_acquainted(p).await;
        }
        pm.add_time_ban(&short_ban, Duration::hours(1)).await;
        pm.add_time_ban(&long_ban, Duration::hours(4)).await;

        assert_eq!(pm.clean_peers().await, 2);
        assert!(pm.peer_exist(&fresh.id()).await);
        assert!(pm.peer_exist(&short_ban.id()).await);
        assert!(!pm.peer_exist(&stale.id()).await);
        assert!(!pm.peer_exist(&long_ban.id()).await);
        assert!(!pm.is_acquainted(&stale.id()).await);
        assert!(pm.is_acquainted(&fresh.id()).await);
    }

    #[tokio::test]
    async fn test_active_peer_queries() {
        let (pm, _) = make_pm(false).await;
        for i in 0..5 {
            pm.add_or_update_node(peer(i, &format!("10.0.0.{}", i + 1))).await;
        }
        let banned = peer(0, "10.0.0.1");
        pm.add_time_ban(&banned, Duration::minutes(30)).await;

        assert_eq!(pm.get_active_peers(0).await.len(), 4);
        assert_eq!(pm.get_active_peers(2).await.len(), 2);
        assert_eq!(pm.get_random_active_peers(3).await.len(), 3);
        assert_eq!(pm.copy_active_peers(0).await.len(), 4);
        assert!(!pm.is_active(&pm.get_peer(&banned.id()).await.unwrap()).await);
    }

    #[tokio::test]
    async fn test_lonely_and_acquainted_peers() {
        let (pm, _) = make_pm(false).await;
        let a = peer(1, "10.0.0.1");
        let b = peer(2, "10.0.0.2");
        pm.add_or_update_node(a.clone()).await;
        pm.add_or_update_node(b.clone()).await;
        pm.add_acquainted(&a).await;

        // Nothing is connected in this test
        assert_eq!(pm.get_lonely_peers().await.len(), 2);
        assert!(pm.get_acquainted_peers().await.is_empty());
        assert_eq!(pm.get_unconnected_peers().await.len(), 2);
        assert!(pm.get_connected_peers().await.is_empty());

        pm.remove_acquainted(&a).await;
        assert!(!pm.is_acquainted(&a.id()).await);
    }

    #[tokio::test]
    async fn test_has_disconnected() {
        let (pm, _) = make_pm(false).await;
        let p = peer(1, "10.0.0.1");

        let err = pm.has_disconnected(&p.address).await.unwrap_err();
        assert_eq!(err.to_string(), "unknown peer");

        pm.add_or_update_node(p.clone()).await;
        let before = pm.get_peer(&p.id()).await.unwrap().last_seen;
        pm.has_disconnected(&p.address).await.unwrap();
        let after = pm.get_peer(&p.id()).await.unwrap().last_seen;
        assert_eq!(before - after, Duration::hours(1));
    }

    #[tokio::test]
    async fn test_conn_fail_count() {
        let (pm, _) = make_pm(false).await;
        let p = peer(1, "10.0.0.1");
        pm.incr_conn_fail_count(&p.address).await;
        pm.incr_conn_fail_count(&p.address).await;
        assert_eq!(pm.get_conn_fail_count(&p.address).await, 2);
        pm.clear_conn_fail_count(&p.address).await;
        assert_eq!(pm.get_conn_fail_count(&p.address).await, 0);
    }

    #[tokio::test]
    async fn test_require_peers() {
        let (pm, _) = make_pm(false).await;
        assert!(pm.require_peers().await);
        assert!(!pm.has_reached_out_conn_limit());
    }

    #[tokio::test]
    async fn test_save_and_load_peers() {
        let (pm, store) = make_pm(false).await;
        let now = Utc::now();

        let mut old = peer(1, "10.0.0.1");
        old.created_at = now - Duration::minutes(30);
        old.last_seen = now - Duration::minutes(5);
        let young = peer(2, "10.0.0.2");
        let mut seed = peer(3, "10.0.0.3");
        seed.created_at = now - Duration::hours(1);
        seed.hardcoded_seed = true;

        for p in [&old, &young, &seed] {
            pm.add_peer(p.clone()).await;
        }
        pm.add_time_ban(&old, Duration::minutes(10)).await;
        assert_eq!(pm.save_peers().await.unwrap(), 1);

        let (other, _) = make_pm(false).await;
        let other = PeerManager::new(other.local().clone(), other.host.clone(), store);
        // An entry already present wins over the stored one
        let mut existing = peer(1, "10.0.0.1");
        existing.last_seen = now;
        other.add_peer(existing.clone()).await;
        assert_eq!(other.load_peers().await.unwrap(), 0);
        assert_eq!(other.get_peer(&old.id()).await.unwrap().last_seen, now);

        other.forget_peers().await.unwrap();
        assert!(other.get_peers().await.is_empty());
        assert_eq!(other.load_peers().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_load_restores_records() {
        let (pm, store) = make_pm(false).await;
        let mut old = peer(1, "10.0.0.1");
        old.created_at = Utc::now() - Duration::hours(1);
        pm.add_peer(old.clone()).await;
        pm.add_time_ban(&old, Duration::minutes(10)).await;
        assert_eq!(pm.save_peers().await.unwrap(), 1);

        let (fresh, _) = make_pm(false).await;
        let fresh = PeerManager::new(fresh.local().clone(), fresh.host.clone(), store);
        assert_eq!(fresh.load_peers().await.unwrap(), 1);

        let loaded = fresh.get_peer(&old.id()).await.unwrap();
        assert_eq!(loaded.address, old.address);
        assert_eq!(loaded.created_at, old.created_at);
        assert!(fresh.is_banned(&old).await);
    }

    #[tokio::test]
    async fn test_registry_updates_persist_to_file_store() {
        let dir = tempdir().unwrap();
        let (pm, _) = make_pm(false).await;
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let pm = PeerManager::new(pm.local().clone(), pm.host.clone(), store);

        let mut old = peer(1, "10.0.0.1");
        old.created_at = Utc::now() - Duration::hours(1);
        pm.add_peer(old.clone()).await;
        old.connected = true;
        pm.add_or_update_node(old.clone()).await;

        let reopened = FileStore::open(dir.path()).unwrap();
        let objs = reopened.get_by_prefix(ADDRESS_PREFIX).unwrap();
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].key, old.id().to_string().into_bytes());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (pm, _) = make_pm(false).await;
        pm.stop().await;
        pm.stop().await;
        assert!(pm.is_stopped());
    }
}
