//! Gossip protocol engine
//!
//! Every logical exchange opens its own stream and runs request/response to
//! completion inside one task. Message families live in submodules:
//! - `handshake`: acquaintance and chain-summary exchange
//! - `addr` / `getaddr`: address discovery, relay and self-advertisement
//! - `ping`: liveness and sync trigger
//! - `intro`: peer introduction flooding
//! - `block`: block relay, fetch-by-hash, hash and body sync requests
//! - `tx`: two-phase transaction relay
//!
//! Intro and address re-floods are queued and drained by a single relay
//! worker so shutdown and back-pressure stay deterministic.

mod addr;
mod block;
mod getaddr;
mod handshake;
mod intro;
mod ping;
mod tx;

use crate::cache::HistoryCache;
use crate::core::{Block, Blockchain, TxPool};
use crate::events::{Event, EventBus, PeerChainInfo};
use crate::network::addr::NodeAddr;
use crate::network::broadcast::BroadcastPeers;
use crate::network::host::{Host, HostError, Stream};
use crate::network::message::{Address, Intro, Protocol};
use crate::network::peer::{Engine, LocalNode, RemotePeer};
use crate::network::peer_manager::PeerManager;
use crate::storage::StorageError;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Constants
// =============================================================================

/// Most hashes returned for one GetBlockHashes request
pub const MAX_GET_BLOCK_HASHES: u64 = 500;

/// Most addresses accepted by one relay call
pub const MAX_ADDRS_RELAY: usize = 10;

/// Broadcasters picked for an address relay
pub const RELAY_BROADCASTERS: usize = 3;

/// Broadcasters picked for an intro flood
pub const INTRO_BROADCASTERS: usize = 2;

/// Broadcasters picked for a transaction relay
pub const TX_BROADCASTERS: usize = 2;

/// Most addresses returned for a GetAddr request
pub const GETADDR_RESPONSE_LIMIT: usize = 2500;

/// Oldest address timestamp accepted for relay (seconds)
pub const MAX_RELAY_ADDR_AGE: i64 = 60 * 60;

pub const ADDR_HISTORY_TTL: Duration = Duration::from_secs(60 * 60);
pub const INTRO_HISTORY_TTL: Duration = Duration::from_secs(60 * 60);
pub const BLOCK_HISTORY_TTL: Duration = Duration::from_secs(10 * 60);
pub const ORPHAN_HISTORY_TTL: Duration = Duration::from_secs(10 * 60);
pub const TX_HISTORY_TTL: Duration = Duration::from_secs(10 * 60);

/// Consecutive connect failures before a peer is banned
pub const MAX_CONN_FAILURES: u32 = 3;

/// Ban applied after too many connect failures (minutes)
pub const CONN_FAILURE_BAN_MINUTES: i64 = 15;

/// Pending re-flood jobs
pub const RELAY_QUEUE_CAPACITY: usize = 256;

/// Gossip errors, each scoped to one peer interaction
#[derive(Error, Debug)]
pub enum GossipError {
    #[error("{0}")]
    Connect(String),
    #[error("{0}")]
    ProtocolIo(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Acceptance(String),
    #[error("{0}")]
    Blockchain(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("node has stopped")]
    Stopped,
}

/// Work for the relay worker
#[derive(Debug)]
pub enum RelayJob {
    Addresses(Vec<Address>),
    Intro(Intro),
}

pub struct GossipManager {
    local: Arc<LocalNode>,
    host: Arc<Host>,
    pm: Arc<PeerManager>,
    blockchain: Arc<dyn Blockchain>,
    tx_pool: Arc<dyn TxPool>,
    history: Arc<HistoryCache>,
    intros: Arc<HistoryCache>,
    events: EventBus,
    broadcasters: BroadcastPeers,
    relay_tx: mpsc::Sender<RelayJob>,
    relay_rx: Mutex<Option<mpsc::Receiver<RelayJob>>>,
    done: CancellationToken,
}

impl GossipManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: Arc<LocalNode>,
        host: Arc<Host>,
        pm: Arc<PeerManager>,
        blockchain: Arc<dyn Blockchain>,
        tx_pool: Arc<dyn TxPool>,
        history: Arc<HistoryCache>,
        intros: Arc<HistoryCache>,
        events: EventBus,
    ) -> Arc<Self> {
        let (relay_tx, relay_rx) = mpsc::channel(RELAY_QUEUE_CAPACITY);
        Arc::new(Self {
            local,
            host,
            pm,
            blockchain,
            tx_pool,
            history,
            intros,
            events,
            broadcasters: BroadcastPeers::new(),
            relay_tx,
            relay_rx: Mutex::new(Some(relay_rx)),
            done: CancellationToken::new(),
        })
    }

    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.pm
    }

    // ===== Lifecycle =====

    /// Start the relay worker
    pub fn start(self: &Arc<Self>) {
        let rx = self
            .relay_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut rx) = rx else {
            return;
        };

        let gossip = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = gossip.done.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => gossip.run_relay_job(job).await,
                        None => break,
                    }
                }
            }
            log::debug!("Relay worker stopped");
        });
    }

    pub fn stop(&self) {
        self.done.cancel();
    }

    fn queue_relay(&self, job: RelayJob) {
        match self.relay_tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                log::warn!("Relay queue full, dropping {:?}", job);
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Relay queue closed");
            }
        }
    }

    async fn run_relay_job(&self, job: RelayJob) {
        match job {
            RelayJob::Addresses(addrs) => {
                for err in self.relay_addresses(&addrs).await {
                    log::debug!("[RelayAddresses] {}", err);
                }
            }
            RelayJob::Intro(intro) => {
                self.send_intro(Some(intro)).await;
            }
        }
    }

    // ===== Handler wiring =====

    /// Register a stream handler for every protocol
    pub fn register_handlers(self: &Arc<Self>) {
        self.set_handler(Protocol::Handshake, |g, s, rp| async move {
            g.on_handshake(s, &rp).await
        });
        self.set_handler(Protocol::Ping, |g, s, rp| async move { g.on_ping(s, &rp).await });
        self.set_handler(Protocol::GetAddr, |g, s, rp| async move {
            g.on_get_addr(s, &rp).await
        });
        self.set_handler(Protocol::Addr, |g, s, rp| async move { g.on_addr(s, &rp).await });
        self.set_handler(Protocol::Intro, |g, s, rp| async move { g.on_intro(s, &rp).await });
        self.set_handler(Protocol::Tx, |g, s, rp| async move { g.on_tx(s, &rp).await });
        self.set_handler(Protocol::BlockBody, |g, s, rp| async move {
            g.on_block_body(s, &rp).await
        });
        self.set_handler(Protocol::RequestBlock, |g, s, rp| async move {
            g.on_request_block(s, &rp).await
        });
        self.set_handler(Protocol::GetBlockHashes, |g, s, rp| async move {
            g.on_get_block_hashes(s, &rp).await
        });
        self.set_handler(Protocol::GetBlockBodies, |g, s, rp| async move {
            g.on_get_block_bodies(s, &rp).await
        });
    }

    fn set_handler<F, Fut>(self: &Arc<Self>, protocol: Protocol, f: F)
    where
        F: Fn(Arc<Self>, Stream, RemotePeer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GossipError>> + Send + 'static,
    {
        let gossip = Arc::downgrade(self);
        let f = Arc::new(f);
        self.host.set_handler(
            protocol,
            Arc::new(move |stream: Stream| -> BoxFuture<'static, ()> {
                let gossip = gossip.clone();
                let f = f.clone();
                async move {
                    let Some(g) = gossip.upgrade() else {
                        return;
                    };
                    let Some((stream, rp)) = g.accept_stream(stream).await else {
                        return;
                    };
                    if let Err(err) = f(g.clone(), stream, rp.clone()).await {
                        log::debug!("[{}] {} (peer {})", protocol.name(), err, rp.short_id());
                    }
                }
                .boxed()
            }),
        );
    }

    /// Gate every incoming stream: stopped node, acceptance rules, registry
    /// refresh
    async fn accept_stream(&self, stream: Stream) -> Option<(Stream, RemotePeer)> {
        if self.local.has_stopped() {
            stream.close().await;
            return None;
        }

        let rp = self.remote_peer(*stream.remote());
        let protocol = stream.protocol();
        if protocol != Protocol::Handshake {
            let skip_acquaintance =
                protocol == Protocol::Addr && !self.pm.peer_exist(&rp.id()).await;
            if let Err(err) = self.pm.can_accept_node(&rp, skip_acquaintance).await {
                log::debug!(
                    "[{}] Rejected stream from {}: {}",
                    protocol.name(),
                    rp.short_id(),
                    err
                );
                stream.reset().await;
                return None;
            }
        }

        self.pm.add_or_update_node(rp.clone()).await;
        Some((stream, rp))
    }

    // ===== Helpers =====

    /// Registry-independent view of a remote address
    pub(crate) fn remote_peer(&self, address: NodeAddr) -> RemotePeer {
        let mut peer = self.local.new_remote_node(address);
        peer.connected = self.host.is_connected(&address.id);
        peer
    }

    /// Open a stream, counting dial failures against the peer
    async fn open_stream(
        &self,
        rp: &RemotePeer,
        protocol: Protocol,
        op: &str,
    ) -> Result<Stream, GossipError> {
        match self.host.new_stream(&rp.address, protocol).await {
            Ok(stream) => Ok(stream),
            Err(HostError::Stopped) => Err(GossipError::Stopped),
            Err(err) if err.is_connect_error() => Err(self
                .log_connect_err(err, rp, &format!("[{}] Failed to connect to peer", op))
                .await),
            Err(err) => Err(log_err(err, rp, &format!("[{}] Failed to open stream", op))),
        }
    }

    /// Count a connect failure; ban the peer once failures pile up
    async fn log_connect_err(&self, err: HostError, rp: &RemotePeer, msg: &str) -> GossipError {
        self.pm.incr_conn_fail_count(&rp.address).await;
        let failures = self.pm.get_conn_fail_count(&rp.address).await;
        if failures >= MAX_CONN_FAILURES && !rp.is_hardcoded_seed() {
            self.pm
                .add_time_ban(rp, chrono::Duration::minutes(CONN_FAILURE_BAN_MINUTES))
                .await;
        }
        log::debug!("{} (peer {}, failures {}): {}", msg, rp.short_id(), failures, err);
        GossipError::Connect(format!("{}: {}", msg, err))
    }

    fn best_block(&self) -> Result<Block, GossipError> {
        self.blockchain
            .best_chain()
            .current_block()
            .ok_or_else(|| GossipError::Blockchain("no best block".to_string()))
    }

    fn emit_chain_info(&self, rp: &RemotePeer, info: PeerChainInfo) {
        log::debug!(
            "Peer {} is at block {} (td {})",
            rp.short_id(),
            info.best_block_number,
            info.best_block_total_difficulty
        );
        self.events.emit(Event::PeerChainInfo(info));
    }
}

/// Wrap a stream failure with context
fn log_err(err: impl std::fmt::Display, rp: &RemotePeer, msg: &str) -> GossipError {
    log::debug!("{} (peer {}): {}", msg, rp.short_id(), err);
    GossipError::ProtocolIo(format!("{}: {}", msg, err))
}
