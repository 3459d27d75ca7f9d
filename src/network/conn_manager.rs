//! Connection governance
//!
//! `ConnectionManager` observes transport notifications to keep inbound and
//! outbound connection counts, evicts connections above the configured caps,
//! and periodically reaches out to lonely peers while more peers are needed.

use crate::network::host::{ConnInfo, Direction, Notifiee, StreamInfo};
use crate::network::peer::{Engine, LocalNode};
use crate::network::peer_manager::PeerManager;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

/// Inbound and outbound connection counters
#[derive(Debug, Default)]
pub struct ConnsInfo {
    counts: Mutex<(usize, usize)>,
}

impl ConnsInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inbound(&self) -> usize {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner).0
    }

    pub fn outbound(&self) -> usize {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner).1
    }

    /// Count a new connection; returns the updated count for its direction
    pub fn increment(&self, direction: Direction) -> usize {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = match direction {
            Direction::Inbound => &mut counts.0,
            Direction::Outbound => &mut counts.1,
        };
        *count += 1;
        *count
    }

    pub fn decrement(&self, direction: Direction) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = match direction {
            Direction::Inbound => &mut counts.0,
            Direction::Outbound => &mut counts.1,
        };
        *count = count.saturating_sub(1);
    }
}

pub struct ConnectionManager {
    pm: Weak<PeerManager>,
    conns: Arc<ConnsInfo>,
    local: Arc<LocalNode>,
}

impl ConnectionManager {
    pub fn new(pm: Weak<PeerManager>, conns: Arc<ConnsInfo>, local: Arc<LocalNode>) -> Self {
        Self { pm, conns, local }
    }

    pub fn conns_info(&self) -> &Arc<ConnsInfo> {
        &self.conns
    }

    fn max_for(&self, direction: Direction) -> usize {
        let config = self.local.config();
        match direction {
            Direction::Inbound => config.max_inbound_connections,
            Direction::Outbound => config.max_outbound_connections,
        }
    }

    /// Start the periodic connection sweep
    pub fn manage(self: &Arc<Self>, done: CancellationToken) {
        let manager = self.clone();
        let period = self.local.config().conn_est_interval();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.establish_connections().await;
                    }
                }
            }
            log::debug!("Connection manager stopped");
        });
    }

    /// Reach out to lonely peers while more peers are needed. Returns the
    /// number of peers contacted.
    pub async fn establish_connections(&self) -> usize {
        let Some(pm) = self.pm.upgrade() else {
            return 0;
        };
        if !pm.require_peers().await {
            return 0;
        }

        let peers = pm.get_lonely_peers().await;
        if peers.is_empty() {
            return 0;
        }
        log::debug!("Establishing connection with more peers ({} lonely)", peers.len());

        let mut contacted = 0;
        for peer in peers {
            if pm.is_banned(&peer).await {
                continue;
            }
            contacted += 1;
            if let Err(e) = pm.connect_to_node(&peer).await {
                log::debug!("Failed to connect to {}: {}", peer.short_id(), e);
            }
        }
        contacted
    }
}

impl Notifiee for ConnectionManager {
    fn connected(&self, conn: &ConnInfo) {
        let count = self.conns.increment(conn.direction);
        let max = self.max_for(conn.direction);
        if count > max {
            log::debug!(
                "Closed {:?} connection to {}. Max. limit reached ({})",
                conn.direction,
                conn.remote.id.short(),
                max
            );
            conn.close();
        }

        let Some(pm) = self.pm.upgrade() else {
            return;
        };
        let remote = conn.remote;
        let inbound = conn.direction == Direction::Inbound;
        tokio::spawn(async move {
            pm.clear_conn_fail_count(&remote).await;
            pm.set_connected(&remote.id, true, inbound).await;
        });
    }

    fn disconnected(&self, conn: &ConnInfo) {
        self.conns.decrement(conn.direction);

        let Some(pm) = self.pm.upgrade() else {
            return;
        };
        let remote = conn.remote;
        tokio::spawn(async move {
            if let Err(e) = pm.has_disconnected(&remote).await {
                log::trace!("Disconnect of {}: {}", remote.id.short(), e);
            }
        });
    }

    fn opened_stream(&self, stream: &StreamInfo) -> bool {
        if self.local.has_stopped() {
            return false;
        }

        if let Some(pm) = self.pm.upgrade() {
            let remote = stream.remote;
            tokio::spawn(async move { pm.clear_conn_fail_count(&remote).await });
        }
        true
    }
}
