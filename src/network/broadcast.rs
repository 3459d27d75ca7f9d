//! Broadcaster cache
//!
//! Relays go to a small random subset of peers. The subset is kept and
//! reused until the candidate pool becomes smaller than the requested size or
//! the set grows stale. Each fan-out size keeps its own set.

use crate::network::addr::PeerId;
use crate::network::peer::{Engine, RemotePeer};
use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

struct Slot {
    peers: HashMap<PeerId, RemotePeer>,
    updated_at: DateTime<Utc>,
}

/// Cached broadcaster sets behind their own lock, one per fan-out size
pub struct BroadcastPeers {
    slots: Mutex<HashMap<usize, Slot>>,
}

impl BroadcastPeers {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Pick up to `n` broadcasters from `candidates`
    pub fn pick(&self, candidates: Vec<RemotePeer>, n: usize, ttl: Duration) -> Vec<RemotePeer> {
        let now = Utc::now();
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(slot) = slots.get(&n) {
            let fresh = now - slot.updated_at < ttl;
            if n > 0 && slot.peers.len() == n && candidates.len() >= n && fresh {
                return slot.peers.values().cloned().collect();
            }
        }

        let mut unique: HashMap<PeerId, RemotePeer> = HashMap::new();
        for peer in candidates {
            unique.entry(peer.id()).or_insert(peer);
        }
        let mut picked: Vec<RemotePeer> = unique.into_values().collect();
        picked.shuffle(&mut rand::thread_rng());
        picked.truncate(n);

        slots.insert(
            n,
            Slot {
                peers: picked.iter().map(|p| (p.id(), p.clone())).collect(),
                updated_at: now,
            },
        );
        picked
    }
}

impl Default for BroadcastPeers {
    fn default() -> Self {
        Self::new()
    }
}
