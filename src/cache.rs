//! Bounded cache of expiring keys
//!
//! Used as the gossip history ("have I already sent X to Y") and as the
//! recent-intro cache. Keys are built from several parts; expired entries are
//! dropped lazily and the oldest insertion is evicted once the capacity is
//! reached.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Separator placed between key parts
const PART_SEPARATOR: char = '\u{1f}';

struct Entry {
    expires_at: Instant,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    order: VecDeque<(u64, String)>,
    next_seq: u64,
}

impl Inner {
    fn remove_expired(&mut self, now: Instant) {
        self.entries.retain(|_, e| e.expires_at > now);
        self.compact();
    }

    /// Drop order slots left behind by refreshed or removed keys
    fn compact(&mut self) {
        let entries = &self.entries;
        self.order
            .retain(|(seq, key)| entries.get(key).map(|e| e.seq == *seq).unwrap_or(false));
    }

    fn evict_oldest(&mut self) {
        while let Some((seq, key)) = self.order.pop_front() {
            let current = self.entries.get(&key).map(|e| e.seq == seq).unwrap_or(false);
            if current {
                self.entries.remove(&key);
                return;
            }
        }
    }
}

/// Expiring key set with a capacity bound
pub struct HistoryCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

pub fn make_key(parts: &[&str]) -> String {
    parts.join(&PART_SEPARATOR.to_string())
}

impl HistoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Record a key made of `parts` for `ttl`
    pub fn add_multi(&self, ttl: Duration, parts: &[&str]) {
        let key = make_key(parts);
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if !inner.entries.contains_key(&key) {
            if inner.entries.len() >= self.capacity {
                inner.remove_expired(now);
            }
            if inner.entries.len() >= self.capacity {
                inner.evict_oldest();
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key.clone(),
            Entry {
                expires_at: now + ttl,
                seq,
            },
        );
        inner.order.push_back((seq, key));
        if inner.order.len() > self.capacity * 2 {
            inner.compact();
        }
    }

    /// Whether a live key made of `parts` exists
    pub fn has_multi(&self, parts: &[&str]) -> bool {
        let key = make_key(parts);
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.entries.get(&key) {
            Some(entry) if entry.expires_at > now => true,
            Some(_) => {
                inner.entries.remove(&key);
                false
            }
            None => false,
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.remove_expired(Instant::now());
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_add_and_has() {
        let cache = HistoryCache::new(10);
        cache.add_multi(Duration::from_secs(60), &["addr", "peer1"]);

        assert!(cache.has_multi(&["addr", "peer1"]));
        assert!(!cache.has_multi(&["addr", "peer2"]));
        assert!(!cache.has_multi(&["addrpeer1"]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expiry() {
        let cache = HistoryCache::new(10);
        cache.add_multi(Duration::from_millis(20), &["k"]);
        assert!(cache.has_multi(&["k"]));

        sleep(Duration::from_millis(40));
        assert!(!cache.has_multi(&["k"]));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = HistoryCache::new(2);
        cache.add_multi(Duration::from_secs(60), &["a"]);
        cache.add_multi(Duration::from_secs(60), &["b"]);
        cache.add_multi(Duration::from_secs(60), &["c"]);

        assert!(!cache.has_multi(&["a"]));
        assert!(cache.has_multi(&["b"]));
        assert!(cache.has_multi(&["c"]));
    }

    #[test]
    fn test_refresh_moves_key_to_back() {
        let cache = HistoryCache::new(2);
        cache.add_multi(Duration::from_secs(60), &["a"]);
        cache.add_multi(Duration::from_secs(60), &["b"]);
        cache.add_multi(Duration::from_secs(60), &["a"]);
        cache.add_multi(Duration::from_secs(60), &["c"]);

        assert!(cache.has_multi(&["a"]));
        assert!(!cache.has_multi(&["b"]));
    }

    #[test]
    fn test_refreshing_a_key_keeps_order_bounded() {
        let cache = HistoryCache::new(100);
        for _ in 0..10_000 {
            cache.add_multi(Duration::from_secs(3600), &["addr", "peer"]);
        }

        let inner = cache.inner.lock().unwrap();
        assert_eq!(inner.entries.len(), 1);
        assert!(inner.order.len() <= 200);
        drop(inner);
        assert!(cache.has_multi(&["addr", "peer"]));
    }
}
