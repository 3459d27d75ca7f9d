//! Transaction type carried by the gossip layer
//!
//! The network only needs a hash identity and an opaque payload; validation
//! belongs to the transaction pool.

use crate::core::hash::Hash;
use serde::{Deserialize, Serialize};

/// A value transfer between two accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Hash over every field except `hash` and `sig`
    pub hash: Hash,
    pub nonce: u64,
    pub from: String,
    pub to: String,
    pub value: u64,
    pub fee: u64,
    /// Unix timestamp (seconds)
    pub timestamp: i64,
    pub sig: Vec<u8>,
}

impl Transaction {
    /// Create a transaction and compute its hash
    pub fn new(nonce: u64, from: &str, to: &str, value: u64, fee: u64) -> Self {
        let mut tx = Transaction {
            hash: Hash::zero(),
            nonce,
            from: from.to_string(),
            to: to.to_string(),
            value,
            fee,
            timestamp: chrono::Utc::now().timestamp(),
            sig: Vec::new(),
        };
        tx.hash = tx.compute_hash();
        tx
    }

    pub fn compute_hash(&self) -> Hash {
        let mut data = Vec::with_capacity(64 + self.from.len() + self.to.len());
        data.extend_from_slice(&self.nonce.to_be_bytes());
        data.extend_from_slice(self.from.as_bytes());
        data.push(0);
        data.extend_from_slice(self.to.as_bytes());
        data.push(0);
        data.extend_from_slice(&self.value.to_be_bytes());
        data.extend_from_slice(&self.fee.to_be_bytes());
        data.extend_from_slice(&self.timestamp.to_be_bytes());
        Hash::digest(&data)
    }

    /// Whether the stored hash matches the content
    pub fn has_valid_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }
}
