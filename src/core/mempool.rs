//! Transaction pool for pending transactions
//!
//! The gossip layer only asks two things of a pool: whether it already holds
//! a hash, and to add a transaction.

use crate::core::hash::Hash;
use crate::core::transaction::Transaction;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

/// Default maximum pool transaction count
pub const DEFAULT_MEMPOOL_SIZE: usize = 10_000;

/// Pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxPoolError {
    #[error("Transaction already exists")]
    DuplicateTransaction,
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Mempool full")]
    MempoolFull,
}

/// Transaction pool collaborator
pub trait TxPool: Send + Sync {
    fn has_by_hash(&self, hash: &Hash) -> bool;
    fn add(&self, tx: Transaction) -> Result<(), TxPoolError>;
}

/// Bounded in-memory pool
pub struct MemoryTxPool {
    entries: RwLock<HashMap<Hash, Transaction>>,
    max_size: usize,
}

impl MemoryTxPool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMPOOL_SIZE)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_size,
        }
    }

    pub fn get(&self, hash: &Hash) -> Option<Transaction> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryTxPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TxPool for MemoryTxPool {
    fn has_by_hash(&self, hash: &Hash) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.contains_key(hash)
    }

    fn add(&self, tx: Transaction) -> Result<(), TxPoolError> {
        if !tx.has_valid_hash() {
            return Err(TxPoolError::InvalidTransaction("hash mismatch".to_string()));
        }
        if tx.from.is_empty() || tx.to.is_empty() {
            return Err(TxPoolError::InvalidTransaction(
                "sender and recipient are required".to_string(),
            ));
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&tx.hash) {
            return Err(TxPoolError::DuplicateTransaction);
        }
        if entries.len() >= self.max_size {
            return Err(TxPoolError::MempoolFull);
        }
        entries.insert(tx.hash, tx);
        Ok(())
    }
}
