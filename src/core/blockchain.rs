//! Blockchain collaborator interface and an in-memory implementation
//!
//! The gossip engine only talks to the chain through the `Blockchain` and
//! `ChainReader` traits. `MemoryChain` keeps the best chain plus any side
//! branches in memory and never reorganizes; it exists for the node binary
//! and for tests.

use crate::core::block::{Block, ValidationContext};
use crate::core::hash::Hash;
use crate::core::mempool::TxPool;
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Identifier of the best chain in `MemoryChain`
pub const MAIN_CHAIN_ID: &str = "main";

/// Number of most recent blocks included one-by-one in a locator list
const LOCATOR_DENSE_COUNT: usize = 10;

/// Blockchain errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockchainError {
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Block not found: {0}")]
    BlockNotFound(String),
    #[error("Duplicate block")]
    DuplicateBlock,
    #[error("Orphan block: parent {0} is unknown")]
    OrphanBlock(String),
    #[error("Transaction {0} is not in the pool")]
    TransactionNotInPool(String),
}

/// Read access to one chain (the best chain or a side branch)
pub trait ChainReader: Send + Sync {
    fn id(&self) -> String;
    /// Tip of this chain
    fn current_block(&self) -> Option<Block>;
    fn get_block(&self, number: u64) -> Option<Block>;
    fn get_block_by_hash(&self, hash: &Hash) -> Option<Block>;
    /// The block on the parent chain this chain branched from. The best
    /// chain's root is the genesis block.
    fn root(&self) -> Option<Block>;
}

/// The chain manager the gossip engine hands blocks to
pub trait Blockchain: Send + Sync {
    fn best_chain(&self) -> Arc<dyn ChainReader>;
    fn process_block(&self, block: Block) -> Result<Arc<dyn ChainReader>, BlockchainError>;
    /// Look up a block on the best chain
    fn get_block_by_hash(&self, hash: &Hash) -> Option<Block>;
    /// Find whichever chain contains the block
    fn get_chain_reader_by_hash(&self, hash: &Hash) -> Option<Arc<dyn ChainReader>>;
    /// Hashes describing the best chain, densest near the tip
    fn get_locators(&self) -> Result<Vec<Hash>, BlockchainError>;
    fn has_transaction(&self, hash: &Hash) -> bool;
}

// =============================================================================
// In-memory chain
// =============================================================================

#[derive(Debug, Clone)]
struct ChainData {
    id: String,
    /// Number of the best-chain block this branch grows from
    parent_number: Option<u64>,
    blocks: Vec<Block>,
}

impl ChainData {
    fn first_number(&self) -> u64 {
        self.parent_number.map(|n| n + 1).unwrap_or(0)
    }

    fn tip(&self) -> Option<&Block> {
        self.blocks.last()
    }

    fn get(&self, number: u64) -> Option<&Block> {
        let first = self.first_number();
        if number < first {
            return None;
        }
        self.blocks.get((number - first) as usize)
    }

    fn position(&self, hash: &Hash) -> Option<usize> {
        self.blocks.iter().position(|b| b.hash == *hash)
    }
}

#[derive(Debug)]
struct ChainState {
    main: ChainData,
    sides: Vec<ChainData>,
    txs: HashSet<Hash>,
}

impl ChainState {
    fn chain(&self, key: &ChainKey) -> Option<&ChainData> {
        match key {
            ChainKey::Main => Some(&self.main),
            ChainKey::Side(i) => self.sides.get(*i),
        }
    }

    fn locate(&self, hash: &Hash) -> Option<ChainKey> {
        if self.main.position(hash).is_some() {
            return Some(ChainKey::Main);
        }
        self.sides
            .iter()
            .position(|c| c.position(hash).is_some())
            .map(ChainKey::Side)
    }
}

#[derive(Debug, Clone, Copy)]
enum ChainKey {
    Main,
    Side(usize),
}

/// Chain reader over a `MemoryChain`
pub struct MemoryChainReader {
    state: Arc<RwLock<ChainState>>,
    key: ChainKey,
}

impl MemoryChainReader {
    fn with<T>(&self, f: impl FnOnce(&ChainState, &ChainData) -> Option<T>) -> Option<T> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let chain = state.chain(&self.key)?;
        f(&state, chain)
    }
}

impl ChainReader for MemoryChainReader {
    fn id(&self) -> String {
        self.with(|_, c| Some(c.id.clone())).unwrap_or_default()
    }

    fn current_block(&self) -> Option<Block> {
        self.with(|_, c| c.tip().cloned())
    }

    fn get_block(&self, number: u64) -> Option<Block> {
        self.with(|_, c| c.get(number).cloned())
    }

    fn get_block_by_hash(&self, hash: &Hash) -> Option<Block> {
        self.with(|_, c| c.position(hash).map(|i| c.blocks[i].clone()))
    }

    fn root(&self) -> Option<Block> {
        self.with(|state, c| match c.parent_number {
            Some(n) => state.main.get(n).cloned(),
            None => state.main.blocks.first().cloned(),
        })
    }
}

/// In-memory `Blockchain` with side-branch tracking and no reorganization
pub struct MemoryChain {
    state: Arc<RwLock<ChainState>>,
    /// When set, blocks outside a sync context must only carry pooled
    /// transactions
    tx_pool: Option<Arc<dyn TxPool>>,
}

impl MemoryChain {
    /// Create a chain holding only the genesis block
    pub fn new() -> Self {
        let genesis = Block::genesis();
        Self {
            state: Arc::new(RwLock::new(ChainState {
                main: ChainData {
                    id: MAIN_CHAIN_ID.to_string(),
                    parent_number: None,
                    blocks: vec![genesis],
                },
                sides: Vec::new(),
                txs: HashSet::new(),
            })),
            tx_pool: None,
        }
    }

    /// Create a chain that checks non-sync blocks against a pool
    pub fn with_pool(tx_pool: Arc<dyn TxPool>) -> Self {
        let mut chain = Self::new();
        chain.tx_pool = Some(tx_pool);
        chain
    }

    /// Current best-chain height
    pub fn height(&self) -> u64 {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.main.tip().map(|b| b.number()).unwrap_or(0)
    }

    /// Number of side branches
    pub fn side_chain_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.sides.len()
    }

    /// Extend the best chain with a new block built on its tip
    pub fn mine(&self, difficulty: u64) -> Result<Block, BlockchainError> {
        let tip = self
            .best_chain()
            .current_block()
            .ok_or_else(|| BlockchainError::BlockNotFound("tip".to_string()))?;
        let mut block = Block::child_of(&tip, difficulty, Vec::new());
        block.validation_contexts.push(ValidationContext::BlockSync);
        self.process_block(block.clone())?;
        Ok(block)
    }

    fn reader(&self, key: ChainKey) -> Arc<dyn ChainReader> {
        Arc::new(MemoryChainReader {
            state: self.state.clone(),
            key,
        })
    }

    fn check_pooled(&self, block: &Block) -> Result<(), BlockchainError> {
        if block.has_context(ValidationContext::BlockSync) {
            return Ok(());
        }
        if let Some(pool) = &self.tx_pool {
            for tx in &block.transactions {
                if !pool.has_by_hash(&tx.hash) {
                    return Err(BlockchainError::TransactionNotInPool(tx.hash.to_hex()));
                }
            }
        }
        Ok(())
    }
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl Blockchain for MemoryChain {
    fn best_chain(&self) -> Arc<dyn ChainReader> {
        self.reader(ChainKey::Main)
    }

    fn process_block(&self, block: Block) -> Result<Arc<dyn ChainReader>, BlockchainError> {
        if block.hash != block.compute_hash() {
            return Err(BlockchainError::InvalidBlock("hash mismatch".to_string()));
        }
        self.check_pooled(&block)?;

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.locate(&block.hash).is_some() {
            return Err(BlockchainError::DuplicateBlock);
        }

        let parent_hash = block.header.parent_hash;
        let key = match state.locate(&parent_hash) {
            None => return Err(BlockchainError::OrphanBlock(parent_hash.to_hex())),
            Some(key) => key,
        };

        let chain = state
            .chain(&key)
            .ok_or_else(|| BlockchainError::BlockNotFound(parent_hash.to_hex()))?;
        let parent_pos = chain.position(&parent_hash).unwrap_or(0);
        let parent_number = chain.blocks[parent_pos].number();
        let parent_is_tip = parent_pos + 1 == chain.blocks.len();

        if block.number() != parent_number + 1 {
            return Err(BlockchainError::InvalidBlock(format!(
                "expected number {}, got {}",
                parent_number + 1,
                block.number()
            )));
        }

        let key = match (key, parent_is_tip) {
            (ChainKey::Main, true) => {
                for tx in &block.transactions {
                    state.txs.insert(tx.hash);
                }
                state.main.blocks.push(block);
                ChainKey::Main
            }
            (ChainKey::Main, false) => {
                state.sides.push(ChainData {
                    id: block.hash.to_hex(),
                    parent_number: Some(parent_number),
                    blocks: vec![block],
                });
                ChainKey::Side(state.sides.len() - 1)
            }
            (ChainKey::Side(i), true) => {
                state.sides[i].blocks.push(block);
                ChainKey::Side(i)
            }
            (ChainKey::Side(_), false) => {
                return Err(BlockchainError::InvalidBlock(
                    "branching from a side chain is not supported".to_string(),
                ));
            }
        };

        drop(state);
        Ok(self.reader(key))
    }

    fn get_block_by_hash(&self, hash: &Hash) -> Option<Block> {
        self.best_chain().get_block_by_hash(hash)
    }

    fn get_chain_reader_by_hash(&self, hash: &Hash) -> Option<Arc<dyn ChainReader>> {
        let key = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            state.locate(hash)?
        };
        Some(self.reader(key))
    }

    fn get_locators(&self) -> Result<Vec<Hash>, BlockchainError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let blocks = &state.main.blocks;
        if blocks.is_empty() {
            return Err(BlockchainError::BlockNotFound("genesis".to_string()));
        }

        let mut locators = Vec::new();
        let mut index = blocks.len() - 1;
        let mut step = 1;
        loop {
            locators.push(blocks[index].hash);
            if index == 0 {
                break;
            }
            if locators.len() >= LOCATOR_DENSE_COUNT {
                step *= 2;
            }
            index = index.saturating_sub(step);
        }
        Ok(locators)
    }

    fn has_transaction(&self, hash: &Hash) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.txs.contains(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mempool::MemoryTxPool;
    use crate::core::transaction::Transaction;

    fn sync_block(parent: &Block, difficulty: u64) -> Block {
        let mut block = Block::child_of(parent, difficulty, vec![]);
        block.validation_contexts.push(ValidationContext::BlockSync);
        block
    }

    #[test]
    fn test_new_chain_has_genesis() {
        let chain = MemoryChain::new();
        let tip = chain.best_chain().current_block().unwrap();
        assert_eq!(tip.hash, Block::genesis().hash);
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.best_chain().id(), MAIN_CHAIN_ID);
    }

    #[test]
    fn test_extend_main_chain() {
        let chain = MemoryChain::new();
        let b1 = chain.mine(2).unwrap();
        let b2 = chain.mine(2).unwrap();

        assert_eq!(chain.height(), 2);
        assert_eq!(chain.best_chain().get_block(1).unwrap().hash, b1.hash);
        assert_eq!(chain.get_block_by_hash(&b2.hash).unwrap().number(), 2);
        assert_eq!(chain.process_block(b2).err(), Some(BlockchainError::DuplicateBlock));
    }

    #[test]
    fn test_orphan_block() {
        let chain = MemoryChain::new();
        let other = MemoryChain::new();
        let b1 = other.mine(1).unwrap();
        let b2 = sync_block(&b1, 1);

        assert!(matches!(
            chain.process_block(b2),
            Err(BlockchainError::OrphanBlock(_))
        ));
    }

    #[test]
    fn test_side_chain_root() {
        let chain = MemoryChain::new();
        let b1 = chain.mine(1).unwrap();
        chain.mine(1).unwrap();

        let fork = sync_block(&b1, 5);
        let reader = chain.process_block(fork.clone()).unwrap();
        assert_ne!(reader.id(), MAIN_CHAIN_ID);
        assert_eq!(reader.root().unwrap().hash, b1.hash);
        assert_eq!(chain.side_chain_count(), 1);

        let found = chain.get_chain_reader_by_hash(&fork.hash).unwrap();
        assert_eq!(found.id(), reader.id());
        assert!(chain.get_block_by_hash(&fork.hash).is_none());

        let next = sync_block(&fork, 1);
        let reader = chain.process_block(next.clone()).unwrap();
        assert_eq!(reader.current_block().unwrap().hash, next.hash);
        assert_eq!(reader.get_block(3).unwrap().hash, next.hash);
    }

    #[test]
    fn test_locators() {
        let chain = MemoryChain::new();
        for _ in 0..30 {
            chain.mine(1).unwrap();
        }
        let locators = chain.get_locators().unwrap();
        let tip = chain.best_chain().current_block().unwrap();

        assert_eq!(locators[0], tip.hash);
        assert_eq!(*locators.last().unwrap(), Block::genesis().hash);
        assert!(locators.len() < 31);
    }

    #[test]
    fn test_block_transactions_must_be_pooled_outside_sync() {
        let pool = Arc::new(MemoryTxPool::new());
        let chain = MemoryChain::with_pool(pool.clone());
        let genesis = chain.best_chain().current_block().unwrap();
        let tx = Transaction::new(1, "alice", "bob", 1, 1);

        let block = Block::child_of(&genesis, 1, vec![tx.clone()]);
        assert!(matches!(
            chain.process_block(block.clone()),
            Err(BlockchainError::TransactionNotInPool(_))
        ));

        let mut synced = block;
        synced.validation_contexts.push(ValidationContext::BlockSync);
        chain.process_block(synced).unwrap();
        assert!(chain.has_transaction(&tx.hash));
    }
}
