//! Block implementation
//!
//! A block contains a header with chain metadata and a list of transactions.
//! The broadcaster and validation contexts are local annotations and never
//! leave the node.

use crate::core::hash::{Hash, TotalDifficulty};
use crate::core::transaction::Transaction;
use crate::network::addr::PeerId;
use serde::{Deserialize, Serialize};

/// Hints passed to the chain when a block arrives through a particular path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationContext {
    /// The block is part of a catch-up sync, so its transactions need not
    /// already be in the local pool
    BlockSync,
}

/// Block header containing metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub number: u64,
    pub parent_hash: Hash,
    /// Unix timestamp (seconds)
    pub timestamp: i64,
    pub difficulty: u64,
    pub total_difficulty: TotalDifficulty,
    /// Id of the node that produced the block
    pub creator: String,
    pub extra: Vec<u8>,
}

/// A block in the chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
    pub hash: Hash,
    pub sig: Vec<u8>,
    /// Peer that relayed this block to us
    #[serde(skip)]
    pub broadcaster: Option<PeerId>,
    #[serde(skip)]
    pub validation_contexts: Vec<ValidationContext>,
}

impl Block {
    /// Create a block and compute its hash
    pub fn new(header: Header, transactions: Vec<Transaction>) -> Self {
        let mut block = Block {
            header,
            transactions,
            hash: Hash::zero(),
            sig: Vec::new(),
            broadcaster: None,
            validation_contexts: Vec::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// The deterministic first block every node starts from
    pub fn genesis() -> Self {
        Block::new(
            Header {
                number: 0,
                parent_hash: Hash::zero(),
                timestamp: 1_500_000_000,
                difficulty: 1,
                total_difficulty: TotalDifficulty::new(1),
                creator: "genesis".to_string(),
                extra: Vec::new(),
            },
            Vec::new(),
        )
    }

    /// Build a child of `parent` with the given difficulty and transactions
    pub fn child_of(parent: &Block, difficulty: u64, transactions: Vec<Transaction>) -> Self {
        Block::new(
            Header {
                number: parent.header.number + 1,
                parent_hash: parent.hash,
                timestamp: chrono::Utc::now().timestamp(),
                difficulty,
                total_difficulty: parent.header.total_difficulty.add(difficulty),
                creator: String::new(),
                extra: Vec::new(),
            },
            transactions,
        )
    }

    pub fn compute_hash(&self) -> Hash {
        let h = &self.header;
        let mut data = Vec::with_capacity(128 + 32 * self.transactions.len());
        data.extend_from_slice(&h.number.to_be_bytes());
        data.extend_from_slice(h.parent_hash.as_bytes());
        data.extend_from_slice(&h.timestamp.to_be_bytes());
        data.extend_from_slice(&h.difficulty.to_be_bytes());
        data.extend_from_slice(h.total_difficulty.to_string().as_bytes());
        data.push(0);
        data.extend_from_slice(h.creator.as_bytes());
        data.push(0);
        data.extend_from_slice(&h.extra);
        for tx in &self.transactions {
            data.extend_from_slice(tx.hash.as_bytes());
        }
        Hash::digest(&data)
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn total_difficulty(&self) -> TotalDifficulty {
        self.header.total_difficulty
    }

    pub fn has_context(&self, ctx: ValidationContext) -> bool {
        self.validation_contexts.contains(&ctx)
    }
}
