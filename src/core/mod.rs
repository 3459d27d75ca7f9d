//! Chain-side collaborators of the gossip engine
//!
//! This module contains:
//! - Hashes and total difficulty
//! - Blocks and transactions as they travel the network
//! - The `Blockchain`/`ChainReader` and `TxPool` interfaces
//! - In-memory implementations used by the node binary and tests

pub mod block;
pub mod blockchain;
pub mod hash;
pub mod mempool;
pub mod transaction;

pub use block::{Block, Header, ValidationContext};
pub use blockchain::{Blockchain, BlockchainError, ChainReader, MemoryChain, MAIN_CHAIN_ID};
pub use hash::{sha256, Hash, TotalDifficulty};
pub use mempool::{MemoryTxPool, TxPool, TxPoolError, DEFAULT_MEMPOOL_SIZE};
pub use transaction::Transaction;
