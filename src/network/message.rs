//! Gossip message types
//!
//! Every exchange happens on its own stream tagged with a protocol id of the
//! form `/<net-version>/<name>/1`. Message bodies are bincode encoded: field
//! order matters, integers are fixed width and hashes are raw 32 bytes.

use crate::core::{Block, Hash, Header, TotalDifficulty, Transaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Network version embedded in every protocol id
pub const NET_VERSION: &str = "0001";

/// Client version announced in handshakes
pub const CLIENT_VERSION: &str = concat!("gossip-node/", env!("CARGO_PKG_VERSION"));

/// Magic bytes for frame delimiting
pub const MAGIC: [u8; 4] = [0x47, 0x53, 0x50, 0x31]; // "GSP1"

/// Sub-protocols spoken over streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Handshake,
    Ping,
    GetAddr,
    Addr,
    Intro,
    Tx,
    BlockBody,
    RequestBlock,
    GetBlockHashes,
    GetBlockBodies,
}

impl Protocol {
    pub const ALL: [Protocol; 10] = [
        Protocol::Handshake,
        Protocol::Ping,
        Protocol::GetAddr,
        Protocol::Addr,
        Protocol::Intro,
        Protocol::Tx,
        Protocol::BlockBody,
        Protocol::RequestBlock,
        Protocol::GetBlockHashes,
        Protocol::GetBlockBodies,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Handshake => "handshake",
            Protocol::Ping => "ping",
            Protocol::GetAddr => "getaddr",
            Protocol::Addr => "addr",
            Protocol::Intro => "intro",
            Protocol::Tx => "tx",
            Protocol::BlockBody => "blockbody",
            Protocol::RequestBlock => "requestblock",
            Protocol::GetBlockHashes => "getblockhashes",
            Protocol::GetBlockBodies => "getblockbodies",
        }
    }

    /// Full protocol id, e.g. `/0001/handshake/1`
    pub fn id(&self) -> String {
        format!("/{}/{}/1", NET_VERSION, self.name())
    }

    pub fn from_id(id: &str) -> Option<Protocol> {
        Protocol::ALL.iter().copied().find(|p| p.id() == id)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Encode a message body
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(msg)
}

/// Decode a message body
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(data)
}

// =============================================================================
// Messages
// =============================================================================

/// Exchanged on first contact; carries the sender's chain summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub version: String,
    pub best_block_hash: Hash,
    pub best_block_number: u64,
    pub best_block_total_difficulty: TotalDifficulty,
}

/// Liveness probe with chain summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub best_block_hash: Hash,
    pub best_block_number: u64,
    pub best_block_total_difficulty: TotalDifficulty,
}

/// Response to `Ping`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub best_block_hash: Hash,
    pub best_block_number: u64,
    pub best_block_total_difficulty: TotalDifficulty,
}

/// Request for known addresses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetAddr {}

/// A peer address with the time it was last seen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// `<peer-id>@<ip>:<port>`; validated on receipt
    pub address: String,
    /// Unix timestamp (seconds)
    pub timestamp: i64,
}

impl Address {
    pub fn new(address: impl Into<String>, timestamp: i64) -> Self {
        Self {
            address: address.into(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Addr {
    pub addresses: Vec<Address>,
}

/// Announces that a peer exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intro {
    pub peer_id: String,
}

impl Intro {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
        }
    }

    /// Dedup key for the intro
    pub fn hash(&self) -> Hash {
        Hash::digest(self.peer_id.as_bytes())
    }
}

/// First half of a transaction relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxInfo {
    pub hash: Hash,
}

/// Whether the receiver wants the full transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOk {
    pub ok: bool,
}

/// A full block as sent on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockBody {
    pub header: Header,
    pub transactions: Vec<Transaction>,
    pub hash: Hash,
    pub sig: Vec<u8>,
}

impl From<&Block> for BlockBody {
    fn from(block: &Block) -> Self {
        Self {
            header: block.header.clone(),
            transactions: block.transactions.clone(),
            hash: block.hash,
            sig: block.sig.clone(),
        }
    }
}

impl From<BlockBody> for Block {
    fn from(body: BlockBody) -> Self {
        Block {
            header: body.header,
            transactions: body.transactions,
            hash: body.hash,
            sig: body.sig,
            broadcaster: None,
            validation_contexts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBlock {
    pub hash: Hash,
}

/// Request for best-chain hashes following the first known locator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetBlockHashes {
    pub locators: Vec<Hash>,
    pub max_blocks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHashes {
    pub hashes: Vec<Hash>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetBlockBodies {
    pub hashes: Vec<Hash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockBodies {
    pub blocks: Vec<BlockBody>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_ids() {
        assert_eq!(Protocol::Handshake.id(), "/0001/handshake/1");
        assert_eq!(Protocol::GetBlockBodies.id(), "/0001/getblockbodies/1");
        for p in Protocol::ALL {
            assert_eq!(Protocol::from_id(&p.id()), Some(p));
        }
        assert_eq!(Protocol::from_id("/0002/handshake/1"), None);
    }

    #[test]
    fn test_fixed_width_encoding() {
        let msg = TxInfo {
            hash: Hash::digest(b"tx"),
        };
        assert_eq!(encode(&msg).unwrap().len(), 32);

        let msg = GetBlockHashes {
            locators: vec![Hash::digest(b"a"), Hash::digest(b"b")],
            max_blocks: 500,
        };
        // length prefix + two hashes + u64
        assert_eq!(encode(&msg).unwrap().len(), 8 + 64 + 8);
    }

    #[test]
    fn test_handshake_decoding() {
        let msg = Handshake {
            version: CLIENT_VERSION.to_string(),
            best_block_hash: Block::genesis().hash,
            best_block_number: 0,
            best_block_total_difficulty: TotalDifficulty::new(1),
        };
        let decoded: Handshake = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);

        assert!(decode::<Handshake>(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_block_body_conversion() {
        let tx = Transaction::new(1, "a", "b", 1, 1);
        let block = Block::child_of(&Block::genesis(), 3, vec![tx]);
        let body = BlockBody::from(&block);
        let back: Block = body.into();
        assert_eq!(back.hash, block.hash);
        assert_eq!(back.compute_hash(), block.hash);
        assert_eq!(back.transactions.len(), 1);
    }

    #[test]
    fn test_intro_hash() {
        let a = Intro::new("peer-a");
        assert_eq!(a.hash(), Intro::new("peer-a").hash());
        assert_ne!(a.hash(), Intro::new("peer-b").hash());
    }
}
