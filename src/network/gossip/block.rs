//! Block relay and block sync requests
//!
//! - `BlockBody`: push a new block to peers
//! - `RequestBlock`: fetch one block by hash
//! - `GetBlockHashes`: find where our chain and a peer's chain meet and list
//!   the best-chain hashes that follow
//! - `GetBlockBodies`: fetch several blocks at once

use super::{
    log_err, GossipError, GossipManager, BLOCK_HISTORY_TTL, MAX_GET_BLOCK_HASHES,
    ORPHAN_HISTORY_TTL,
};
use crate::core::{Block, Hash, ValidationContext};
use crate::events::Event;
use crate::network::host::Stream;
use crate::network::message::{
    BlockBodies, BlockBody, BlockHashes, GetBlockBodies, GetBlockHashes, Protocol, RequestBlock,
};
use crate::network::peer::{Engine, RemotePeer};

fn block_key(hash: &Hash, peer: &RemotePeer) -> [String; 3] {
    ["b".to_string(), hash.to_hex(), peer.id().to_string()]
}

fn orphan_key(hash: &Hash, peer: &RemotePeer) -> [String; 3] {
    ["ob".to_string(), hash.to_hex(), peer.id().to_string()]
}

fn parts(key: &[String; 3]) -> [&str; 3] {
    [&key[0], &key[1], &key[2]]
}

impl GossipManager {
    // ===== Relay =====

    /// Send `block` to each peer that has not exchanged it with us
    /// recently. Returns the number of peers it was sent to.
    pub async fn relay_block(&self, block: &Block, peers: &[RemotePeer]) -> usize {
        log::debug!(
            "Relaying block {} to {} peer(s)",
            block.number(),
            peers.len()
        );

        let body = BlockBody::from(block);
        let mut sent = 0;
        for rp in peers {
            let key = block_key(&block.hash, rp);
            if self.history.has_multi(&parts(&key)) {
                continue;
            }

            let mut stream = match self.open_stream(rp, Protocol::BlockBody, "RelayBlock").await {
                Ok(stream) => stream,
                Err(_) => continue,
            };
            if let Err(err) = stream.write_msg(&body).await {
                stream.reset().await;
                log_err(err, rp, "[RelayBlock] Failed to write message");
                continue;
            }
            stream.close().await;

            self.history.add_multi(BLOCK_HISTORY_TTL, &parts(&key));
            sent += 1;
        }

        log::info!(
            "Finished relaying block {} (sent to {} peer(s))",
            block.number(),
            sent
        );
        sent
    }

    /// Hand a block from `rp` to the chain and publish the outcome
    fn process_block(&self, mut block: Block, rp: &RemotePeer) -> Result<(), GossipError> {
        block.broadcaster = Some(rp.id());
        let hash = block.hash;
        let number = block.number();

        match self.blockchain.process_block(block) {
            Ok(_) => {
                self.history
                    .add_multi(BLOCK_HISTORY_TTL, &parts(&block_key(&hash, rp)));
                self.events.emit(Event::BlockProcessed {
                    hash,
                    number,
                    error: None,
                });
                Ok(())
            }
            Err(err) => {
                log::debug!("Unable to process block {}: {}", hash.short(), err);
                self.events.emit(Event::BlockProcessed {
                    hash,
                    number,
                    error: Some(err.to_string()),
                });
                Err(GossipError::Blockchain(err.to_string()))
            }
        }
    }

    pub(super) async fn on_block_body(
        &self,
        mut stream: Stream,
        rp: &RemotePeer,
    ) -> Result<(), GossipError> {
        let body: BlockBody = match stream.read_msg().await {
            Ok(body) => body,
            Err(err) => {
                stream.reset().await;
                return Err(log_err(err, rp, "[OnBlockBody] Failed to read message"));
            }
        };
        stream.close().await;

        let block = Block::from(body);
        log::info!(
            "Received block {} (difficulty {}) from peer {}",
            block.number(),
            block.header.difficulty,
            rp.short_id()
        );

        if self.history.has_multi(&parts(&block_key(&block.hash, rp))) {
            return Ok(());
        }
        self.process_block(block, rp)
    }

    // ===== Fetch by hash =====

    /// Fetch one block from `rp` and process it as part of a sync
    pub async fn request_block(&self, rp: &RemotePeer, hash: Hash) -> Result<(), GossipError> {
        let key = orphan_key(&hash, rp);
        if self.history.has_multi(&parts(&key)) {
            return Ok(());
        }

        let mut stream = self
            .open_stream(rp, Protocol::RequestBlock, "RequestBlock")
            .await?;
        if let Err(err) = stream.write_msg(&RequestBlock { hash }).await {
            stream.reset().await;
            return Err(log_err(err, rp, "[RequestBlock] Failed to write message"));
        }

        let body: BlockBody = match stream.read_msg().await {
            Ok(body) => body,
            Err(err) => {
                stream.reset().await;
                return Err(log_err(err, rp, "[RequestBlock] Failed to read message"));
            }
        };
        stream.close().await;

        let mut block = Block::from(body);
        block.validation_contexts.push(ValidationContext::BlockSync);
        self.process_block(block, rp)?;

        self.history.add_multi(ORPHAN_HISTORY_TTL, &parts(&key));
        Ok(())
    }

    pub(super) async fn on_request_block(
        &self,
        mut stream: Stream,
        rp: &RemotePeer,
    ) -> Result<(), GossipError> {
        let msg: RequestBlock = match stream.read_msg().await {
            Ok(msg) => msg,
            Err(err) => {
                stream.reset().await;
                return Err(log_err(err, rp, "[OnRequestBlock] Failed to read message"));
            }
        };

        if msg.hash.is_zero() {
            stream.reset().await;
            return Err(GossipError::Validation(
                "invalid RequestBlock message: empty 'hash' field".to_string(),
            ));
        }

        let block = self
            .blockchain
            .get_chain_reader_by_hash(&msg.hash)
            .and_then(|chain| chain.get_block_by_hash(&msg.hash));
        let Some(block) = block else {
            stream.reset().await;
            return Err(GossipError::Blockchain(format!(
                "block not found: {}",
                msg.hash.short()
            )));
        };

        if let Err(err) = stream.write_msg(&BlockBody::from(&block)).await {
            stream.reset().await;
            return Err(log_err(err, rp, "[OnRequestBlock] Failed to write message"));
        }
        stream.close().await;
        Ok(())
    }

    // ===== Block hashes =====

    /// Ask `rp` for the best-chain hashes following the first locator it
    /// knows. Empty `locators` are derived from the local chain.
    pub async fn send_get_block_hashes(
        &self,
        rp: &RemotePeer,
        locators: Vec<Hash>,
    ) -> Result<Vec<Hash>, GossipError> {
        let locators = if locators.is_empty() {
            self.blockchain
                .get_locators()
                .map_err(|e| GossipError::Blockchain(e.to_string()))?
        } else {
            locators
        };

        self.events.emit(Event::BlockHashesRequested {
            peer: rp.id(),
            locators: locators.len(),
        });

        let mut stream = self
            .open_stream(rp, Protocol::GetBlockHashes, "SendGetBlockHashes")
            .await?;
        let msg = GetBlockHashes {
            locators,
            max_blocks: MAX_GET_BLOCK_HASHES,
        };
        if let Err(err) = stream.write_msg(&msg).await {
            stream.reset().await;
            return Err(log_err(err, rp, "[SendGetBlockHashes] Failed to write message"));
        }

        let resp: BlockHashes = match stream.read_msg().await {
            Ok(resp) => resp,
            Err(err) => {
                stream.reset().await;
                return Err(log_err(err, rp, "[SendGetBlockHashes] Failed to read message"));
            }
        };
        stream.close().await;

        log::debug!(
            "Received {} block hash(es) from peer {}",
            resp.hashes.len(),
            rp.short_id()
        );
        self.events.emit(Event::BlockHashesReceived {
            peer: rp.id(),
            hashes: resp.hashes.clone(),
        });
        Ok(resp.hashes)
    }

    pub(super) async fn on_get_block_hashes(
        &self,
        mut stream: Stream,
        rp: &RemotePeer,
    ) -> Result<(), GossipError> {
        let msg: GetBlockHashes = match stream.read_msg().await {
            Ok(msg) => msg,
            Err(err) => {
                stream.reset().await;
                return Err(log_err(err, rp, "[OnGetBlockHashes] Failed to read message"));
            }
        };

        let hashes = self.block_hashes_after(&msg.locators, msg.max_blocks);
        if let Err(err) = stream.write_msg(&BlockHashes { hashes }).await {
            stream.reset().await;
            return Err(log_err(err, rp, "[OnGetBlockHashes] Failed to write message"));
        }
        stream.close().await;
        Ok(())
    }

    /// Best-chain hashes after the first known locator. A locator on a side
    /// chain resumes after that chain's root; no known locator yields none.
    fn block_hashes_after(&self, locators: &[Hash], max_blocks: u64) -> Vec<Hash> {
        let found = locators.iter().find_map(|hash| {
            self.blockchain
                .get_chain_reader_by_hash(hash)
                .map(|chain| (chain, *hash))
        });
        let Some((chain, locator)) = found else {
            return Vec::new();
        };

        let best = self.blockchain.best_chain();
        let start = if chain.id() == best.id() {
            chain.get_block_by_hash(&locator)
        } else {
            chain.root()
        };
        let Some(start) = start else {
            return Vec::new();
        };

        let max = max_blocks.min(MAX_GET_BLOCK_HASHES) as usize;
        let mut hashes = Vec::new();
        let mut cursor = start.number() + 1;
        while hashes.len() < max {
            match best.get_block(cursor) {
                Some(block) => hashes.push(block.hash),
                None => break,
            }
            cursor += 1;
        }
        hashes
    }

    // ===== Block bodies =====

    /// Fetch blocks by hash from `rp` and process each one. Returns the
    /// number of blocks processed successfully.
    pub async fn send_get_block_bodies(
        &self,
        rp: &RemotePeer,
        hashes: Vec<Hash>,
    ) -> Result<usize, GossipError> {
        let mut stream = self
            .open_stream(rp, Protocol::GetBlockBodies, "SendGetBlockBodies")
            .await?;
        if let Err(err) = stream.write_msg(&GetBlockBodies { hashes }).await {
            stream.reset().await;
            return Err(log_err(err, rp, "[SendGetBlockBodies] Failed to write message"));
        }

        let resp: BlockBodies = match stream.read_msg().await {
            Ok(resp) => resp,
            Err(err) => {
                stream.reset().await;
                return Err(log_err(err, rp, "[SendGetBlockBodies] Failed to read message"));
            }
        };
        stream.close().await;

        let received = resp.blocks.len();
        let mut processed = 0;
        for body in resp.blocks {
            let mut block = Block::from(body);
            block.validation_contexts.push(ValidationContext::BlockSync);
            if self.process_block(block, rp).is_ok() {
                processed += 1;
            }
        }

        log::debug!(
            "Processed {} of {} block bodies from peer {}",
            processed,
            received,
            rp.short_id()
        );
        self.events
            .emit(Event::BlockBodiesProcessed { count: processed });
        Ok(processed)
    }

    pub(super) async fn on_get_block_bodies(
        &self,
        mut stream: Stream,
        rp: &RemotePeer,
    ) -> Result<(), GossipError> {
        let msg: GetBlockBodies = match stream.read_msg().await {
            Ok(msg) => msg,
            Err(err) => {
                stream.reset().await;
                return Err(log_err(err, rp, "[OnGetBlockBodies] Failed to read message"));
            }
        };

        let best = self.blockchain.best_chain();
        let blocks = msg
            .hashes
            .iter()
            .filter_map(|hash| best.get_block_by_hash(hash))
            .map(|block| BlockBody::from(&block))
            .collect();

        if let Err(err) = stream.write_msg(&BlockBodies { blocks }).await {
            stream.reset().await;
            return Err(log_err(err, rp, "[OnGetBlockBodies] Failed to write message"));
        }
        stream.close().await;
        Ok(())
    }
}
