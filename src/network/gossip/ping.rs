//! Ping/Pong
//!
//! Both messages carry the sender's chain summary. A peer whose total
//! difficulty beats ours triggers a block-hash request.

use super::{log_err, GossipError, GossipManager};
use crate::core::{Block, TotalDifficulty};
use crate::events::PeerChainInfo;
use crate::network::host::Stream;
use crate::network::message::{Ping, Pong, Protocol};
use crate::network::peer::{Engine, RemotePeer};
use std::sync::Arc;

impl GossipManager {
    /// Ping one peer and handle its pong
    pub async fn send_ping_to_peer(self: &Arc<Self>, rp: &RemotePeer) -> Result<(), GossipError> {
        let best = self.best_block()?;
        let mut stream = self.open_stream(rp, Protocol::Ping, "SendPing").await?;

        let msg = Ping {
            best_block_hash: best.hash,
            best_block_number: best.number(),
            best_block_total_difficulty: best.total_difficulty(),
        };
        if let Err(err) = stream.write_msg(&msg).await {
            stream.reset().await;
            return Err(log_err(err, rp, "[SendPing] Failed to write message"));
        }
        log::debug!("Sent ping to peer {}", rp.short_id());

        let pong: Pong = match stream.read_msg().await {
            Ok(pong) => pong,
            Err(err) => {
                stream.reset().await;
                return Err(log_err(err, rp, "[SendPing] Failed to read message"));
            }
        };
        stream.close().await;

        self.pm.add_or_update_node(rp.clone()).await;
        log::debug!("Received pong response from peer {}", rp.short_id());

        self.emit_chain_info(
            rp,
            PeerChainInfo {
                peer_id: rp.id(),
                best_block_hash: pong.best_block_hash,
                best_block_number: pong.best_block_number,
                best_block_total_difficulty: pong.best_block_total_difficulty,
            },
        );
        self.maybe_sync(rp, pong.best_block_total_difficulty, &best);
        Ok(())
    }

    /// Ping every acquainted peer in the background; a peer that fails to
    /// answer is treated as disconnected. Returns the number of peers pinged.
    pub async fn send_ping(self: &Arc<Self>, peers: Vec<RemotePeer>) -> usize {
        let total = peers.len();
        let mut sent = 0;
        for rp in peers {
            if !self.pm.is_acquainted(&rp.id()).await {
                continue;
            }
            sent += 1;

            let gossip = self.clone();
            tokio::spawn(async move {
                if let Err(err) = gossip.send_ping_to_peer(&rp).await {
                    log::debug!("[SendPing] {} (peer {})", err, rp.short_id());
                    if let Err(err) = gossip.pm.has_disconnected(&rp.address).await {
                        log::trace!("[SendPing] {}", err);
                    }
                }
            });
        }

        log::debug!("Sent ping to {} of {} peer(s)", sent, total);
        sent
    }

    pub(super) async fn on_ping(
        self: &Arc<Self>,
        mut stream: Stream,
        rp: &RemotePeer,
    ) -> Result<(), GossipError> {
        let msg: Ping = match stream.read_msg().await {
            Ok(msg) => msg,
            Err(err) => {
                stream.reset().await;
                return Err(log_err(err, rp, "[OnPing] Failed to read message"));
            }
        };
        log::debug!("Received ping message from peer {}", rp.short_id());

        let best = match self.best_block() {
            Ok(best) => best,
            Err(err) => {
                stream.reset().await;
                return Err(err);
            }
        };
        let pong = Pong {
            best_block_hash: best.hash,
            best_block_number: best.number(),
            best_block_total_difficulty: best.total_difficulty(),
        };
        if let Err(err) = stream.write_msg(&pong).await {
            stream.reset().await;
            return Err(log_err(err, rp, "[OnPing] Failed to write message"));
        }
        stream.close().await;

        self.emit_chain_info(
            rp,
            PeerChainInfo {
                peer_id: rp.id(),
                best_block_hash: msg.best_block_hash,
                best_block_number: msg.best_block_number,
                best_block_total_difficulty: msg.best_block_total_difficulty,
            },
        );
        self.maybe_sync(rp, msg.best_block_total_difficulty, &best);
        Ok(())
    }

    /// Request block hashes from `rp` when its chain is heavier than ours
    fn maybe_sync(self: &Arc<Self>, rp: &RemotePeer, remote_td: TotalDifficulty, best: &Block) {
        if remote_td <= best.total_difficulty() {
            return;
        }

        log::info!(
            "Peer {} has a better chain (td {} > {}), requesting block hashes",
            rp.short_id(),
            remote_td,
            best.total_difficulty()
        );
        let gossip = self.clone();
        let rp = rp.clone();
        tokio::spawn(async move {
            if let Err(err) = gossip.send_get_block_hashes(&rp, Vec::new()).await {
                log::debug!("[SendGetBlockHashes] {} (peer {})", err, rp.short_id());
            }
        });
    }
}
