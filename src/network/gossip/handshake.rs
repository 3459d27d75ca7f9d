//! Handshake exchange
//!
//! Both sides send their chain summary. A completed handshake makes the
//! peers acquainted, which most other protocols require.

use super::{log_err, GossipError, GossipManager, INTRO_HISTORY_TTL};
use crate::events::PeerChainInfo;
use crate::network::host::Stream;
use crate::network::message::{Handshake, Protocol, CLIENT_VERSION};
use crate::network::peer::{Engine, RemotePeer};

impl GossipManager {
    fn handshake_msg(&self) -> Result<Handshake, GossipError> {
        let best = self.best_block()?;
        Ok(Handshake {
            version: CLIENT_VERSION.to_string(),
            best_block_hash: best.hash,
            best_block_number: best.number(),
            best_block_total_difficulty: best.total_difficulty(),
        })
    }

    /// Send a handshake and wait for the peer's
    pub async fn send_handshake(&self, rp: &RemotePeer) -> Result<(), GossipError> {
        let msg = self.handshake_msg()?;
        let mut stream = self
            .open_stream(rp, Protocol::Handshake, "SendHandshake")
            .await?;

        if let Err(err) = stream.write_msg(&msg).await {
            stream.reset().await;
            return Err(log_err(err, rp, "[SendHandshake] Failed to write message"));
        }

        let resp: Handshake = match stream.read_msg().await {
            Ok(resp) => resp,
            Err(err) => {
                stream.reset().await;
                return Err(log_err(err, rp, "[SendHandshake] Failed to read message"));
            }
        };
        stream.close().await;

        self.pm.add_acquainted(rp).await;
        self.complete_handshake(rp, &resp).await;
        Ok(())
    }

    pub(super) async fn on_handshake(
        &self,
        mut stream: Stream,
        rp: &RemotePeer,
    ) -> Result<(), GossipError> {
        let msg: Handshake = match stream.read_msg().await {
            Ok(msg) => msg,
            Err(err) => {
                stream.reset().await;
                return Err(log_err(err, rp, "[OnHandshake] Failed to read message"));
            }
        };

        let ours = match self.handshake_msg() {
            Ok(ours) => ours,
            Err(err) => {
                stream.reset().await;
                return Err(err);
            }
        };

        // Acquainted before replying, so the dialer can follow up at once
        self.pm.add_acquainted(rp).await;

        if let Err(err) = stream.write_msg(&ours).await {
            stream.reset().await;
            self.pm.remove_acquainted(rp).await;
            return Err(log_err(err, rp, "[OnHandshake] Failed to write message"));
        }
        stream.close().await;

        self.complete_handshake(rp, &msg).await;
        Ok(())
    }

    async fn complete_handshake(&self, rp: &RemotePeer, msg: &Handshake) {
        self.pm.add_or_update_node(rp.clone()).await;
        self.intros.add_multi(INTRO_HISTORY_TTL, &[&rp.id().to_string()]);

        log::info!(
            "Handshake completed with peer {} ({}, height {})",
            rp.short_id(),
            msg.version,
            msg.best_block_number
        );

        self.emit_chain_info(
            rp,
            PeerChainInfo {
                peer_id: rp.id(),
                best_block_hash: msg.best_block_hash,
                best_block_number: msg.best_block_number,
                best_block_total_difficulty: msg.best_block_total_difficulty,
            },
        );
    }
}
