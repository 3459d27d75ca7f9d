//! Two-phase transaction relay
//!
//! The sender first offers the hash (`TxInfo`). The receiver answers with
//! `TxOk{ok}`; only when it does not know the transaction yet does the full
//! transaction follow on the same stream.

use super::{log_err, GossipError, GossipManager, TX_BROADCASTERS, TX_HISTORY_TTL};
use crate::core::Transaction;
use crate::events::Event;
use crate::network::host::Stream;
use crate::network::message::{Protocol, TxInfo, TxOk};
use crate::network::peer::{Engine, RemotePeer};

impl GossipManager {
    /// Relay a transaction to up to two of `candidates`. Returns the number
    /// of peers that took the full transaction.
    pub async fn broadcast_tx(&self, tx: &Transaction, candidates: Vec<RemotePeer>) -> usize {
        let hash = tx.hash.to_hex();
        let broadcasters = self.pick_broadcasters_from_peers(candidates, TX_BROADCASTERS);

        let mut sent = 0;
        for bp in &broadcasters {
            let bp_id = bp.id().to_string();
            if self.history.has_multi(&[&hash, &bp_id]) {
                continue;
            }

            match self.send_tx(tx, bp).await {
                Ok(taken) => {
                    self.history.add_multi(TX_HISTORY_TTL, &[&hash, &bp_id]);
                    if taken {
                        sent += 1;
                    }
                }
                Err(err) => log::debug!("[BroadcastTx] {} (peer {})", err, bp.short_id()),
            }
        }

        log::info!(
            "Finished relaying transaction {} (sent to {} peer(s))",
            tx.hash.short(),
            sent
        );
        sent
    }

    /// Offer `tx` to one peer; returns whether the peer asked for it
    async fn send_tx(&self, tx: &Transaction, rp: &RemotePeer) -> Result<bool, GossipError> {
        let mut stream = self.open_stream(rp, Protocol::Tx, "SendTx").await?;

        if let Err(err) = stream.write_msg(&TxInfo { hash: tx.hash }).await {
            stream.reset().await;
            return Err(log_err(err, rp, "[SendTx] Failed to write TxInfo"));
        }

        let resp: TxOk = match stream.read_msg().await {
            Ok(resp) => resp,
            Err(err) => {
                stream.reset().await;
                return Err(log_err(err, rp, "[SendTx] Failed to read TxOk"));
            }
        };
        if !resp.ok {
            stream.close().await;
            log::debug!("Peer {} already has tx {}", rp.short_id(), tx.hash.short());
            return Ok(false);
        }

        if let Err(err) = stream.write_msg(tx).await {
            stream.reset().await;
            return Err(log_err(err, rp, "[SendTx] Failed to write transaction"));
        }
        stream.close().await;
        Ok(true)
    }

    pub(super) async fn on_tx(
        &self,
        mut stream: Stream,
        rp: &RemotePeer,
    ) -> Result<(), GossipError> {
        let info: TxInfo = match stream.read_msg().await {
            Ok(info) => info,
            Err(err) => {
                stream.reset().await;
                return Err(log_err(err, rp, "[OnTx] Failed to read TxInfo"));
            }
        };

        let known =
            self.tx_pool.has_by_hash(&info.hash) || self.blockchain.has_transaction(&info.hash);
        if let Err(err) = stream.write_msg(&TxOk { ok: !known }).await {
            stream.reset().await;
            return Err(log_err(err, rp, "[OnTx] Failed to write TxOk"));
        }
        if known {
            stream.close().await;
            return Ok(());
        }

        let tx: Transaction = match stream.read_msg().await {
            Ok(tx) => tx,
            Err(err) => {
                stream.reset().await;
                return Err(log_err(err, rp, "[OnTx] Failed to read transaction"));
            }
        };
        stream.close().await;

        if tx.hash != info.hash || !tx.has_valid_hash() {
            let error = "transaction hash does not match its content".to_string();
            self.events.emit(Event::TxInvalid {
                hash: info.hash,
                error: error.clone(),
            });
            return Err(GossipError::Validation(error));
        }

        self.history
            .add_multi(TX_HISTORY_TTL, &[&tx.hash.to_hex(), &rp.id().to_string()]);
        log::info!("Received transaction {} from peer {}", tx.hash.short(), rp.short_id());
        self.events.emit(Event::TxReceived {
            hash: tx.hash,
            from: rp.id(),
        });

        let hash = tx.hash;
        match self.tx_pool.add(tx) {
            Ok(()) => {
                log::info!("Added transaction {} to pool", hash.short());
                self.events.emit(Event::TxPooled { hash });
                Ok(())
            }
            Err(err) => {
                self.events.emit(Event::TxInvalid {
                    hash,
                    error: err.to_string(),
                });
                Err(GossipError::Validation(err.to_string()))
            }
        }
    }
}
