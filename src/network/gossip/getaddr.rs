//! GetAddr exchange
//!
//! The requester sends `GetAddr{}`; the responder answers with an `Addr`
//! listing the active peers it knows about.

use super::{log_err, GossipError, GossipManager, RelayJob, GETADDR_RESPONSE_LIMIT};
use crate::network::host::Stream;
use crate::network::message::{Addr, Address, GetAddr, Protocol};
use crate::network::peer::{Engine, RemotePeer};
use futures::future::join_all;
use std::sync::Arc;

impl GossipManager {
    /// Ask one peer for addresses; returns the addresses it sent that were
    /// accepted
    pub async fn send_get_addr_to_peer(
        &self,
        rp: &RemotePeer,
    ) -> Result<Vec<Address>, GossipError> {
        let mut stream = self.open_stream(rp, Protocol::GetAddr, "SendGetAddr").await?;

        if let Err(err) = stream.write_msg(&GetAddr {}).await {
            stream.reset().await;
            return Err(log_err(err, rp, "[SendGetAddr] Failed to write message"));
        }
        log::debug!("GetAddr message sent to peer {}", rp.short_id());

        match self.process_addr(&mut stream, rp).await {
            Ok(addrs) => {
                stream.close().await;
                Ok(addrs)
            }
            Err(err) => {
                stream.reset().await;
                Err(err)
            }
        }
    }

    /// Ask every peer for addresses at once and relay what comes back.
    /// Does nothing while no more peers are needed. Returns the number of
    /// peers that answered.
    pub async fn send_get_addr(self: &Arc<Self>, peers: Vec<RemotePeer>) -> usize {
        if !self.pm.require_peers().await {
            return 0;
        }

        let tasks = peers.into_iter().map(|rp| {
            let gossip = self.clone();
            tokio::spawn(async move {
                match gossip.send_get_addr_to_peer(&rp).await {
                    Ok(addrs) => {
                        if !addrs.is_empty() {
                            gossip.queue_relay(RelayJob::Addresses(addrs));
                        }
                        true
                    }
                    Err(err) => {
                        log::debug!("[SendGetAddr] {} (peer {})", err, rp.short_id());
                        false
                    }
                }
            })
        });

        join_all(tasks)
            .await
            .into_iter()
            .filter(|res| matches!(res, Ok(true)))
            .count()
    }

    pub(super) async fn on_get_addr(
        &self,
        mut stream: Stream,
        rp: &RemotePeer,
    ) -> Result<(), GossipError> {
        if let Err(err) = stream.read_msg::<GetAddr>().await {
            stream.reset().await;
            return Err(log_err(err, rp, "[OnGetAddr] Failed to read message"));
        }
        log::debug!("Received GetAddr message from peer {}", rp.short_id());

        let mut peers = self.pm.get_active_peers(0).await;
        if peers.len() > GETADDR_RESPONSE_LIMIT {
            peers = self.pm.get_random_active_peers(GETADDR_RESPONSE_LIMIT).await;
        }

        let addresses = peers
            .into_iter()
            .filter(|p| !self.local.is_same(p) && p.id() != rp.id() && !p.is_hardcoded_seed())
            .map(|p| Address::new(p.address().to_string(), p.last_seen.timestamp()))
            .collect();

        if let Err(err) = stream.write_msg(&Addr { addresses }).await {
            stream.reset().await;
            return Err(log_err(err, rp, "[OnGetAddr] Failed to write message"));
        }
        stream.close().await;
        Ok(())
    }
}
