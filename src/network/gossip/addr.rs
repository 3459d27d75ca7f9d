//! Address handling and relay
//!
//! Addresses arrive either as a GetAddr response or unsolicited (relays and
//! self-advertisements). Each accepted address is registered and then
//! relayed to a few broadcasters, skipping any broadcaster that already
//! exchanged that address with us within the last hour.

use super::{
    log_err, GossipError, GossipManager, RelayJob, ADDR_HISTORY_TTL, MAX_ADDRS_RELAY,
    MAX_RELAY_ADDR_AGE, RELAY_BROADCASTERS,
};
use crate::events::Event;
use crate::network::addr::NodeAddr;
use crate::network::host::Stream;
use crate::network::message::{Addr, Address, Protocol};
use crate::network::peer::{Engine, RemotePeer};
use chrono::Utc;

impl GossipManager {
    /// Read an `Addr` message from `stream` and register its valid
    /// addresses. The whole message is rejected when it carries more
    /// addresses than configured.
    pub(super) async fn process_addr(
        &self,
        stream: &mut Stream,
        rp: &RemotePeer,
    ) -> Result<Vec<Address>, GossipError> {
        let msg: Addr = stream
            .read_msg()
            .await
            .map_err(|err| log_err(err, rp, "[OnAddr] Failed to read message"))?;

        if msg.addresses.len() > self.local.config().max_addrs_expected {
            log::debug!(
                "Too many addresses received from peer {} ({}). Ignoring addresses",
                rp.short_id(),
                msg.addresses.len()
            );
            return Err(GossipError::Validation(
                "too many addresses received. Ignoring addresses".to_string(),
            ));
        }

        let sender = rp.id().to_string();
        let total = msg.addresses.len();
        let mut invalid = 0;
        let mut accepted = Vec::with_capacity(total);

        for addr in msg.addresses {
            let node_addr = match addr.address.parse::<NodeAddr>() {
                Ok(node_addr) => node_addr,
                Err(_) => {
                    invalid += 1;
                    continue;
                }
            };
            if !self.local.test_mode() && !node_addr.is_routable() {
                invalid += 1;
                continue;
            }

            let peer = self.local.new_remote_node(node_addr);
            if self.pm.is_banned(&peer).await {
                invalid += 1;
                continue;
            }

            // Never relay the address back to whoever sent it
            self.history
                .add_multi(ADDR_HISTORY_TTL, &[&addr.address, &sender]);
            self.pm.add_or_update_node(peer).await;
            accepted.push(addr);
        }

        log::debug!(
            "Received {} address(es) from peer {} ({} invalid)",
            total,
            rp.short_id(),
            invalid
        );
        Ok(accepted)
    }

    pub(super) async fn on_addr(
        &self,
        mut stream: Stream,
        rp: &RemotePeer,
    ) -> Result<(), GossipError> {
        match self.process_addr(&mut stream, rp).await {
            Ok(addrs) => {
                stream.close().await;
                if !addrs.is_empty() {
                    self.queue_relay(RelayJob::Addresses(addrs));
                }
                self.events.emit(Event::AddrProcessed { error: None });
                Ok(())
            }
            Err(err) => {
                stream.reset().await;
                self.events.emit(Event::AddrProcessed {
                    error: Some(err.to_string()),
                });
                Err(err)
            }
        }
    }

    /// Relay addresses to a few connected peers. Every rejected address adds
    /// an error; the call itself never stops at the first one.
    pub async fn relay_addresses(&self, addrs: &[Address]) -> Vec<GossipError> {
        let mut errs = Vec::new();
        if addrs.len() > MAX_ADDRS_RELAY {
            errs.push(GossipError::Validation(
                "too many addresses in the message".to_string(),
            ));
            return errs;
        }

        let now = Utc::now().timestamp();
        let mut relayable: Vec<(&Address, NodeAddr)> = Vec::new();
        for addr in addrs {
            let node_addr = match addr.address.parse::<NodeAddr>() {
                Ok(node_addr) => node_addr,
                Err(_) => {
                    errs.push(GossipError::Validation(format!(
                        "address {} is not valid",
                        addr.address
                    )));
                    continue;
                }
            };

            if node_addr.id == self.local.id() {
                errs.push(GossipError::Validation(format!(
                    "address {} is the same as local peer's",
                    addr.address
                )));
                continue;
            }

            if now - addr.timestamp > MAX_RELAY_ADDR_AGE {
                errs.push(GossipError::Validation(format!(
                    "address {} is over 60 minutes old",
                    addr.address
                )));
                continue;
            }

            if self.local.prod_mode() && !node_addr.is_routable() {
                errs.push(GossipError::Validation(format!(
                    "address {} is not routable",
                    addr.address
                )));
                continue;
            }

            if self.pm.is_banned(&self.local.new_remote_node(node_addr)).await {
                errs.push(GossipError::Validation(format!(
                    "address {} associated with a banned peer",
                    addr.address
                )));
                continue;
            }

            relayable.push((addr, node_addr));
        }

        if relayable.is_empty() {
            errs.push(GossipError::Validation("no addr to relay".to_string()));
            return errs;
        }

        let candidates = self.pm.get_connected_peers().await;
        let broadcasters = self.pick_broadcasters_from_peers(candidates, RELAY_BROADCASTERS);
        log::debug!(
            "Relaying {} address(es) to {} broadcaster(s)",
            relayable.len(),
            broadcasters.len()
        );

        let mut relayed = 0;
        for bp in &broadcasters {
            let bp_id = bp.id().to_string();
            let batch: Vec<Address> = relayable
                .iter()
                .filter(|(addr, node_addr)| {
                    node_addr.id != bp.id() && !self.history.has_multi(&[&addr.address, &bp_id])
                })
                .map(|(addr, _)| (*addr).clone())
                .collect();
            if batch.is_empty() {
                continue;
            }

            if let Err(err) = self.send_addr(bp, &batch, "RelayAddresses").await {
                errs.push(err);
                continue;
            }
            for addr in &batch {
                self.history
                    .add_multi(ADDR_HISTORY_TTL, &[&addr.address, &bp_id]);
            }
            relayed += 1;
        }

        self.events.emit(Event::AddressesRelayed { count: relayed });
        errs
    }

    /// Choose up to `n` broadcasters among `peers`, never the local node
    pub fn pick_broadcasters_from_peers(
        &self,
        peers: Vec<RemotePeer>,
        n: usize,
    ) -> Vec<RemotePeer> {
        let candidates = peers
            .into_iter()
            .filter(|p| !self.local.is_same(p))
            .collect();
        self.broadcasters
            .pick(candidates, n, self.local.config().broadcaster_cache_ttl())
    }

    /// Send our own address to every given peer. Returns the number of
    /// successful sends.
    pub async fn self_advertise(&self, peers: &[RemotePeer]) -> usize {
        let own = vec![Address::new(
            self.local.address().to_string(),
            Utc::now().timestamp(),
        )];

        let mut sent = 0;
        for rp in peers {
            if self.local.is_same(rp) {
                continue;
            }
            match self.send_addr(rp, &own, "SelfAdvertise").await {
                Ok(()) => sent += 1,
                Err(err) => log::debug!("[SelfAdvertise] {} (peer {})", err, rp.short_id()),
            }
        }

        log::debug!(
            "Self advertisement completed ({} connected, advertised to {})",
            peers.len(),
            sent
        );
        sent
    }

    async fn send_addr(
        &self,
        rp: &RemotePeer,
        addresses: &[Address],
        op: &str,
    ) -> Result<(), GossipError> {
        let mut stream = self.open_stream(rp, Protocol::Addr, op).await?;
        let msg = Addr {
            addresses: addresses.to_vec(),
        };
        if let Err(err) = stream.write_msg(&msg).await {
            stream.reset().await;
            return Err(log_err(err, rp, &format!("[{}] Failed to write message", op)));
        }
        stream.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::NodeConfig;
    use crate::events::Event;
    use crate::network::addr::{NodeAddr, PeerId};
    use crate::network::message::{Addr, Address, Protocol};
    use crate::network::peer::Engine;
    use crate::testutil::{connect, dev_config, eventually, make_node, test_config, wait_for};
    use chrono::Utc;

    fn fresh(seed: u64) -> Address {
        let addr = NodeAddr::new(
            PeerId::from_seed(seed),
            format!("10.0.1.{}:9000", seed).parse().unwrap(),
        );
        Address::new(addr.to_string(), Utc::now().timestamp())
    }

    fn public(seed: u64, ip: &str) -> Address {
        let addr = NodeAddr::new(PeerId::from_seed(seed), format!("{}:9000", ip).parse().unwrap());
        Address::new(addr.to_string(), Utc::now().timestamp())
    }

    #[tokio::test]
    async fn test_relay_rejects_too_many_addresses() {
        let node = make_node(test_config()).await;
        let addrs: Vec<Address> = (1..=11).map(fresh).collect();

        let errs = node.gossip().relay_addresses(&addrs).await;
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].to_string(), "too many addresses in the message");
        node.stop().await;
    }

    #[tokio::test]
    async fn test_relay_old_addresses() {
        let node = make_node(test_config()).await;
        let old = Utc::now().timestamp() - 2 * 60 * 60;
        let addrs = vec![
            Address::new(fresh(1).address, old),
            Address::new(fresh(2).address, old),
        ];

        let errs = node.gossip().relay_addresses(&addrs).await;
        assert_eq!(errs.len(), 3);
        assert!(errs[0].to_string().ends_with("is over 60 minutes old"));
        assert_eq!(errs.last().unwrap().to_string(), "no addr to relay");
        node.stop().await;
    }

    #[tokio::test]
    async fn test_relay_accumulates_errors() {
        let node = make_node(test_config()).await;
        let banned = fresh(9);
        let banned_peer = node
            .local()
            .new_remote_node(banned.address.parse().unwrap());
        node.peer_manager()
            .add_time_ban(&banned_peer, chrono::Duration::minutes(30))
            .await;

        let addrs = vec![
            Address::new("garbage", Utc::now().timestamp()),
            Address::new(node.address().to_string(), Utc::now().timestamp()),
            banned,
            fresh(1),
        ];

        let errs: Vec<String> = node
            .gossip()
            .relay_addresses(&addrs)
            .await
            .iter()
            .map(|e| e.to_string())
            .collect();
        assert_eq!(errs.len(), 3);
        assert!(errs[0].ends_with("is not valid"));
        assert!(errs[1].ends_with("is the same as local peer's"));
        assert!(errs[2].ends_with("associated with a banned peer"));
        node.stop().await;
    }

    #[tokio::test]
    async fn test_prod_mode_rejects_unroutable() {
        let config = NodeConfig {
            test_mode: false,
            dev_mode: false,
            ..test_config()
        };
        let node = make_node(config).await;

        let errs = node.gossip().relay_addresses(&[fresh(1)]).await;
        assert_eq!(errs.len(), 2);
        assert!(errs[0].to_string().ends_with("is not routable"));
        node.stop().await;
    }

    #[tokio::test]
    async fn test_relay_sends_once_per_broadcaster() {
        let a = make_node(test_config()).await;
        let b = make_node(test_config()).await;
        connect(&a, &b).await;

        let mut a_events = a.events().subscribe();
        let mut b_events = b.events().subscribe();
        let addr = fresh(1);

        let errs = a.gossip().relay_addresses(&[addr.clone()]).await;
        assert!(errs.is_empty());
        let relayed = wait_for(&mut a_events, |e| {
            matches!(e, Event::AddressesRelayed { .. })
        })
        .await;
        assert_eq!(relayed, Some(Event::AddressesRelayed { count: 1 }));

        let processed = wait_for(&mut b_events, |e| matches!(e, Event::AddrProcessed { .. })).await;
        assert_eq!(processed, Some(Event::AddrProcessed { error: None }));
        assert!(b.peer_manager().peer_exist(&PeerId::from_seed(1)).await);

        // Already exchanged with b within the hour
        let errs = a.gossip().relay_addresses(&[addr]).await;
        assert!(errs.is_empty());
        let relayed = wait_for(&mut a_events, |e| {
            matches!(e, Event::AddressesRelayed { .. })
        })
        .await;
        assert_eq!(relayed, Some(Event::AddressesRelayed { count: 0 }));

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_on_addr_rejects_oversized_message() {
        let config = NodeConfig {
            max_addrs_expected: 2,
            ..test_config()
        };
        let a = make_node(test_config()).await;
        let b = make_node(config).await;
        let mut b_events = b.events().subscribe();

        let mut stream = a
            .host()
            .new_stream(&b.address(), Protocol::Addr)
            .await
            .unwrap();
        let msg = Addr {
            addresses: (1..=3).map(fresh).collect(),
        };
        stream.write_msg(&msg).await.unwrap();
        assert!(stream.read_msg::<Addr>().await.is_err());

        let event = wait_for(&mut b_events, |e| matches!(e, Event::AddrProcessed { .. })).await;
        assert_eq!(
            event,
            Some(Event::AddrProcessed {
                error: Some("too many addresses received. Ignoring addresses".to_string())
            })
        );
        for seed in 1..=3 {
            assert!(!b.peer_manager().peer_exist(&PeerId::from_seed(seed)).await);
        }

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_on_addr_skips_invalid_entries() {
        let a = make_node(dev_config()).await;
        let b = make_node(dev_config()).await;
        connect(&a, &b).await;

        let banned = public(21, "8.8.8.8");
        let banned_peer = b.local().new_remote_node(banned.address.parse().unwrap());
        b.peer_manager()
            .add_time_ban(&banned_peer, chrono::Duration::minutes(30))
            .await;

        let mut stream = a
            .host()
            .new_stream(&b.address(), Protocol::Addr)
            .await
            .unwrap();
        let msg = Addr {
            addresses: vec![
                Address::new("garbage", Utc::now().timestamp()),
                fresh(22),
                banned,
                public(23, "1.2.3.4"),
                public(24, "1.2.3.5"),
            ],
        };
        stream.write_msg(&msg).await.unwrap();
        stream.close().await;

        let pm = b.peer_manager().clone();
        assert!(
            eventually(|| {
                let pm = pm.clone();
                async move { pm.peer_exist(&PeerId::from_seed(24)).await }
            })
            .await
        );
        assert!(pm.peer_exist(&PeerId::from_seed(23)).await);
        // Unroutable outside test mode
        assert!(!pm.peer_exist(&PeerId::from_seed(22)).await);
        assert!(!pm.peer_exist(&PeerId::from_seed(21)).await);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_self_advertise_skips_own_address() {
        let a = make_node(test_config()).await;
        let b = make_node(test_config()).await;
        let rp = connect(&a, &b).await;

        let own = a.gossip().remote_peer(a.address());
        assert_eq!(a.gossip().self_advertise(&[own, rp]).await, 1);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_self_advertise_reaches_each_peer() {
        let a = make_node(test_config()).await;
        let mut others = Vec::new();
        for _ in 0..3 {
            let other = make_node(test_config()).await;
            connect(&a, &other).await;
            others.push(other);
        }
        for other in &others {
            other.peer_manager().forget_peers().await.unwrap();
        }

        let connected = a.peer_manager().get_connected_peers().await;
        assert_eq!(connected.len(), 3);
        assert_eq!(a.gossip().self_advertise(&connected).await, 3);

        for other in &others {
            let pm = other.peer_manager().clone();
            assert!(
                eventually(|| {
                    let pm = pm.clone();
                    async move { pm.get_peers().await.len() == 1 }
                })
                .await
            );
            let peers = pm.get_peers().await;
            assert_eq!(peers[0].id(), a.id());
        }

        a.stop().await;
        for other in &others {
            other.stop().await;
        }
    }
}
