//! Intro flooding
//!
//! An intro announces that a peer exists. It is sent to a couple of
//! connected peers and re-flooded by each receiver. Flooding ends through
//! the one-hour history of `(peer, intro hash)` pairs.

use super::{log_err, GossipError, GossipManager, RelayJob, INTRO_BROADCASTERS, INTRO_HISTORY_TTL};
use crate::events::Event;
use crate::network::host::Stream;
use crate::network::message::{Intro, Protocol};
use crate::network::peer::{Engine, RemotePeer};

impl GossipManager {
    /// Send `intro`, or an intro of the local node, to up to two connected
    /// peers. Returns the number of peers it was sent to.
    pub async fn send_intro(&self, intro: Option<Intro>) -> usize {
        let msg = intro.unwrap_or_else(|| Intro::new(self.local.id().to_string()));
        let hash = msg.hash().to_hex();

        let connected = self.pm.get_connected_peers().await;
        let broadcasters = self.pick_broadcasters_from_peers(connected, INTRO_BROADCASTERS);

        let mut sent = 0;
        for bp in &broadcasters {
            let bp_id = bp.id().to_string();
            if bp_id == msg.peer_id {
                continue;
            }
            if self.history.has_multi(&[&bp_id, &hash]) {
                continue;
            }

            let mut stream = match self.open_stream(bp, Protocol::Intro, "SendIntro").await {
                Ok(stream) => stream,
                Err(_) => continue,
            };
            if let Err(err) = stream.write_msg(&msg).await {
                stream.reset().await;
                log_err(err, bp, "[SendIntro] Failed to write message");
                continue;
            }
            stream.close().await;

            self.pm.add_or_update_node(bp.clone()).await;
            self.history.add_multi(INTRO_HISTORY_TTL, &[&bp_id, &hash]);
            sent += 1;
        }

        log::debug!(
            "Sent intro of {} to {} of {} broadcaster(s)",
            msg.peer_id,
            sent,
            broadcasters.len()
        );
        sent
    }

    pub(super) async fn on_intro(
        &self,
        mut stream: Stream,
        rp: &RemotePeer,
    ) -> Result<(), GossipError> {
        let msg: Intro = match stream.read_msg().await {
            Ok(msg) => msg,
            Err(err) => {
                stream.reset().await;
                return Err(log_err(err, rp, "[OnIntro] Failed to read message"));
            }
        };
        stream.close().await;

        self.intros.add_multi(INTRO_HISTORY_TTL, &[&msg.peer_id]);
        self.history
            .add_multi(INTRO_HISTORY_TTL, &[&rp.id().to_string(), &msg.hash().to_hex()]);
        log::debug!(
            "Received and cached intro from peer {} ({} cached)",
            rp.short_id(),
            self.intros.len()
        );

        self.events.emit(Event::IntroReceived {
            peer_id: msg.peer_id.clone(),
            from: rp.id(),
        });
        self.queue_relay(RelayJob::Intro(msg));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::events::Event;
    use crate::network::message::Intro;
    use crate::testutil::{connect, make_node, test_config, wait_for};

    #[tokio::test]
    async fn test_intro_is_received_once() {
        let a = make_node(test_config()).await;
        let b = make_node(test_config()).await;
        connect(&a, &b).await;

        let mut b_events = b.events().subscribe();
        assert_eq!(a.gossip().send_intro(None).await, 1);

        let event = wait_for(&mut b_events, |e| matches!(e, Event::IntroReceived { .. })).await;
        assert_eq!(
            event,
            Some(Event::IntroReceived {
                peer_id: a.id().to_string(),
                from: a.id(),
            })
        );
        assert!(b.intros().has_multi(&[&a.id().to_string()]));

        // Already sent to b within the hour
        assert_eq!(a.gossip().send_intro(None).await, 0);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_intro_never_goes_back_to_author() {
        let a = make_node(test_config()).await;
        let b = make_node(test_config()).await;
        connect(&a, &b).await;

        let intro = Intro::new(b.id().to_string());
        assert_eq!(a.gossip().send_intro(Some(intro)).await, 0);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_intro_is_reflooded() {
        let a = make_node(test_config()).await;
        let b = make_node(test_config()).await;
        let c = make_node(test_config()).await;
        connect(&a, &b).await;
        connect(&b, &c).await;

        let mut c_events = c.events().subscribe();
        assert_eq!(a.gossip().send_intro(None).await, 1);

        let event = wait_for(&mut c_events, |e| matches!(e, Event::IntroReceived { .. })).await;
        assert_eq!(
            event,
            Some(Event::IntroReceived {
                peer_id: a.id().to_string(),
                from: b.id(),
            })
        );
        assert!(c.intros().has_multi(&[&a.id().to_string()]));

        a.stop().await;
        b.stop().await;
        c.stop().await;
    }
}
