//! Inbound gossip streams
//!
//! Every accepted stream gets its own task. The first request that names a
//! node registers it as an incoming peer if there is room; otherwise the
//! stream is answered with a forward to one of our other incoming peers and
//! closed. Each request is merged and answered with what the requester is
//! missing, and local changes are pushed to the requester as they happen.

use crate::error::GossipError;
use crate::node::{advance_stamps, Gossip, GossipState};
use gossip_core::canonical::encoded_len;
use gossip_core::{extract_keys, GossipRequest, GossipResponse, HighWaterStamps, NodeId};
use gossip_net::{ServerConnection, TransportError};
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Per-stream view of the requesting node
#[derive(Debug, Default)]
struct InboundPeer {
    /// Set once the peer holds a slot in the incoming set
    registered: Option<NodeId>,
    /// What we believe the peer already has
    remote_stamps: HighWaterStamps,
    /// At least one request has been answered
    handshaken: bool,
}

impl Gossip {
    /// Accept loop: serve each inbound stream until the node stops.
    pub(crate) async fn serve(self: Arc<Self>, mut listener: mpsc::Receiver<ServerConnection>) {
        loop {
            tokio::select! {
                _ = self.stopper.cancelled() => break,
                accepted = listener.recv() => match accepted {
                    Some(conn) => {
                        let gossip = self.clone();
                        self.tasks.spawn(gossip.serve_connection(conn));
                    }
                    None => {
                        debug!("node {}: listener closed", self.node_id());
                        break;
                    }
                }
            }
        }
    }

    async fn serve_connection(self: Arc<Self>, conn: ServerConnection) {
        let ServerConnection {
            remote,
            mut requests,
            responses,
        } = conn;
        debug!("node {}: serving gossip stream from {}", self.node_id(), remote);

        let (changed_tx, mut changed_rx) = mpsc::channel::<()>(1);
        let subscription = match self.register_callback(".*", move |_, _| {
            let _ = changed_tx.try_send(());
        }) {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("node {}: unable to serve {}: {}", self.node_id(), remote, e);
                return;
            }
        };

        let mut peer = InboundPeer::default();
        let result = self
            .exchange(&mut peer, &mut requests, &responses, &mut changed_rx)
            .await;

        subscription.unregister();
        if let Some(node_id) = peer.registered {
            let mut state = self.mu.lock();
            state.incoming.remove(node_id);
            state.incoming_addrs.remove(&node_id);
        }
        match result {
            Err(e) if !e.is_closed_connection() => {
                warn!("node {}: gossip stream from {} failed: {}", self.node_id(), remote, e)
            }
            _ => debug!("node {}: gossip stream from {} closed", self.node_id(), remote),
        }
    }

    async fn exchange(
        &self,
        peer: &mut InboundPeer,
        requests: &mut mpsc::Receiver<GossipRequest>,
        responses: &mpsc::Sender<GossipResponse>,
        changed: &mut mpsc::Receiver<()>,
    ) -> Result<(), GossipError> {
        loop {
            tokio::select! {
                _ = self.stopper.cancelled() => return Ok(()),
                request = requests.recv() => {
                    let Some(request) = request else {
                        return Ok(());
                    };
                    let (reply, forwarded) = self.handle_request(peer, request);
                    if !self.respond(responses, reply).await? || forwarded {
                        return Ok(());
                    }
                }
                Some(()) = changed.recv(), if peer.handshaken => {
                    if let Some(reply) = self.push_delta(peer) {
                        if !self.respond(responses, reply).await? {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Send one reply unless the node stops first. Returns false on stop.
    async fn respond(
        &self,
        responses: &mpsc::Sender<GossipResponse>,
        reply: GossipResponse,
    ) -> Result<bool, GossipError> {
        tokio::select! {
            _ = self.stopper.cancelled() => Ok(false),
            sent = responses.send(reply) => {
                sent.map_err(|_| TransportError::ConnectionClosed)?;
                Ok(true)
            }
        }
    }

    /// Merge one request and build the reply. The flag is set when the
    /// reply is a forward and the stream should end.
    fn handle_request(&self, peer: &mut InboundPeer, request: GossipRequest) -> (GossipResponse, bool) {
        let mut state = self.mu.lock();
        self.metrics()
            .record_received(encoded_len(&request), request.delta.len());

        let from = request.node_id;
        if peer.registered.is_none() && !from.is_unknown() && from != self.node_id() {
            if state.has_incoming(from) {
                debug!("node {}: extra gossip stream from node {}", self.node_id(), from);
            } else if self.incoming_has_space_locked(&state) {
                state.incoming.insert(from);
                if let Some(addr) = &request.addr {
                    state.incoming_addrs.insert(from, addr.clone());
                }
                peer.registered = Some(from);
                debug!("node {}: accepted gossip from node {}", self.node_id(), from);
                if self.node_id() > from {
                    self.close_outgoing_to_locked(&state, from);
                }
                self.signal_connected_locked(&mut state);
            } else {
                let reply = self.forward_locked(&state, from);
                self.metrics().record_sent(encoded_len(&reply), 0);
                return (reply, true);
            }
        }

        if !request.delta.is_empty() {
            debug!(
                "node {}: received {} from node {}",
                self.node_id(),
                extract_keys(&request.delta),
                from
            );
            let outcome = state.is.combine(request.delta, from);
            if let Some(e) = &outcome.first_error {
                warn!(
                    "node {}: failed to fully combine gossip delta from node {}: {}",
                    self.node_id(),
                    from,
                    e
                );
            }
            self.maybe_tighten_locked(&state);
        }

        peer.remote_stamps = request.high_water_stamps;
        peer.handshaken = true;
        let reply = self.delta_reply_locked(&state, peer);
        self.metrics()
            .record_sent(encoded_len(&reply), reply.delta.len());
        (reply, false)
    }

    /// Reply carrying local changes the peer has not seen, if any.
    fn push_delta(&self, peer: &mut InboundPeer) -> Option<GossipResponse> {
        let state = self.mu.lock();
        let reply = self.delta_reply_locked(&state, peer);
        if reply.delta.is_empty() {
            return None;
        }
        debug!(
            "node {}: pushing {} to node {}",
            self.node_id(),
            extract_keys(&reply.delta),
            peer.registered.unwrap_or(NodeId::UNKNOWN)
        );
        self.metrics()
            .record_sent(encoded_len(&reply), reply.delta.len());
        Some(reply)
    }

    /// Reply with everything the peer is missing, assuming it will arrive.
    fn delta_reply_locked(&self, state: &GossipState, peer: &mut InboundPeer) -> GossipResponse {
        let delta = state.is.delta(&peer.remote_stamps);
        advance_stamps(&mut peer.remote_stamps, &delta);
        GossipResponse {
            node_id: self.node_id(),
            addr: Some(self.node_addr().clone()),
            delta,
            high_water_stamps: state.is.high_water_stamps(),
            ..Default::default()
        }
    }

    /// Refuse `from` and point it at a random incoming peer.
    fn forward_locked(&self, state: &GossipState, from: NodeId) -> GossipResponse {
        let alternates: Vec<_> = state.incoming_addrs.iter().collect();
        let alternate = alternates
            .choose(&mut rand::thread_rng())
            .map(|&(node_id, addr)| (*node_id, addr.clone()));

        let max_peers = self.max_peers_locked(state);
        let (alternate_node_id, alternate_addr) = match alternate {
            Some((node_id, addr)) => {
                info!(
                    "node {}: refusing gossip from node {} (max {} conns); forwarding to node {} ({})",
                    self.node_id(),
                    from,
                    max_peers,
                    node_id,
                    addr
                );
                (node_id, Some(addr))
            }
            None => {
                info!(
                    "node {}: refusing gossip from node {} (max {} conns); no alternate",
                    self.node_id(),
                    from,
                    max_peers
                );
                (NodeId::UNKNOWN, None)
            }
        };

        GossipResponse {
            node_id: self.node_id(),
            addr: Some(self.node_addr().clone()),
            high_water_stamps: state.is.high_water_stamps(),
            alternate_node_id,
            alternate_addr,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::GossipSettings;
    use crate::node::Gossip;
    use gossip_core::{GossipRequest, GossipResponse, NodeId};
    use gossip_net::{MemoryNetwork, Transport};
    use std::time::Duration;

    async fn recv(conn: &mut gossip_net::ClientConnection) -> GossipResponse {
        tokio::time::timeout(Duration::from_secs(5), conn.responses.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_reply_and_push() {
        let network = MemoryNetwork::new();
        let server = Gossip::new(
            NodeId(1),
            MemoryNetwork::addr("n1"),
            GossipSettings::default(),
            network.transport(),
        );
        server.start(network.listen("n1"), vec![]).unwrap();
        server.add_info("region", b"eu".to_vec(), None).unwrap();

        let transport = network.transport();
        let mut conn = transport.dial(&MemoryNetwork::addr("n1")).await.unwrap();
        conn.requests
            .send(GossipRequest {
                node_id: NodeId(5),
                addr: Some(MemoryNetwork::addr("n5")),
                ..Default::default()
            })
            .await
            .unwrap();

        let reply = recv(&mut conn).await;
        assert_eq!(reply.node_id, NodeId(1));
        assert!(reply.alternate_addr.is_none());
        assert!(reply.delta.contains_key("region"));
        assert!(reply.delta.contains_key("node:1"));
        assert_eq!(server.incoming_nodes(), vec![NodeId(5)]);
        assert!(server.is_connected());

        // Later local writes are pushed without a request
        server.add_info("zone", b"eu-1".to_vec(), None).unwrap();
        let pushed = recv(&mut conn).await;
        assert_eq!(pushed.delta.keys().collect::<Vec<_>>(), vec!["zone"]);

        drop(conn);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !server.incoming_nodes().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_while_peer_stops_reading() {
        let network = MemoryNetwork::new();
        let server = Gossip::new(
            NodeId(1),
            MemoryNetwork::addr("n1"),
            GossipSettings::default(),
            network.transport(),
        );
        server.start(network.listen("n1"), vec![]).unwrap();

        let transport = network.transport();
        let conn = transport.dial(&MemoryNetwork::addr("n1")).await.unwrap();
        conn.requests
            .send(GossipRequest {
                node_id: NodeId(5),
                addr: Some(MemoryNetwork::addr("n5")),
                ..Default::default()
            })
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.incoming_nodes().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Pushes pile up unread until the response channel is full
        for i in 0..60 {
            server.add_info(&format!("key-{}", i), b"v".to_vec(), None).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tokio::time::timeout(Duration::from_secs(3), server.shutdown())
            .await
            .unwrap();
        assert!(server.incoming_nodes().is_empty());
        assert_eq!(server.callback_count(), 0);
        drop(conn);
    }

    #[tokio::test]
    async fn test_forward_when_full() {
        let network = MemoryNetwork::new();
        let settings = GossipSettings {
            max_peers: Some(1),
            ..Default::default()
        };
        let server = Gossip::new(NodeId(1), MemoryNetwork::addr("n1"), settings, network.transport());
        server.start(network.listen("n1"), vec![]).unwrap();
        let transport = network.transport();

        let mut first = transport.dial(&MemoryNetwork::addr("n1")).await.unwrap();
        first
            .requests
            .send(GossipRequest {
                node_id: NodeId(2),
                addr: Some(MemoryNetwork::addr("n2")),
                ..Default::default()
            })
            .await
            .unwrap();
        recv(&mut first).await;

        let mut second = transport.dial(&MemoryNetwork::addr("n1")).await.unwrap();
        second
            .requests
            .send(GossipRequest {
                node_id: NodeId(3),
                addr: Some(MemoryNetwork::addr("n3")),
                ..Default::default()
            })
            .await
            .unwrap();
        let reply = recv(&mut second).await;
        assert_eq!(reply.alternate_node_id, NodeId(2));
        assert_eq!(reply.alternate_addr, Some(MemoryNetwork::addr("n2")));
        assert!(reply.delta.is_empty());

        // Forwarded streams are closed by the server
        let closed = tokio::time::timeout(Duration::from_secs(5), second.responses.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
        assert_eq!(server.incoming_nodes(), vec![NodeId(2)]);

        server.shutdown().await;
    }
}
