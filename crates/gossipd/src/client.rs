//! Outgoing gossip client
//!
//! A [`PeerClient`] dials one address, announces this node and then keeps the
//! peer up to date: a ".*" subscription wakes the send path on every local
//! change, and a separate receive task merges replies. Each reply is checked
//! for redundancy (loopback, duplicate connection, forward) and a redundant
//! client ends itself. However the client ends, it reports back to the node
//! exactly once so the node can redial.

use crate::error::GossipError;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::node::{advance_stamps, Gossip};
use gossip_core::canonical::encoded_len;
use gossip_core::{extract_keys, Delta, GossipRequest, GossipResponse, HighWaterStamps, NodeAddr, NodeId};
use gossip_net::{CircuitBreaker, ClientConnection, TransportError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a client
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Created,
    Dialing,
    /// Stream open, first request sent
    Negotiating,
    Exchanging,
    Closed,
}

#[derive(Debug)]
struct ClientInner {
    state: ClientState,
    /// Learned from the first reply
    peer_id: NodeId,
    /// What we believe the peer already has
    remote_stamps: HighWaterStamps,
    /// Set when the peer forwarded us to a resolvable alternate
    forward_addr: Option<NodeAddr>,
    /// Whether this client holds the peer's slot in the outgoing set
    registered: bool,
}

/// Client side of one outgoing gossip stream
#[derive(Debug)]
pub struct PeerClient {
    addr: NodeAddr,
    created_at: Instant,
    closer: CancellationToken,
    metrics: Metrics,
    inner: Mutex<ClientInner>,
}

impl PeerClient {
    pub(crate) fn new(addr: NodeAddr, closer: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            addr,
            created_at: Instant::now(),
            closer,
            metrics: Metrics::new(),
            inner: Mutex::new(ClientInner {
                state: ClientState::Created,
                peer_id: NodeId::UNKNOWN,
                remote_stamps: HighWaterStamps::new(),
                forward_addr: None,
                registered: false,
            }),
        })
    }

    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    /// Peer's node ID, unknown until the first reply
    pub fn peer_id(&self) -> NodeId {
        self.inner.lock().peer_id
    }

    pub fn state(&self) -> ClientState {
        self.inner.lock().state
    }

    pub fn forward_addr(&self) -> Option<NodeAddr> {
        self.inner.lock().forward_addr.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Ask the client to stop. It still reports itself disconnected.
    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    pub(crate) fn registered_outgoing(&self) -> bool {
        self.inner.lock().registered
    }

    fn set_state(&self, state: ClientState) {
        self.inner.lock().state = state;
    }

    /// Client task body.
    pub(crate) async fn run(self: Arc<Self>, gossip: Arc<Gossip>, breaker: Arc<CircuitBreaker>) {
        if let Err(e) = self.connect_and_gossip(&gossip, &breaker).await {
            self.log_close(&gossip, &e);
        }
        self.set_state(ClientState::Closed);
        self.closer.cancel();
        gossip.report_disconnected(self);
    }

    async fn connect_and_gossip(
        self: &Arc<Self>,
        gossip: &Arc<Gossip>,
        breaker: &CircuitBreaker,
    ) -> Result<(), GossipError> {
        // Only the first failure of a streak is worth a warning
        let quiet = breaker.consecutive_failures() > 0;
        self.set_state(ClientState::Dialing);

        let this = self;
        let dialed = tokio::select! {
            _ = self.closer.cancelled() => return Ok(()),
            dialed = breaker.call(move || async move {
                let conn = gossip.transport().dial(&this.addr).await?;
                this.set_state(ClientState::Negotiating);
                this.request_gossip(gossip, &conn).await?;
                Ok::<_, GossipError>(conn)
            }) => dialed,
        };
        let conn = match dialed {
            Ok(conn) => conn,
            Err(e) => {
                if !quiet {
                    warn!(
                        "node {}: failed to start gossip client to {}: {}",
                        gossip.node_id(),
                        self.addr,
                        e
                    );
                }
                return Ok(());
            }
        };

        info!("node {}: started gossip client to {}", gossip.node_id(), self.addr);
        self.set_state(ClientState::Exchanging);
        self.exchange(gossip, conn).await
    }

    /// Announce ourselves with our stamps and no infos.
    async fn request_gossip(&self, gossip: &Gossip, conn: &ClientConnection) -> Result<(), GossipError> {
        let request = GossipRequest {
            node_id: gossip.node_id(),
            addr: Some(gossip.node_addr().clone()),
            delta: Delta::new(),
            high_water_stamps: gossip.high_water_stamps(),
        };
        self.record_sent(gossip, &request);
        conn.requests
            .send(request)
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        Ok(())
    }

    /// Exchange loop: send on local change until closed or the receive task
    /// ends, then tear down in order.
    async fn exchange(self: &Arc<Self>, gossip: &Arc<Gossip>, conn: ClientConnection) -> Result<(), GossipError> {
        let ClientConnection { requests, responses } = conn;

        // Single slot: any number of changes collapse into one pending send
        let (send_tx, mut send_rx) = mpsc::channel::<()>(1);
        let on_change = send_tx.clone();
        let subscription = gossip.register_callback(".*", move |_, _| {
            let _ = on_change.try_send(());
        })?;

        let mut receiver = gossip
            .tasks
            .spawn(self.clone().receive(gossip.clone(), responses, send_tx));
        let mut receiver_done = false;

        let result = loop {
            tokio::select! {
                _ = self.closer.cancelled() => break Ok(()),
                received = &mut receiver => {
                    receiver_done = true;
                    break received.unwrap_or_else(|e| Err(GossipError::Task(e)));
                }
                Some(()) = send_rx.recv() => {
                    if let Err(e) = self.send_gossip(gossip, &requests).await {
                        break Err(e);
                    }
                }
            }
        };

        self.closer.cancel();
        drop(requests);
        if !receiver_done {
            // Cancelled above; finishes whatever reply it was handling
            let _ = receiver.await;
        }
        subscription.unregister();
        result
    }

    async fn receive(
        self: Arc<Self>,
        gossip: Arc<Gossip>,
        mut responses: mpsc::Receiver<GossipResponse>,
        send: mpsc::Sender<()>,
    ) -> Result<(), GossipError> {
        loop {
            let reply = tokio::select! {
                _ = self.closer.cancelled() => return Ok(()),
                reply = responses.recv() => reply.ok_or(TransportError::ConnectionClosed)?,
            };
            self.handle_response(&gossip, reply).await?;
            // New remote stamps may leave something for the peer
            let _ = send.try_send(());
        }
    }

    /// Send the peer whatever it is missing, if anything.
    async fn send_gossip(
        &self,
        gossip: &Gossip,
        requests: &mpsc::Sender<GossipRequest>,
    ) -> Result<(), GossipError> {
        let request = {
            let state = gossip.mu.lock();
            let mut inner = self.inner.lock();
            // Nothing to compare against before the first reply
            if inner.peer_id.is_unknown() {
                return Ok(());
            }
            let delta = state.is.delta(&inner.remote_stamps);
            if delta.is_empty() {
                return Ok(());
            }
            advance_stamps(&mut inner.remote_stamps, &delta);
            debug!(
                "node {}: sending {} to node {}",
                gossip.node_id(),
                extract_keys(&delta),
                inner.peer_id
            );
            GossipRequest {
                node_id: gossip.node_id(),
                addr: Some(gossip.node_addr().clone()),
                delta,
                high_water_stamps: state.is.high_water_stamps(),
            }
        };

        self.record_sent(gossip, &request);
        // A peer that stops reading must not hold up close
        tokio::select! {
            _ = self.closer.cancelled() => Ok(()),
            sent = requests.send(request) => {
                sent.map_err(|_| TransportError::ConnectionClosed)?;
                Ok(())
            }
        }
    }

    /// Merge a reply and decide whether this client should live on.
    pub(crate) async fn handle_response(&self, gossip: &Gossip, reply: GossipResponse) -> Result<(), GossipError> {
        let node_id = gossip.node_id();
        let from = reply.node_id;

        let forward = {
            let mut state = gossip.mu.lock();
            let bytes = encoded_len(&reply);
            self.metrics.record_received(bytes, reply.delta.len());
            gossip.metrics().record_received(bytes, reply.delta.len());

            if !reply.delta.is_empty() {
                debug!(
                    "node {}: received {} from node {}",
                    node_id,
                    extract_keys(&reply.delta),
                    from
                );
                let outcome = state.is.combine(reply.delta, from);
                if let Some(e) = &outcome.first_error {
                    warn!(
                        "node {}: failed to fully combine gossip delta from node {}: {}",
                        node_id, from, e
                    );
                }
                gossip.maybe_tighten_locked(&state);
            }

            let mut inner = self.inner.lock();
            inner.peer_id = from;
            inner.remote_stamps = reply.high_water_stamps;

            if from == node_id {
                return Err(GossipError::Loopback {
                    peer: from,
                    addr: self.addr.clone(),
                });
            }
            // Of two nodes dialing each other, the lower ID keeps its client
            if state.has_incoming(from) && node_id > from {
                return Err(GossipError::DuplicateIncoming {
                    peer: from,
                    addr: self.addr.clone(),
                });
            }

            match reply.alternate_addr {
                Some(addr) => {
                    let alternate = reply.alternate_node_id;
                    if state.has_incoming(alternate) || state.has_outgoing(alternate) {
                        return Err(GossipError::AlreadyConnected { from, alternate, addr });
                    }
                    Some((alternate, addr))
                }
                None => {
                    if !inner.registered {
                        if state.has_outgoing(from) {
                            return Err(GossipError::DuplicateOutgoing {
                                peer: from,
                                addr: self.addr.clone(),
                            });
                        }
                        state.outgoing.insert(from);
                        inner.registered = true;
                    }
                    drop(inner);
                    gossip.signal_connected_locked(&mut state);
                    None
                }
            }
        };

        let Some((alternate, addr)) = forward else {
            return Ok(());
        };
        if let Err(e) = gossip.transport().resolve(&addr).await {
            return Err(GossipError::UnresolvableAlternate {
                alternate,
                addr,
                reason: e.to_string(),
            });
        }
        self.inner.lock().forward_addr = Some(addr.clone());
        Err(GossipError::Forwarded {
            from,
            alternate,
            addr,
        })
    }

    fn record_sent(&self, gossip: &Gossip, request: &GossipRequest) {
        let bytes = encoded_len(request);
        self.metrics.record_sent(bytes, request.delta.len());
        gossip.metrics().record_sent(bytes, request.delta.len());
    }

    fn log_close(&self, gossip: &Gossip, e: &GossipError) {
        let peer_id = self.peer_id();
        let peer = if peer_id.is_unknown() {
            self.addr.to_string()
        } else {
            format!("node {} ({})", peer_id, self.addr)
        };

        if e.is_redundant() {
            info!("node {}: {}", gossip.node_id(), e);
        } else if e.is_closed_connection() {
            debug!(
                "node {}: client to {} closed after {:?}",
                gossip.node_id(),
                peer,
                self.created_at.elapsed()
            );
        } else {
            warn!("node {}: closing client to {}: {}", gossip.node_id(), peer, e);
        }
    }
}
