//! Gossip node coordinator
//!
//! [`Gossip`] owns the info store, the incoming and outgoing peer sets and the
//! outgoing clients, all behind one mutex that is never held across an await.
//! Methods suffixed `_locked` take the guarded state and must be called with
//! the mutex held.
//!
//! Two long-running tasks hang off a started node: the accept loop in
//! [`crate::server`] and the manage loop here, which handles client
//! disconnects, tighten requests, stall checks and expiry sweeps. Every task
//! is tracked so [`Gossip::shutdown`] can wait for all of them.

use crate::client::PeerClient;
use crate::config::GossipSettings;
use crate::error::GossipError;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::node_set::NodeSet;
use crate::tighten::{self, HopBoundPolicy, NetworkView, TightenAction, TightenPolicy};
use gossip_core::canonical::encode_node_addr;
use gossip_core::{
    node_key, Delta, HighWaterStamps, InfoStore, NodeAddr, NodeId, Subscription, Value,
};
use gossip_net::{BreakerRegistry, BreakerState, ServerConnection, Transport};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// State guarded by the node mutex
pub(crate) struct GossipState {
    pub(crate) is: InfoStore,
    pub(crate) outgoing: NodeSet,
    pub(crate) incoming: NodeSet,
    /// Address each incoming peer advertised, candidates for forwarding
    pub(crate) incoming_addrs: HashMap<NodeId, NodeAddr>,
    /// Outgoing clients keyed by dial address, including ones still
    /// handshaking
    pub(crate) clients: HashMap<String, Arc<PeerClient>>,
    /// Addresses that turned out to be this node
    loopback_addrs: HashSet<String>,
    bootstrap: Vec<NodeAddr>,
    connected: bool,
    stalled: bool,
}

impl GossipState {
    pub(crate) fn has_incoming(&self, node_id: NodeId) -> bool {
        self.incoming.contains(node_id)
    }

    pub(crate) fn has_outgoing(&self, node_id: NodeId) -> bool {
        self.outgoing.contains(node_id)
    }

    fn can_dial(&self, addr: &NodeAddr) -> bool {
        !self.clients.contains_key(&addr.address) && !self.loopback_addrs.contains(&addr.address)
    }
}

/// Point-in-time view of a node
#[derive(Debug, Clone)]
pub struct GossipStats {
    pub node_id: NodeId,
    pub infos: usize,
    pub incoming: Vec<NodeId>,
    pub outgoing: Vec<NodeId>,
    pub clients: usize,
    pub max_peers: usize,
    pub connected: bool,
    pub metrics: MetricsSnapshot,
}

type Receivers = (
    mpsc::UnboundedReceiver<Arc<PeerClient>>,
    mpsc::Receiver<()>,
);

/// A gossip node
pub struct Gossip {
    node_id: NodeId,
    node_addr: NodeAddr,
    settings: GossipSettings,
    transport: Arc<dyn Transport>,
    policy: Box<dyn TightenPolicy>,
    breakers: BreakerRegistry,
    pub(crate) mu: Mutex<GossipState>,
    metrics: Metrics,
    connected_tx: watch::Sender<bool>,
    disconnected_tx: mpsc::UnboundedSender<Arc<PeerClient>>,
    tighten_tx: mpsc::Sender<()>,
    receivers: Mutex<Option<Receivers>>,
    pub(crate) stopper: CancellationToken,
    pub(crate) tasks: TaskTracker,
}

impl Gossip {
    /// Create a node with the default tighten policy. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(
        node_id: NodeId,
        node_addr: NodeAddr,
        settings: GossipSettings,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Self::with_policy(node_id, node_addr, settings, transport, Box::new(HopBoundPolicy))
    }

    pub fn with_policy(
        node_id: NodeId,
        node_addr: NodeAddr,
        settings: GossipSettings,
        transport: Arc<dyn Transport>,
        policy: Box<dyn TightenPolicy>,
    ) -> Arc<Self> {
        let (connected_tx, _) = watch::channel(false);
        let (disconnected_tx, disconnected_rx) = mpsc::unbounded_channel();
        let (tighten_tx, tighten_rx) = mpsc::channel(1);
        let breakers = BreakerRegistry::new(settings.breaker.clone());

        Arc::new(Self {
            node_id,
            node_addr: node_addr.clone(),
            settings,
            transport,
            policy,
            breakers,
            mu: Mutex::new(GossipState {
                is: InfoStore::new(node_id, node_addr),
                outgoing: NodeSet::new(),
                incoming: NodeSet::new(),
                incoming_addrs: HashMap::new(),
                clients: HashMap::new(),
                loopback_addrs: HashSet::new(),
                bootstrap: Vec::new(),
                connected: false,
                stalled: false,
            }),
            metrics: Metrics::new(),
            connected_tx,
            disconnected_tx,
            tighten_tx,
            receivers: Mutex::new(Some((disconnected_rx, tighten_rx))),
            stopper: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Publish our address, serve `listener` and dial `bootstrap`.
    pub fn start(
        self: &Arc<Self>,
        listener: mpsc::Receiver<ServerConnection>,
        bootstrap: Vec<NodeAddr>,
    ) -> Result<(), GossipError> {
        let (disconnected_rx, tighten_rx) =
            self.receivers.lock().take().ok_or(GossipError::AlreadyStarted)?;

        {
            let mut state = self.mu.lock();
            let addr_bytes = encode_node_addr(&self.node_addr)?;
            state.is.add_local(&node_key(self.node_id), addr_bytes, None)?;
            state.bootstrap = bootstrap
                .into_iter()
                .filter(|addr| *addr != self.node_addr)
                .collect();
            for addr in state.bootstrap.clone() {
                if !self.outgoing_has_space_locked(&state) {
                    break;
                }
                self.start_client_locked(&mut state, addr);
            }
        }

        info!("node {}: gossip started on {}", self.node_id, self.node_addr);
        self.tasks.spawn(self.clone().serve(listener));
        self.tasks.spawn(self.clone().manage(disconnected_rx, tighten_rx));
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn node_addr(&self) -> &NodeAddr {
        &self.node_addr
    }

    pub fn settings(&self) -> &GossipSettings {
        &self.settings
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Publish a locally originated info.
    pub fn add_info(&self, key: &str, raw_bytes: Vec<u8>, ttl: Option<Duration>) -> Result<(), GossipError> {
        self.mu.lock().is.add_local(key, raw_bytes, ttl)?;
        Ok(())
    }

    /// Current bytes for `key`, if held and not expired.
    pub fn get_info(&self, key: &str) -> Option<Vec<u8>> {
        self.mu.lock().is.get(key).map(|info| info.value.raw_bytes.clone())
    }

    /// Subscribe to accepted writes on keys matching `pattern`.
    ///
    /// Handlers run under the node mutex and must not call back into the node.
    pub fn register_callback<F>(&self, pattern: &str, handler: F) -> Result<Subscription, GossipError>
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        Ok(self.mu.lock().is.register_callback(pattern, handler)?)
    }

    pub fn high_water_stamps(&self) -> HighWaterStamps {
        self.mu.lock().is.high_water_stamps()
    }

    /// Known node addresses other than our own
    pub fn node_addresses(&self) -> Vec<(NodeId, NodeAddr)> {
        self.mu.lock().is.node_addresses()
    }

    pub fn outgoing_nodes(&self) -> Vec<NodeId> {
        self.mu.lock().outgoing.to_vec()
    }

    pub fn incoming_nodes(&self) -> Vec<NodeId> {
        self.mu.lock().incoming.to_vec()
    }

    /// Outgoing clients, registered or not
    pub fn client_count(&self) -> usize {
        self.mu.lock().clients.len()
    }

    /// Live key-pattern subscriptions, including the ones held by clients and
    /// inbound connections
    pub fn callback_count(&self) -> usize {
        self.mu.lock().is.callbacks().len()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    /// Readiness signal; flips to `true` once and stays there.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    /// Wait until the first connection completes its handshake.
    pub async fn wait_connected(&self) -> Result<(), GossipError> {
        let mut connected = self.connected_tx.subscribe();
        tokio::select! {
            _ = self.stopper.cancelled() => Err(GossipError::Stopped),
            result = connected.wait_for(|connected| *connected) => {
                result.map(|_| ()).map_err(|_| GossipError::Stopped)
            }
        }
    }

    pub fn stats(&self) -> GossipStats {
        let state = self.mu.lock();
        GossipStats {
            node_id: self.node_id,
            infos: state.is.len(),
            incoming: state.incoming.to_vec(),
            outgoing: state.outgoing.to_vec(),
            clients: state.clients.len(),
            max_peers: self.max_peers_locked(&state),
            connected: state.connected,
            metrics: self.metrics.snapshot(),
        }
    }

    /// Signal every task to stop without waiting.
    pub fn stop(&self) {
        self.stopper.cancel();
    }

    /// Stop and wait for every client, connection and background task.
    pub async fn shutdown(&self) {
        self.stop();
        self.tasks.close();
        self.tasks.wait().await;
        self.mu.lock().clients.clear();
        info!("node {}: gossip stopped", self.node_id);
    }

    pub(crate) fn report_disconnected(&self, client: Arc<PeerClient>) {
        // The manage loop is gone once the node stops
        let _ = self.disconnected_tx.send(client);
    }

    /// Fan-out budget given what we currently know about the cluster.
    pub(crate) fn max_peers_locked(&self, state: &GossipState) -> usize {
        self.settings.max_peers.unwrap_or_else(|| {
            tighten::max_peers(
                state.is.node_addresses().len() + 1,
                self.settings.max_hops,
                self.settings.min_peers,
            )
        })
    }

    fn outgoing_has_space_locked(&self, state: &GossipState) -> bool {
        state.clients.len() < self.max_peers_locked(state)
    }

    pub(crate) fn incoming_has_space_locked(&self, state: &GossipState) -> bool {
        state.incoming.len() < self.max_peers_locked(state)
    }

    /// Raise the readiness signal the first time a connection is healthy.
    pub(crate) fn signal_connected_locked(&self, state: &mut GossipState) {
        if !state.connected {
            state.connected = true;
            self.connected_tx.send_replace(true);
            info!("node {}: connected to gossip network", self.node_id);
        }
    }

    /// Ask the manage loop to reconsider the connection graph if the hop
    /// bound or fan-out budget is exceeded. Never blocks.
    pub(crate) fn maybe_tighten_locked(&self, state: &GossipState) {
        let too_distant = state
            .is
            .most_distant()
            .is_some_and(|(_, hops)| hops > self.settings.max_hops);
        let too_many = state.outgoing.len() > self.max_peers_locked(state);
        if too_distant || too_many {
            let _ = self.tighten_tx.try_send(());
        }
    }

    /// Close any outgoing client whose peer is `node_id`.
    pub(crate) fn close_outgoing_to_locked(&self, state: &GossipState, node_id: NodeId) {
        for client in state.clients.values().filter(|c| c.peer_id() == node_id) {
            info!(
                "node {}: closing outgoing client to node {} ({}); node {} connected to us",
                self.node_id,
                node_id,
                client.addr(),
                node_id
            );
            client.close();
        }
    }

    fn start_client_locked(self: &Arc<Self>, state: &mut GossipState, addr: NodeAddr) {
        if self.stopper.is_cancelled() || addr == self.node_addr || !state.can_dial(&addr) {
            return;
        }
        debug!("node {}: starting client to {}", self.node_id, addr);
        let client = PeerClient::new(addr.clone(), self.stopper.child_token());
        let breaker = self.breakers.get(&addr.address);
        state.clients.insert(addr.address, client.clone());
        self.tasks.spawn(client.run(self.clone(), breaker));
    }

    /// Start a client to a random known node we have no connection with.
    fn dial_candidate_locked(self: &Arc<Self>, state: &mut GossipState, skip: Option<&NodeAddr>) {
        if !self.outgoing_has_space_locked(state) {
            return;
        }
        let candidates: Vec<NodeAddr> = state
            .is
            .node_addresses()
            .into_iter()
            .filter(|(node_id, addr)| {
                !state.has_incoming(*node_id)
                    && !state.has_outgoing(*node_id)
                    && state.can_dial(addr)
                    && skip != Some(addr)
                    && self.breakers.get(&addr.address).state() != BreakerState::Open
            })
            .map(|(_, addr)| addr)
            .collect();

        match candidates.choose(&mut rand::thread_rng()).cloned() {
            Some(addr) => self.start_client_locked(state, addr),
            None => debug!("node {}: no gossip candidates to dial", self.node_id),
        }
    }

    async fn manage(
        self: Arc<Self>,
        mut disconnected: mpsc::UnboundedReceiver<Arc<PeerClient>>,
        mut tighten: mpsc::Receiver<()>,
    ) {
        let mut stall = interval(self.settings.stall_interval);
        stall.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut purge = interval(self.settings.purge_interval);
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.stopper.cancelled() => break,
                Some(client) = disconnected.recv() => self.handle_disconnected(client),
                Some(()) = tighten.recv() => self.tighten_network(),
                _ = stall.tick() => self.check_stalled(),
                _ = purge.tick() => {
                    self.mu.lock().is.purge_expired();
                }
            }
        }
        debug!("node {}: manage loop stopped", self.node_id);
    }

    fn handle_disconnected(self: &Arc<Self>, client: Arc<PeerClient>) {
        let mut state = self.mu.lock();
        let addr = client.addr().clone();
        if state
            .clients
            .get(&addr.address)
            .is_some_and(|current| Arc::ptr_eq(current, &client))
        {
            state.clients.remove(&addr.address);
        }
        let peer_id = client.peer_id();
        if client.registered_outgoing() {
            state.outgoing.remove(peer_id);
        }
        if peer_id == self.node_id {
            state.loopback_addrs.insert(addr.address.clone());
        }
        if self.stopper.is_cancelled() {
            return;
        }

        match client.forward_addr() {
            Some(forward) => {
                debug!("node {}: following forward to {}", self.node_id, forward);
                self.start_client_locked(&mut state, forward);
            }
            None => self.dial_candidate_locked(&mut state, Some(&addr)),
        }
    }

    fn tighten_network(self: &Arc<Self>) {
        let mut state = self.mu.lock();
        let outgoing = state.outgoing.to_vec();
        let view = NetworkView {
            node_id: self.node_id,
            most_distant: state.is.most_distant(),
            least_useful: state.is.least_useful(&outgoing),
            outgoing,
            incoming: state.incoming.to_vec(),
            clients: state.clients.len(),
            max_peers: self.max_peers_locked(&state),
            max_hops: self.settings.max_hops,
        };

        match self.policy.decide(&view) {
            TightenAction::None => {}
            TightenAction::Dial(node_id) => match state.is.node_address(node_id) {
                Some(addr) => {
                    let hops = view.most_distant.map_or(0, |(_, hops)| hops);
                    info!(
                        "node {}: starting client to distant node {} ({} hops) to tighten network graph",
                        self.node_id, node_id, hops
                    );
                    self.start_client_locked(&mut state, addr);
                }
                None => debug!("node {}: no address for distant node {}", self.node_id, node_id),
            },
            TightenAction::Cull(node_id) => {
                let client = state.clients.values().find(|c| c.peer_id() == node_id).cloned();
                if let Some(client) = client {
                    info!(
                        "node {}: closing least useful client to node {} to tighten network graph",
                        self.node_id, node_id
                    );
                    client.close();
                }
            }
        }
    }

    /// With no connections at all, fall back to the bootstrap addresses.
    fn check_stalled(self: &Arc<Self>) {
        let mut state = self.mu.lock();
        if !state.clients.is_empty() || !state.incoming.is_empty() {
            if state.stalled {
                state.stalled = false;
                info!("node {}: gossip network no longer stalled", self.node_id);
            }
            return;
        }
        if state.bootstrap.is_empty() && state.is.node_addresses().is_empty() {
            return;
        }
        if !state.stalled {
            state.stalled = true;
            warn!("node {}: no gossip connections; redialing bootstrap addresses", self.node_id);
        }

        for addr in state.bootstrap.clone() {
            if !self.outgoing_has_space_locked(&state) {
                break;
            }
            self.start_client_locked(&mut state, addr);
        }
        if state.clients.is_empty() {
            self.dial_candidate_locked(&mut state, None);
        }
    }
}

/// Raise `stamps` to cover everything in `delta`.
pub(crate) fn advance_stamps(stamps: &mut HighWaterStamps, delta: &Delta) {
    for info in delta.values() {
        let stamp = stamps.entry(info.node_id).or_insert(0);
        if info.timestamp() > *stamp {
            *stamp = info.timestamp();
        }
    }
}
