//! Connection graph tightening
//!
//! When a merge brings in fresh infos the node asks its [`TightenPolicy`]
//! whether to dial a distant node or cull a redundant outgoing peer. The
//! policy only decides; the node applies the action under its mutex.

use gossip_core::NodeId;

/// Snapshot of the node's view of the network, taken under the node mutex.
#[derive(Debug, Clone, Default)]
pub struct NetworkView {
    pub node_id: NodeId,
    /// Origin whose infos reached us over the most hops, with that count
    pub most_distant: Option<(NodeId, u32)>,
    /// Peers with a registered outgoing client
    pub outgoing: Vec<NodeId>,
    /// Peers connected to us inbound
    pub incoming: Vec<NodeId>,
    /// Outgoing clients including ones still handshaking
    pub clients: usize,
    pub max_peers: usize,
    pub max_hops: u32,
    /// Outgoing peer that delivered the fewest infos we hold
    pub least_useful: Option<NodeId>,
}

impl NetworkView {
    pub fn has_outgoing_space(&self) -> bool {
        self.clients < self.max_peers
    }

    fn connected_to(&self, node_id: NodeId) -> bool {
        self.outgoing.contains(&node_id) || self.incoming.contains(&node_id)
    }
}

/// What the node should do to its connection graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TightenAction {
    None,
    /// Start a client to this node
    Dial(NodeId),
    /// Close the outgoing client to this node
    Cull(NodeId),
}

/// Decides how to reshape the connection graph.
///
/// Implementations must never pick an action that pushes the worst known hop
/// count up.
pub trait TightenPolicy: Send + Sync {
    fn decide(&self, view: &NetworkView) -> TightenAction;
}

/// Dial the most distant node when it is past `max_hops`; otherwise cull the
/// least useful outgoing peer while over the fan-out budget.
#[derive(Debug, Default, Clone, Copy)]
pub struct HopBoundPolicy;

impl TightenPolicy for HopBoundPolicy {
    fn decide(&self, view: &NetworkView) -> TightenAction {
        let worst_hops = view.most_distant.map_or(0, |(_, hops)| hops);

        if let Some((node_id, hops)) = view.most_distant {
            if hops > view.max_hops
                && view.has_outgoing_space()
                && node_id != view.node_id
                && !view.connected_to(node_id)
            {
                return TightenAction::Dial(node_id);
            }
        }

        // Culling is only safe while everything is within the hop bound
        if view.outgoing.len() > view.max_peers && worst_hops <= view.max_hops {
            if let Some(node_id) = view.least_useful {
                return TightenAction::Cull(node_id);
            }
        }

        TightenAction::None
    }
}

/// Fan-out budget for a cluster of `node_count` nodes.
///
/// Enough peers that, with each node at this fan-out, everything is reachable
/// within `max_hops` hops, and never fewer than `min_peers`.
pub fn max_peers(node_count: usize, max_hops: u32, min_peers: usize) -> usize {
    if node_count <= 1 || max_hops <= 1 {
        return min_peers.max(node_count.saturating_sub(1)).max(1);
    }
    let exponent = (node_count as f64).ln() / f64::from(max_hops - 1);
    // Shave rounding noise so exact roots (sqrt(100) = 10) don't round up
    let peers = (exponent.exp() - 1e-9).ceil() as usize;
    peers.max(min_peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> NetworkView {
        NetworkView {
            node_id: NodeId(1),
            max_peers: 3,
            max_hops: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_dials_distant_node() {
        let mut view = view();
        view.most_distant = Some((NodeId(9), 5));
        view.outgoing = vec![NodeId(2)];
        view.clients = 1;
        assert_eq!(HopBoundPolicy.decide(&view), TightenAction::Dial(NodeId(9)));

        // No room left
        view.clients = 3;
        assert_eq!(HopBoundPolicy.decide(&view), TightenAction::None);
    }

    #[test]
    fn test_skips_connected_distant_node() {
        let mut view = view();
        view.most_distant = Some((NodeId(9), 5));
        view.incoming = vec![NodeId(9)];
        assert_eq!(HopBoundPolicy.decide(&view), TightenAction::None);
    }

    #[test]
    fn test_culls_only_within_hop_bound() {
        let mut view = view();
        view.outgoing = vec![NodeId(2), NodeId(3), NodeId(4), NodeId(5)];
        view.clients = 4;
        view.least_useful = Some(NodeId(4));
        view.most_distant = Some((NodeId(8), 2));
        assert_eq!(HopBoundPolicy.decide(&view), TightenAction::Cull(NodeId(4)));

        view.most_distant = Some((NodeId(8), 4));
        assert_eq!(HopBoundPolicy.decide(&view), TightenAction::None);
    }

    #[test]
    fn test_max_peers() {
        assert_eq!(max_peers(1, 3, 3), 3);
        assert_eq!(max_peers(8, 3, 3), 3);
        assert_eq!(max_peers(100, 3, 3), 10);
        assert_eq!(max_peers(1000, 3, 3), 32);
        assert_eq!(max_peers(100, 5, 1), 4);
    }
}
