//! Bounded set of peer node IDs

use gossip_core::NodeId;
use std::collections::BTreeSet;

/// Connected peers in one direction
#[derive(Debug, Default, Clone)]
pub struct NodeSet {
    nodes: BTreeSet<NodeId>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains(&node_id)
    }

    /// Returns false if the node was already present
    pub fn insert(&mut self, node_id: NodeId) -> bool {
        self.nodes.insert(node_id)
    }

    pub fn remove(&mut self, node_id: NodeId) -> bool {
        self.nodes.remove(&node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Members in ascending order
    pub fn to_vec(&self) -> Vec<NodeId> {
        self.nodes.iter().copied().collect()
    }
}
