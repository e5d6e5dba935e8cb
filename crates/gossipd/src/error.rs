//! Error types for the gossip node

use gossip_core::{NodeAddr, NodeId};
use gossip_net::{BreakerError, TransportError};
use thiserror::Error;

/// Why a peer client or the node stopped
#[derive(Debug, Error)]
pub enum GossipError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Info store error: {0}")]
    Core(#[from] gossip_core::Error),

    #[error("Dial rejected: {0}")]
    Breaker(#[from] BreakerError),

    /// The remote turned out to be this node
    #[error("stopping outgoing client to node {peer} ({addr}); loopback connection")]
    Loopback { peer: NodeId, addr: NodeAddr },

    /// The remote is already connected to us inbound and we have the higher ID
    #[error("stopping outgoing client to node {peer} ({addr}); already have incoming")]
    DuplicateIncoming { peer: NodeId, addr: NodeAddr },

    /// Another client already holds the outgoing slot for the remote
    #[error("stopping outgoing client to node {peer} ({addr}); already have outgoing")]
    DuplicateOutgoing { peer: NodeId, addr: NodeAddr },

    /// Forwarded to a node we are already connected to
    #[error("received forward from node {from} to {alternate} ({addr}); already connected")]
    AlreadyConnected {
        from: NodeId,
        alternate: NodeId,
        addr: NodeAddr,
    },

    #[error("unable to resolve alternate address {addr} for node {alternate}: {reason}")]
    UnresolvableAlternate {
        alternate: NodeId,
        addr: NodeAddr,
        reason: String,
    },

    /// The remote is full and sent us elsewhere
    #[error("received forward from node {from} to node {alternate} ({addr})")]
    Forwarded {
        from: NodeId,
        alternate: NodeId,
        addr: NodeAddr,
    },

    #[error("receive task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("node already started")]
    AlreadyStarted,

    #[error("gossip node stopped")]
    Stopped,
}

impl GossipError {
    /// Outcomes of the redundancy checks. These end a client on purpose and
    /// are logged at info level.
    pub fn is_redundant(&self) -> bool {
        matches!(
            self,
            GossipError::Loopback { .. }
                | GossipError::DuplicateIncoming { .. }
                | GossipError::DuplicateOutgoing { .. }
                | GossipError::AlreadyConnected { .. }
                | GossipError::UnresolvableAlternate { .. }
                | GossipError::Forwarded { .. }
        )
    }

    /// Stream ended normally
    pub fn is_closed_connection(&self) -> bool {
        match self {
            GossipError::Transport(e) => e.is_closed_connection(),
            GossipError::Stopped => true,
            _ => false,
        }
    }
}
