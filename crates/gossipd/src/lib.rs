//! gossipd - cluster metadata gossip node
//!
//! Every node keeps a copy of a small key/value table and converges on the
//! newest version of each key by gossiping deltas with a bounded set of
//! peers. This crate provides:
//! - The node coordinator with its peer sets and redial policy
//! - Outgoing peer clients with redundancy checks and forwarding
//! - Inbound stream handling with forwarding when full
//! - Connection graph tightening against a hop bound

pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod node;
pub mod node_set;
pub mod server;
pub mod tighten;

pub use client::{ClientState, PeerClient};
pub use config::{Config, GossipSettings};
pub use error::GossipError;
pub use metrics::{Metrics, MetricsSnapshot};
pub use node::{Gossip, GossipStats};
pub use node_set::NodeSet;
pub use tighten::{HopBoundPolicy, NetworkView, TightenAction, TightenPolicy};
