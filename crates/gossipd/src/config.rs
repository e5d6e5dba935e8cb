//! Configuration for gossipd

use clap::Parser;
use gossip_core::{NodeAddr, NodeId};
use gossip_net::BreakerSettings;
use std::net::SocketAddr;
use std::time::Duration;

/// gossipd - cluster metadata gossip daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "gossipd")]
#[command(about = "Cluster metadata gossip daemon")]
pub struct Config {
    /// This node's ID (must be positive and unique in the cluster)
    #[arg(long, env = "GOSSIP_NODE_ID")]
    pub node_id: i32,

    /// Listen address for gossip connections
    #[arg(short, long, default_value = "0.0.0.0:26257")]
    pub listen: SocketAddr,

    /// Address other nodes should dial (defaults to the bound listen address)
    #[arg(long)]
    pub advertise: Option<String>,

    /// Bootstrap peers (comma-separated addresses)
    #[arg(long, value_delimiter = ',')]
    pub bootstrap: Vec<String>,

    /// Hop count past which the node dials the distant origin directly
    #[arg(long, default_value = "3")]
    pub max_hops: u32,

    /// Lower bound on the fan-out budget
    #[arg(long, default_value = "3")]
    pub min_peers: usize,

    /// Fixed fan-out budget (computed from cluster size when unset)
    #[arg(long)]
    pub max_peers: Option<usize>,

    /// Seconds between checks for a stalled (unconnected) node
    #[arg(long, default_value = "2")]
    pub stall_interval_secs: u64,

    /// Seconds between sweeps of expired infos
    #[arg(long, default_value = "60")]
    pub purge_interval_secs: u64,

    /// Consecutive dial failures before an address is backed off
    #[arg(long, default_value = "1")]
    pub breaker_threshold: u32,

    /// Initial dial back-off in milliseconds
    #[arg(long, default_value = "1000")]
    pub breaker_cooldown_ms: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_id <= 0 {
            anyhow::bail!("Node ID must be positive, got {}", self.node_id);
        }
        if self.max_hops < 2 {
            anyhow::bail!("max-hops must be at least 2");
        }
        if self.min_peers == 0 {
            anyhow::bail!("min-peers must be at least 1");
        }
        if self.max_peers == Some(0) {
            anyhow::bail!("max-peers must be at least 1");
        }
        if self.stall_interval_secs == 0 || self.purge_interval_secs == 0 {
            anyhow::bail!("Intervals must be at least one second");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format {:?}", self.log_format);
        }
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        NodeId(self.node_id)
    }

    /// Address to publish, given the address the listener actually bound.
    pub fn advertise_addr(&self, bound: SocketAddr) -> NodeAddr {
        match &self.advertise {
            Some(address) => NodeAddr::tcp(address.clone()),
            None => NodeAddr::tcp(bound.to_string()),
        }
    }

    pub fn bootstrap_addrs(&self) -> Vec<NodeAddr> {
        self.bootstrap
            .iter()
            .map(|address| address.trim())
            .filter(|address| !address.is_empty())
            .map(NodeAddr::tcp)
            .collect()
    }

    pub fn settings(&self) -> GossipSettings {
        GossipSettings {
            max_hops: self.max_hops,
            min_peers: self.min_peers,
            max_peers: self.max_peers,
            stall_interval: Duration::from_secs(self.stall_interval_secs),
            purge_interval: Duration::from_secs(self.purge_interval_secs),
            breaker: BreakerSettings {
                failure_threshold: self.breaker_threshold.max(1),
                cooldown: Duration::from_millis(self.breaker_cooldown_ms),
                ..Default::default()
            },
        }
    }
}

/// Tunables for a gossip node
#[derive(Debug, Clone)]
pub struct GossipSettings {
    pub max_hops: u32,
    pub min_peers: usize,
    /// Fixed fan-out budget; computed from the known node count when `None`
    pub max_peers: Option<usize>,
    pub stall_interval: Duration,
    pub purge_interval: Duration,
    pub breaker: BreakerSettings,
}

impl Default for GossipSettings {
    fn default() -> Self {
        Self {
            max_hops: 3,
            min_peers: 3,
            max_peers: None,
            stall_interval: Duration::from_secs(2),
            purge_interval: Duration::from_secs(60),
            breaker: BreakerSettings::default(),
        }
    }
}
