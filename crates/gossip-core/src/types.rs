//! Core gossip types
//!
//! Everything here crosses the wire inside a frame payload, so all types
//! derive serde and field order is the postcard encoding order.

use crate::checksum::value_checksum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Prefix for the info key carrying a node's advertised address.
pub const NODE_KEY_PREFIX: &str = "node:";

/// Expiry stamp meaning "never expires".
pub const NO_EXPIRY: i64 = i64::MAX;

// =============================================================================
// IDENTITY TYPES
// =============================================================================

/// Cluster-unique node identifier. Zero means "not yet known".
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub i32);

impl NodeId {
    /// Placeholder used before a peer has identified itself
    pub const UNKNOWN: NodeId = NodeId(0);

    pub fn is_unknown(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unresolved network address as advertised by a node.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeAddr {
    /// Network name, e.g. "tcp" or "mem"
    pub network: String,
    /// host:port, left unresolved so certificates stay valid for the name
    pub address: String,
}

impl NodeAddr {
    pub fn new(network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
        }
    }

    pub fn tcp(address: impl Into<String>) -> Self {
        Self::new("tcp", address)
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Info key under which `node_id` publishes its address.
pub fn node_key(node_id: NodeId) -> String {
    format!("{}{}", NODE_KEY_PREFIX, node_id.0)
}

/// Parse the node ID out of a `node:<id>` key.
pub fn node_id_from_key(key: &str) -> Option<NodeId> {
    key.strip_prefix(NODE_KEY_PREFIX)?
        .parse::<i32>()
        .ok()
        .filter(|id| *id != 0)
        .map(NodeId)
}

// =============================================================================
// INFO
// =============================================================================

/// Opaque payload plus its logical timestamp.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Value {
    pub raw_bytes: Vec<u8>,
    /// Logical timestamp, monotonically increasing per origin node
    pub timestamp: i64,
    /// Checksum over key and bytes, see [`value_checksum`]
    pub checksum: u64,
}

impl Value {
    /// Build a value for `key` with its checksum filled in.
    pub fn new(key: &str, raw_bytes: Vec<u8>, timestamp: i64) -> Self {
        let checksum = value_checksum(key, &raw_bytes);
        Self {
            raw_bytes,
            timestamp,
            checksum,
        }
    }

    /// Whether the stored checksum matches `key` and the bytes.
    pub fn verify(&self, key: &str) -> bool {
        self.checksum == value_checksum(key, &self.raw_bytes)
    }
}

/// One gossiped fact.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Info {
    pub value: Value,
    /// Absolute expiry in unix nanos; [`NO_EXPIRY`] if none
    pub ttl_stamp: i64,
    /// Hops from the origin node (0 for local writes)
    pub hops: u32,
    /// Node that produced this version
    pub node_id: NodeId,
    /// Peer this copy was received from (origin for local writes)
    pub peer_id: NodeId,
}

impl Info {
    pub fn timestamp(&self) -> i64 {
        self.value.timestamp
    }

    pub fn expired(&self, now_nanos: i64) -> bool {
        self.ttl_stamp <= now_nanos
    }
}

/// Per-origin highest timestamp seen.
pub type HighWaterStamps = BTreeMap<NodeId, i64>;

/// Set of infos keyed by info key, as shipped in a delta.
pub type Delta = BTreeMap<String, Info>;

// =============================================================================
// MESSAGES
// =============================================================================

/// Client to server.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct GossipRequest {
    pub node_id: NodeId,
    pub addr: Option<NodeAddr>,
    pub delta: Delta,
    pub high_water_stamps: HighWaterStamps,
}

/// Server to client.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct GossipResponse {
    pub node_id: NodeId,
    pub addr: Option<NodeAddr>,
    pub delta: Delta,
    pub high_water_stamps: HighWaterStamps,
    /// Set together with `alternate_addr` when the server redirects the client
    pub alternate_node_id: NodeId,
    pub alternate_addr: Option<NodeAddr>,
}

/// Key list of a delta for log lines.
pub fn extract_keys(delta: &Delta) -> String {
    let keys: Vec<&str> = delta.keys().map(String::as_str).collect();
    format!("[{}]", keys.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_key_roundtrip() {
        let key = node_key(NodeId(42));
        assert_eq!(key, "node:42");
        assert_eq!(node_id_from_key(&key), Some(NodeId(42)));
        assert_eq!(node_id_from_key("node:0"), None);
        assert_eq!(node_id_from_key("node:abc"), None);
        assert_eq!(node_id_from_key("cluster-id"), None);
    }

    #[test]
    fn test_value_checksum_verification() {
        let mut value = Value::new("k1", b"hello".to_vec(), 5);
        assert!(value.verify("k1"));
        assert!(!value.verify("k2"));

        value.raw_bytes.push(b'!');
        assert!(!value.verify("k1"));
    }

    #[test]
    fn test_extract_keys() {
        let mut delta = Delta::new();
        let info = Info {
            value: Value::new("a", vec![], 1),
            ttl_stamp: NO_EXPIRY,
            hops: 0,
            node_id: NodeId(1),
            peer_id: NodeId(1),
        };
        delta.insert("b".into(), info.clone());
        delta.insert("a".into(), info);
        assert_eq!(extract_keys(&delta), "[a b]");
    }
}
