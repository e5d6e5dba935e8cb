//! Canonical encoding for gossip payloads
//!
//! All wire messages and node address values use postcard. Message sizes fed
//! to the byte counters are the postcard-encoded length, so two nodes account
//! the same message identically.

use crate::error::{Error, Result};
use crate::types::NodeAddr;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Decode a value previously produced by [`canonical_bytes`].
pub fn from_canonical_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(Error::from)
}

/// Encoded size of `value`; 0 if it cannot be encoded.
pub fn encoded_len<T: Serialize>(value: &T) -> usize {
    canonical_bytes(value).map(|bytes| bytes.len()).unwrap_or(0)
}

/// Encode a node address for publication under `node:<id>`.
pub fn encode_node_addr(addr: &NodeAddr) -> Result<Vec<u8>> {
    canonical_bytes(addr)
}

/// Decode a `node:<id>` info payload.
pub fn decode_node_addr(bytes: &[u8]) -> Result<NodeAddr> {
    from_canonical_bytes(bytes)
}
