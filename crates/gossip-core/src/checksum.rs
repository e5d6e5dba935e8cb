//! Value checksums
//!
//! BLAKE3 with a domain separation prefix, truncated to 64 bits. The key is
//! mixed in so a value cannot be replayed under a different key.

use blake3::Hasher;

/// Domain prefix for value checksums
pub const DOMAIN_VALUE: &[u8] = b"gossip-value-v1";

/// Checksum over `key` and `raw_bytes`.
pub fn value_checksum(key: &str, raw_bytes: &[u8]) -> u64 {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_VALUE);
    hasher.update(&(key.len() as u64).to_le_bytes());
    hasher.update(key.as_bytes());
    hasher.update(raw_bytes);

    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}
