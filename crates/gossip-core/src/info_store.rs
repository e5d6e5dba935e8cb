//! In-memory info store with newer-wins merging
//!
//! The store keeps one [`Info`] per key and, per origin node, the highest
//! timestamp it has seen (the high-water stamps). Deltas are computed by
//! comparing each info's timestamp with the peer's stamp for its origin, so
//! nothing here tracks per-peer state.
//!
//! The store has no locking of its own; the gossip node owns it behind its
//! single mutex.

use crate::callback::{CallbackRegistry, Subscription};
use crate::canonical::decode_node_addr;
use crate::error::{Error, Result};
use crate::types::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Current wall time in unix nanos.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .min(i64::MAX as u128) as i64
}

/// Result of merging a peer's delta.
#[derive(Debug, Default)]
pub struct CombineOutcome {
    /// Infos that replaced an older version or were new
    pub fresh: usize,
    /// Infos that were not newer than what we hold
    pub stale: usize,
    /// Infos rejected as malformed
    pub invalid: usize,
    /// First malformed entry, if any; the rest of the delta was still applied
    pub first_error: Option<Error>,
}

/// Key/value table of gossiped infos.
pub struct InfoStore {
    node_id: NodeId,
    node_addr: NodeAddr,
    infos: HashMap<String, Info>,
    high_water_stamps: HashMap<NodeId, i64>,
    callbacks: Arc<CallbackRegistry>,
    /// Last timestamp handed out for a local write
    last_local_stamp: i64,
}

impl InfoStore {
    pub fn new(node_id: NodeId, node_addr: NodeAddr) -> Self {
        Self {
            node_id,
            node_addr,
            infos: HashMap::new(),
            high_water_stamps: HashMap::new(),
            callbacks: CallbackRegistry::new(),
            last_local_stamp: 0,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn node_addr(&self) -> &NodeAddr {
        &self.node_addr
    }

    /// Registry notified on every accepted write
    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    /// Subscribe to writes on keys matching `pattern`.
    pub fn register_callback<F>(&self, pattern: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.callbacks.register(pattern, handler)
    }

    /// Next timestamp for a locally originated write.
    ///
    /// Wall-clock based, but never behind anything already issued or seen for
    /// this node, so local timestamps stay strictly increasing.
    pub fn next_timestamp(&mut self) -> i64 {
        let seen = self
            .high_water_stamps
            .get(&self.node_id)
            .copied()
            .unwrap_or(0);
        let stamp = now_nanos().max(self.last_local_stamp + 1).max(seen + 1);
        self.last_local_stamp = stamp;
        stamp
    }

    /// Publish a locally originated value.
    pub fn add_local(&mut self, key: &str, raw_bytes: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let timestamp = self.next_timestamp();
        let value = Value::new(key, raw_bytes, timestamp);
        self.put(key, value, self.node_id, ttl)
    }

    /// Insert `value` for `key` if it is newer than the stored version.
    ///
    /// Returns [`Error::NotFresh`] and leaves the store untouched when the
    /// stored version is at least as new.
    pub fn put(&mut self, key: &str, value: Value, origin: NodeId, ttl: Option<Duration>) -> Result<()> {
        let ttl_stamp = match ttl {
            Some(ttl) => now_nanos().saturating_add(ttl.as_nanos().min(i64::MAX as u128) as i64),
            None => NO_EXPIRY,
        };
        let info = Info {
            value,
            ttl_stamp,
            hops: 0,
            node_id: origin,
            peer_id: origin,
        };
        self.add_info(key, info)
    }

    /// Non-expired info for `key`.
    pub fn get(&self, key: &str) -> Option<&Info> {
        let now = now_nanos();
        self.infos.get(key).filter(|info| !info.expired(now))
    }

    /// Every non-expired info the peer has not seen, judged by its stamps.
    pub fn delta(&self, peer_stamps: &HighWaterStamps) -> Delta {
        let now = now_nanos();
        self.infos
            .iter()
            .filter(|(_, info)| !info.expired(now))
            .filter(|(_, info)| {
                let known = peer_stamps.get(&info.node_id).copied().unwrap_or(0);
                info.timestamp() > known
            })
            .map(|(key, info)| (key.clone(), info.clone()))
            .collect()
    }

    /// Merge a delta received from `sender`.
    ///
    /// Each info takes one more hop and records `sender` as the peer it came
    /// through. Malformed entries are skipped and reported; the rest apply.
    pub fn combine(&mut self, delta: Delta, sender: NodeId) -> CombineOutcome {
        let mut outcome = CombineOutcome::default();
        for (key, mut info) in delta {
            info.hops = info.hops.saturating_add(1);
            info.peer_id = sender;
            match self.add_info(&key, info) {
                Ok(()) => outcome.fresh += 1,
                Err(e) if e.is_stale() => outcome.stale += 1,
                Err(e) => {
                    outcome.invalid += 1;
                    if outcome.first_error.is_none() {
                        outcome.first_error = Some(e);
                    }
                }
            }
        }
        outcome
    }

    /// Snapshot of the per-origin high-water stamps.
    pub fn high_water_stamps(&self) -> HighWaterStamps {
        self.high_water_stamps
            .iter()
            .map(|(node_id, stamp)| (*node_id, *stamp))
            .collect()
    }

    /// Drop expired infos. High-water stamps are left alone.
    pub fn purge_expired(&mut self) -> usize {
        let now = now_nanos();
        let before = self.infos.len();
        self.infos.retain(|_, info| !info.expired(now));
        let purged = before - self.infos.len();
        if purged > 0 {
            debug!("node {}: purged {} expired infos", self.node_id, purged);
        }
        purged
    }

    /// Number of stored infos, expired ones included until purged
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Address published by `node_id`, if known and decodable.
    pub fn node_address(&self, node_id: NodeId) -> Option<NodeAddr> {
        self.get(&node_key(node_id))
            .and_then(|info| decode_node_addr(&info.value.raw_bytes).ok())
    }

    /// All known node addresses other than our own, ordered by node ID.
    pub fn node_addresses(&self) -> Vec<(NodeId, NodeAddr)> {
        let now = now_nanos();
        let mut nodes: Vec<(NodeId, NodeAddr)> = self
            .infos
            .iter()
            .filter(|(_, info)| !info.expired(now))
            .filter_map(|(key, info)| {
                let node_id = node_id_from_key(key)?;
                if node_id == self.node_id {
                    return None;
                }
                let addr = decode_node_addr(&info.value.raw_bytes).ok()?;
                Some((node_id, addr))
            })
            .collect();
        nodes.sort();
        nodes
    }

    /// Origin node whose infos travelled the most hops to reach us.
    pub fn most_distant(&self) -> Option<(NodeId, u32)> {
        let now = now_nanos();
        let mut distant: Option<(NodeId, u32)> = None;
        for info in self.infos.values() {
            if info.node_id == self.node_id || info.expired(now) {
                continue;
            }
            if distant.map_or(true, |(_, hops)| info.hops > hops) {
                distant = Some((info.node_id, info.hops));
            }
        }
        distant
    }

    /// Outgoing peer that delivered the fewest infos we currently hold.
    ///
    /// Ties go to the higher node ID.
    pub fn least_useful(&self, outgoing: &[NodeId]) -> Option<NodeId> {
        let mut counts: HashMap<NodeId, usize> = outgoing.iter().map(|id| (*id, 0)).collect();
        for info in self.infos.values() {
            if let Some(count) = counts.get_mut(&info.peer_id) {
                *count += 1;
            }
        }
        counts
            .into_iter()
            .min_by(|(a_id, a), (b_id, b)| a.cmp(b).then(b_id.cmp(a_id)))
            .map(|(node_id, _)| node_id)
    }

    /// Shared insertion rule for local puts and merged infos.
    fn add_info(&mut self, key: &str, info: Info) -> Result<()> {
        validate(key, &info)?;

        let now = now_nanos();
        if info.expired(now) {
            return Err(Error::Expired { key: key.to_string() });
        }
        if let Some(existing) = self.infos.get(key) {
            if !existing.expired(now) && !supersedes(&info, existing) {
                return Err(Error::NotFresh {
                    key: key.to_string(),
                    timestamp: info.timestamp(),
                    existing: existing.timestamp(),
                });
            }
        }

        let stamp = self.high_water_stamps.entry(info.node_id).or_insert(0);
        if *stamp < info.timestamp() {
            *stamp = info.timestamp();
        }

        let value = info.value.clone();
        self.infos.insert(key.to_string(), info);
        self.callbacks.notify(key, &value);
        Ok(())
    }
}

/// Newer timestamp wins; on a tie the copy that took fewer hops wins.
fn supersedes(incoming: &Info, existing: &Info) -> bool {
    incoming.timestamp() > existing.timestamp()
        || (incoming.timestamp() == existing.timestamp() && incoming.hops < existing.hops)
}

fn validate(key: &str, info: &Info) -> Result<()> {
    let reason = if key.is_empty() {
        "empty key"
    } else if info.timestamp() <= 0 {
        "non-positive timestamp"
    } else if info.node_id.is_unknown() {
        "unknown origin node"
    } else if !info.value.verify(key) {
        "checksum mismatch"
    } else {
        return Ok(());
    };
    Err(Error::InvalidInfo {
        key: key.to_string(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::encode_node_addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const A: NodeId = NodeId(1);
    const B: NodeId = NodeId(2);

    fn store(node_id: NodeId) -> InfoStore {
        InfoStore::new(node_id, NodeAddr::tcp(format!("127.0.0.1:{}", 7000 + node_id.0)))
    }

    fn value(key: &str, bytes: &[u8], timestamp: i64) -> Value {
        Value::new(key, bytes.to_vec(), timestamp)
    }

    #[test]
    fn test_final_put_wins() {
        let mut is = store(A);
        for ts in 1..=10 {
            is.put("k1", value("k1", format!("v{ts}").as_bytes(), ts), A, None)
                .unwrap();
            is.put("k2", value("k2", format!("w{ts}").as_bytes(), ts + 100), A, None)
                .unwrap();
        }

        assert_eq!(is.len(), 2);
        assert_eq!(is.get("k1").unwrap().value.raw_bytes, b"v10");
        assert_eq!(is.get("k2").unwrap().value.raw_bytes, b"w10");
        assert_eq!(is.high_water_stamps().get(&A), Some(&110));
    }

    #[test]
    fn test_stale_put_rejected() {
        let mut is = store(A);
        is.put("k1", value("k1", b"five", 5), A, None).unwrap();

        let err = is.put("k1", value("k1", b"four", 4), A, None).unwrap_err();
        assert!(err.is_stale());
        assert!(matches!(err, Error::NotFresh { timestamp: 4, existing: 5, .. }));

        assert_eq!(is.get("k1").unwrap().value.raw_bytes, b"five");
        assert_eq!(is.high_water_stamps().get(&A), Some(&5));

        // Equal timestamp and hops is stale too
        assert!(is.put("k1", value("k1", b"again", 5), A, None).is_err());
    }

    #[test]
    fn test_delta_against_peer_stamps() {
        let mut a = store(A);
        let mut b = store(B);
        a.put("k1", value("k1", b"v5", 5), A, None).unwrap();

        let mut b_stamps = HighWaterStamps::new();
        b_stamps.insert(A, 3);
        let delta = a.delta(&b_stamps);
        assert_eq!(delta.len(), 1);
        assert_eq!(delta["k1"].value.timestamp, 5);

        let outcome = b.combine(delta, A);
        assert_eq!(outcome.fresh, 1);
        assert!(outcome.first_error.is_none());
        assert_eq!(b.high_water_stamps().get(&A), Some(&5));

        let info = b.get("k1").unwrap();
        assert_eq!(info.value.raw_bytes, b"v5");
        assert_eq!(info.hops, 1);
        assert_eq!(info.peer_id, A);

        // Caught-up peer gets nothing
        assert!(a.delta(&b.high_water_stamps()).is_empty());
    }

    #[test]
    fn test_combine_idempotent() {
        let mut a = store(A);
        a.add_local("x", b"1".to_vec(), None).unwrap();
        a.add_local("y", b"2".to_vec(), None).unwrap();
        let delta = a.delta(&HighWaterStamps::new());

        let mut b = store(B);
        let first = b.combine(delta.clone(), A);
        let snapshot: Vec<_> = ["x", "y"].iter().map(|k| b.get(k).cloned()).collect();
        let second = b.combine(delta, A);

        assert_eq!(first.fresh, 2);
        assert_eq!(second.fresh, 0);
        assert_eq!(second.stale, 2);
        let after: Vec<_> = ["x", "y"].iter().map(|k| b.get(k).cloned()).collect();
        assert_eq!(snapshot, after);
    }

    #[test]
    fn test_exchange_converges() {
        let mut a = store(A);
        let mut b = store(B);
        a.add_local("a1", b"1".to_vec(), None).unwrap();
        a.add_local("shared", b"from-a".to_vec(), None).unwrap();
        b.add_local("b1", b"1".to_vec(), None).unwrap();
        b.add_local("shared", b"from-b".to_vec(), None).unwrap();

        for _ in 0..3 {
            let to_b = a.delta(&b.high_water_stamps());
            b.combine(to_b, A);
            let to_a = b.delta(&a.high_water_stamps());
            a.combine(to_a, B);
        }

        assert!(a.delta(&b.high_water_stamps()).is_empty());
        assert!(b.delta(&a.high_water_stamps()).is_empty());
        for key in ["a1", "b1", "shared"] {
            assert_eq!(
                a.get(key).map(|i| &i.value),
                b.get(key).map(|i| &i.value),
                "diverged on {key}"
            );
        }
        // B wrote "shared" last
        assert_eq!(a.get("shared").unwrap().value.raw_bytes, b"from-b");
    }

    #[test]
    fn test_combine_partial_failure() {
        let mut a = store(A);
        a.put("good", value("good", b"ok", 7), A, None).unwrap();
        let mut delta = a.delta(&HighWaterStamps::new());

        let mut corrupt = delta["good"].clone();
        corrupt.value.raw_bytes = b"tampered".to_vec();
        delta.insert("bad".into(), corrupt);

        let mut orphan = delta["good"].clone();
        orphan.node_id = NodeId::UNKNOWN;
        delta.insert("orphan".into(), orphan);

        let mut b = store(B);
        let outcome = b.combine(delta, A);
        assert_eq!(outcome.fresh, 1);
        assert_eq!(outcome.invalid, 2);
        assert!(matches!(outcome.first_error, Some(Error::InvalidInfo { .. })));
        assert!(b.get("good").is_some());
        assert!(b.get("bad").is_none());
        assert!(b.get("orphan").is_none());
    }

    #[test]
    fn test_tie_prefers_fewer_hops() {
        let mut b = store(B);
        let v = value("k", b"v", 9);
        let far = Info {
            value: v.clone(),
            ttl_stamp: NO_EXPIRY,
            hops: 4,
            node_id: A,
            peer_id: NodeId(5),
        };
        let mut delta = Delta::new();
        delta.insert("k".into(), far);
        assert_eq!(b.combine(delta, NodeId(5)).fresh, 1);
        assert_eq!(b.get("k").unwrap().hops, 5);

        let near = Info {
            value: v,
            ttl_stamp: NO_EXPIRY,
            hops: 0,
            node_id: A,
            peer_id: A,
        };
        let mut delta = Delta::new();
        delta.insert("k".into(), near);
        assert_eq!(b.combine(delta, A).fresh, 1);
        assert_eq!(b.get("k").unwrap().hops, 1);
        assert_eq!(b.get("k").unwrap().peer_id, A);
    }

    #[test]
    fn test_expired_key_accepts_older_put() {
        let mut is = store(A);
        let err = is
            .put("lease", value("lease", b"dead", 60), A, Some(Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, Error::Expired { .. }));
        assert!(is.get("lease").is_none());

        is.put("lease", value("lease", b"old", 50), A, Some(Duration::from_millis(1)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(is.get("lease").is_none());
        assert!(is.delta(&HighWaterStamps::new()).is_empty());

        // Expired entry is treated as absent
        is.put("lease", value("lease", b"renewed", 10), A, None).unwrap();
        assert_eq!(is.get("lease").unwrap().value.raw_bytes, b"renewed");
        // Stamp never moves backwards
        assert_eq!(is.high_water_stamps().get(&A), Some(&50));
    }

    #[test]
    fn test_purge_expired() {
        let mut is = store(A);
        is.put("short", value("short", b"v", 3), A, Some(Duration::from_millis(1)))
            .unwrap();
        is.put("long", value("long", b"v", 4), A, None).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(is.purge_expired(), 1);
        assert_eq!(is.len(), 1);
        assert_eq!(is.high_water_stamps().get(&A), Some(&4));
    }

    #[test]
    fn test_local_timestamps_increase() {
        let mut is = store(A);
        is.put("k", value("k", b"v", i64::MAX - 10), A, None).unwrap();
        let first = is.next_timestamp();
        let second = is.next_timestamp();
        assert!(first > i64::MAX - 10);
        assert!(second > first);
    }

    #[test]
    fn test_callbacks_fire_on_accepted_writes_only() {
        let mut is = store(A);
        let count = Arc::new(AtomicUsize::new(0));
        let handle = count.clone();
        let sub = is
            .register_callback("^k", move |_, _| {
                handle.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        is.put("k1", value("k1", b"v", 5), A, None).unwrap();
        is.put("k1", value("k1", b"v", 4), A, None).unwrap_err();
        is.put("other", value("other", b"v", 6), A, None).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sub.unregister();
        assert!(is.callbacks().is_empty());
    }

    #[test]
    fn test_node_addresses_and_distance() {
        let mut is = store(A);
        is.add_local(&node_key(A), encode_node_addr(is.node_addr()).unwrap(), None)
            .unwrap();

        let mut delta = Delta::new();
        for (id, hops) in [(2, 0), (3, 2), (4, 5)] {
            let key = node_key(NodeId(id));
            let addr = NodeAddr::tcp(format!("10.0.0.{id}:26257"));
            let info = Info {
                value: Value::new(&key, encode_node_addr(&addr).unwrap(), 10),
                ttl_stamp: NO_EXPIRY,
                hops,
                node_id: NodeId(id),
                peer_id: NodeId(id),
            };
            delta.insert(key, info);
        }
        assert_eq!(is.combine(delta, B).fresh, 3);

        let nodes = is.node_addresses();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].0, NodeId(2));
        assert_eq!(is.node_address(NodeId(3)), Some(NodeAddr::tcp("10.0.0.3:26257")));
        assert_eq!(is.node_address(NodeId(9)), None);
        assert_eq!(is.most_distant(), Some((NodeId(4), 6)));
    }

    #[test]
    fn test_least_useful() {
        let mut is = store(A);
        let mut via_b = Delta::new();
        let mut via_c = Delta::new();
        for i in 0..3 {
            let key = format!("b{i}");
            via_b.insert(
                key.clone(),
                Info {
                    value: Value::new(&key, vec![], 10 + i),
                    ttl_stamp: NO_EXPIRY,
                    hops: 0,
                    node_id: B,
                    peer_id: B,
                },
            );
        }
        via_c.insert(
            "c0".into(),
            Info {
                value: Value::new("c0", vec![], 10),
                ttl_stamp: NO_EXPIRY,
                hops: 0,
                node_id: NodeId(3),
                peer_id: NodeId(3),
            },
        );
        is.combine(via_b, B);
        is.combine(via_c, NodeId(3));

        assert_eq!(is.least_useful(&[B, NodeId(3)]), Some(NodeId(3)));
        // Peer that delivered nothing loses; ties go to the higher ID
        assert_eq!(is.least_useful(&[B, NodeId(3), NodeId(8), NodeId(9)]), Some(NodeId(9)));
        assert_eq!(is.least_useful(&[]), None);
    }
}
