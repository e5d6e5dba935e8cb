//! Gossip traffic counters
//!
//! Each peer client keeps its own [`Metrics`]; the node keeps one more that
//! every client and inbound connection adds to. Counters only grow.

use std::sync::atomic::{AtomicU64, Ordering};

/// Byte and info counters for one connection or one node
#[derive(Debug, Default)]
pub struct Metrics {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    infos_received: AtomicU64,
    infos_sent: AtomicU64,
}

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub infos_received: u64,
    pub infos_sent: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize, infos: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.infos_sent.fetch_add(infos as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize, infos: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.infos_received.fetch_add(infos as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            infos_received: self.infos_received.load(Ordering::Relaxed),
            infos_sent: self.infos_sent.load(Ordering::Relaxed),
        }
    }
}
