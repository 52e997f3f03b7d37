//! Relay server: peer registry, fan-out and per-peer outbound queues

pub mod broadcast;
pub mod queue;
pub mod registry;
pub mod server;

pub use broadcast::{BroadcastRelay, ForwardReport};
pub use queue::{EnqueueOutcome, LinkSink, Outbound, StreamQueue};
pub use registry::{PeerKey, PeerRegistry, PeerState, PeerSummary};
pub use server::RelayServer;

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Relay-wide counters, updated lock-free from every task
#[derive(Debug, Default)]
pub struct RelayStats {
    pub datagrams_received: AtomicU64,
    pub stream_frames_received: AtomicU64,
    pub malformed: AtomicU64,
    pub units_forwarded: AtomicU64,
    pub units_dropped: AtomicU64,
    pub units_sent: AtomicU64,
    pub peers_evicted: AtomicU64,
}

/// Plain copy of [`RelayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStatsSnapshot {
    pub datagrams_received: u64,
    pub stream_frames_received: u64,
    pub malformed: u64,
    pub units_forwarded: u64,
    pub units_dropped: u64,
    pub units_sent: u64,
    pub peers_evicted: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            stream_frames_received: self.stream_frames_received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            units_forwarded: self.units_forwarded.load(Ordering::Relaxed),
            units_dropped: self.units_dropped.load(Ordering::Relaxed),
            units_sent: self.units_sent.load(Ordering::Relaxed),
            peers_evicted: self.peers_evicted.load(Ordering::Relaxed),
        }
    }

    /// Fraction of fan-out units lost to full queues
    pub fn drop_rate(&self) -> f32 {
        let snapshot = self.snapshot();
        let total = snapshot.units_forwarded + snapshot.units_dropped;
        if total == 0 {
            0.0
        } else {
            snapshot.units_dropped as f32 / total as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = RelayStats::default();
        stats.units_forwarded.fetch_add(3, Ordering::Relaxed);
        stats.units_dropped.fetch_add(1, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.units_forwarded, 3);
        assert_eq!(snapshot.units_dropped, 1);
        assert!((stats.drop_rate() - 0.25).abs() < f32::EPSILON);
    }
}
