//! Fan-out of received units to every other peer on the same stream

use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::protocol::StreamKind;
use crate::relay::queue::EnqueueOutcome;
use crate::relay::registry::{PeerKey, PeerRegistry};
use crate::relay::RelayStats;

/// Outcome of forwarding one unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForwardReport {
    pub targets: usize,
    pub queued: usize,
    pub dropped: usize,
    pub closed: usize,
}

/// Broadcast relay
///
/// Forwarding never blocks: each target's queue either accepts the unit or
/// drops it. Units are shared by reference count, not copied per target.
pub struct BroadcastRelay {
    registry: Arc<PeerRegistry>,
    stats: Arc<RelayStats>,
}

impl BroadcastRelay {
    pub fn new(registry: Arc<PeerRegistry>, stats: Arc<RelayStats>) -> Self {
        Self { registry, stats }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Forward `unit` from `sender` to every other peer holding a `kind` link
    pub fn forward(&self, sender: &PeerKey, kind: StreamKind, unit: Bytes) -> ForwardReport {
        let targets = self.registry.targets(kind, sender);
        let mut report = ForwardReport {
            targets: targets.len(),
            ..Default::default()
        };

        for (key, queue) in targets {
            match queue.try_enqueue(unit.clone()) {
                EnqueueOutcome::Queued => report.queued += 1,
                EnqueueOutcome::Dropped => {
                    report.dropped += 1;
                    tracing::warn!(peer = %key, stream = %kind, "Outbound queue full, dropping unit");
                }
                EnqueueOutcome::Closed => {
                    report.closed += 1;
                    if self.registry.release(&key, kind, queue.link_id()).is_some() {
                        tracing::debug!(peer = %key, stream = %kind, "Released closed link");
                    }
                }
            }
        }

        self.stats
            .units_forwarded
            .fetch_add(report.queued as u64, Ordering::Relaxed);
        self.stats
            .units_dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        report
    }
}
