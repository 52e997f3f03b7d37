//! Frame reassembly from datagram fragments
//!
//! One reassembly set per sender. At most one sequence is in flight per
//! sender: a fragment bearing a newer sequence discards whatever partial
//! frame was being built, so chunks of different frames never mix.
//!
//! Sequences are compared modulo 256. A fragment whose sequence lies in the
//! half window behind the current one is late and dropped, so a discarded or
//! already delivered frame can never complete again. A sender that restarts
//! its counter is accepted again once its idle state has been purged.

use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::protocol::{Fragment, MediaFlags};

/// A complete frame ready for the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledFrame {
    pub sender_id: String,
    pub sequence: u8,
    pub flags: MediaFlags,
    pub payload: Bytes,
}

/// Partial state for one sender
#[derive(Debug)]
struct ReassemblySet {
    sequence: u8,
    expected_total: u8,
    chunks: BTreeMap<u8, Bytes>,
    flags: MediaFlags,
    started_at: Instant,
    updated_at: Instant,
    /// Set once the frame has been handed out; later duplicates are ignored
    delivered: bool,
}

impl ReassemblySet {
    fn new(fragment: &Fragment, now: Instant) -> Self {
        Self {
            sequence: fragment.sequence,
            expected_total: fragment.total,
            chunks: BTreeMap::new(),
            flags: fragment.flags,
            started_at: now,
            updated_at: now,
            delivered: false,
        }
    }

    fn assemble(&mut self) -> Bytes {
        let chunks = std::mem::take(&mut self.chunks);
        if chunks.len() == 1 {
            if let Some((_, only)) = chunks.into_iter().next() {
                return only;
            }
            return Bytes::new();
        }

        let len = chunks.values().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(len);
        for chunk in chunks.values() {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }
}

/// Per-sender frame reassembler
#[derive(Debug, Default)]
pub struct FrameReassembler {
    sets: HashMap<String, ReassemblySet>,
    stats: ReassemblyStats,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and push a raw fragment datagram. Malformed input is dropped.
    pub fn push_datagram(&mut self, data: Bytes) -> Option<ReassembledFrame> {
        match Fragment::decode(data) {
            Ok(fragment) => self.push(fragment),
            Err(e) => {
                self.stats.dropped += 1;
                tracing::trace!("Dropping malformed fragment: {}", e);
                None
            }
        }
    }

    /// Push a fragment, returning the frame it completes
    pub fn push(&mut self, fragment: Fragment) -> Option<ReassembledFrame> {
        self.push_at(fragment, Instant::now())
    }

    /// [`push`](Self::push) with an explicit clock
    pub fn push_at(&mut self, fragment: Fragment, now: Instant) -> Option<ReassembledFrame> {
        if fragment.total == 0 || fragment.index >= fragment.total {
            self.stats.dropped += 1;
            return None;
        }

        let set = self
            .sets
            .entry(fragment.sender_id.clone())
            .or_insert_with(|| ReassemblySet::new(&fragment, now));

        if set.sequence == fragment.sequence {
            if set.delivered {
                // duplicate of a frame already handed out
                return None;
            }
        } else {
            if is_behind(fragment.sequence, set.sequence) {
                // late chunk of a frame that was discarded or delivered
                self.stats.dropped += 1;
                return None;
            }

            if !set.delivered {
                self.stats.discarded += 1;
                tracing::trace!(
                    sender = %fragment.sender_id,
                    old = set.sequence,
                    new = fragment.sequence,
                    received = set.chunks.len(),
                    total = set.expected_total,
                    "Discarding incomplete frame"
                );
            }
            *set = ReassemblySet::new(&fragment, now);
        }

        if fragment.total != set.expected_total {
            self.stats.dropped += 1;
            return None;
        }

        if let Some(existing) = set.chunks.get(&fragment.index) {
            if existing.len() != fragment.payload.len() {
                self.stats.dropped += 1;
                return None;
            }
        }

        set.chunks.insert(fragment.index, fragment.payload);
        set.flags = fragment.flags;
        set.updated_at = now;

        if set.chunks.len() < set.expected_total as usize {
            return None;
        }

        let payload = set.assemble();
        set.delivered = true;
        self.stats.completed += 1;

        tracing::trace!(
            sender = %fragment.sender_id,
            sequence = set.sequence,
            bytes = payload.len(),
            elapsed_us = now.duration_since(set.started_at).as_micros() as u64,
            "Frame reassembled"
        );

        Some(ReassembledFrame {
            sender_id: fragment.sender_id,
            sequence: set.sequence,
            flags: set.flags,
            payload,
        })
    }

    /// Drop all state for one sender
    pub fn forget(&mut self, sender_id: &str) {
        self.sets.remove(sender_id);
    }

    /// Remove senders whose last fragment is older than `max_age`.
    ///
    /// Returns the number of senders removed.
    pub fn purge_older_than(&mut self, max_age: Duration, now: Instant) -> usize {
        let before = self.sets.len();
        self.sets
            .retain(|_, set| now.saturating_duration_since(set.updated_at) <= max_age);
        before - self.sets.len()
    }

    /// Number of senders with a partial frame in flight
    pub fn in_flight(&self) -> usize {
        self.sets.values().filter(|set| !set.delivered).count()
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }
}

/// Whether `sequence` falls in the half window behind `current`
fn is_behind(sequence: u8, current: u8) -> bool {
    (sequence.wrapping_sub(current) as i8) < 0
}

/// Reassembly counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    /// Frames handed to the decoder
    pub completed: u64,
    /// Incomplete frames thrown away for a newer sequence
    pub discarded: u64,
    /// Fragments rejected as malformed, inconsistent or stale
    pub dropped: u64,
}
