//! Peer registry and liveness tracking
//!
//! The registry is the only state shared between relay tasks. Every access
//! takes one short-lived lock around the map operation; socket calls and queue
//! closes happen after the lock is released.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::StreamKind;
use crate::relay::queue::StreamQueue;

/// Identity of a peer in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeerKey {
    /// Id issued by the stream handshake
    Client(Uuid),
    /// Remote IP of a stream peer without handshake
    Host(IpAddr),
    /// Source address of a datagram peer
    Datagram(SocketAddr),
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerKey::Client(id) => write!(f, "{}", id),
            PeerKey::Host(ip) => write!(f, "{}", ip),
            PeerKey::Datagram(addr) => write!(f, "{}", addr),
        }
    }
}

/// Lifecycle of a registered peer.
///
/// A peer that is not in the registry is unregistered (never seen) or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Active,
    /// Silent past the TTL with no reliable stream open; evicted by the next sweep
    Stale,
    Removed,
}

/// A registered peer
#[derive(Debug)]
pub struct Peer {
    pub key: PeerKey,
    /// Last username the peer announced
    pub user: Option<String>,
    links: HashMap<StreamKind, StreamQueue>,
    pub last_seen: Instant,
    pub connected_at: DateTime<Utc>,
}

impl Peer {
    fn new(key: PeerKey, now: Instant) -> Self {
        Self {
            key,
            user: None,
            links: HashMap::new(),
            last_seen: now,
            connected_at: Utc::now(),
        }
    }

    fn has_reliable_link(&self) -> bool {
        self.links.keys().any(StreamKind::is_reliable)
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > ttl
    }

    pub fn state(&self, now: Instant, ttl: Duration) -> PeerState {
        if self.is_expired(now, ttl) && !self.has_reliable_link() {
            PeerState::Stale
        } else {
            PeerState::Active
        }
    }

    pub fn kinds(&self) -> Vec<StreamKind> {
        let mut kinds: Vec<StreamKind> = self.links.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

/// Result of releasing one link
#[derive(Debug)]
pub struct Released {
    pub queue: StreamQueue,
    /// The peer had no links left and was removed
    pub peer_removed: bool,
}

/// Result of a liveness sweep
#[derive(Debug, Default)]
pub struct Sweep {
    /// Peers removed from the registry
    pub removed: Vec<PeerKey>,
    /// Links taken out of the registry; the caller closes them
    pub closed: Vec<StreamQueue>,
}

/// Read-only view of a peer for the status API
#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub key: String,
    pub user: Option<String>,
    pub kinds: Vec<StreamKind>,
    pub state: PeerState,
    pub idle_ms: u64,
    pub connected_at: DateTime<Utc>,
}

/// Registry of peers known to the relay
pub struct PeerRegistry {
    peers: Mutex<HashMap<PeerKey, Peer>>,
    ttl: Duration,
    next_link_id: AtomicU64,
}

impl PeerRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            ttl,
            next_link_id: AtomicU64::new(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Allocate an id for a new link
    pub fn next_link_id(&self) -> u64 {
        self.next_link_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Refresh a peer's activity timestamp and username.
    ///
    /// Returns whether the peer already has a link of `kind`; when it does not
    /// the caller is expected to [`attach`](Self::attach) one.
    pub fn touch(&self, key: &PeerKey, kind: StreamKind, user: Option<&str>, now: Instant) -> bool {
        let mut peers = self.peers.lock();
        match peers.get_mut(key) {
            Some(peer) => {
                peer.last_seen = now;
                if let Some(user) = user {
                    if peer.user.as_deref() != Some(user) {
                        peer.user = Some(user.to_string());
                    }
                }
                peer.links.contains_key(&kind)
            }
            None => false,
        }
    }

    /// Attach a link, registering the peer on first contact.
    ///
    /// Returns the link it replaced, which the caller must close.
    pub fn attach(
        &self,
        key: PeerKey,
        queue: StreamQueue,
        user: Option<&str>,
        now: Instant,
    ) -> Option<StreamQueue> {
        let mut peers = self.peers.lock();
        let peer = peers.entry(key).or_insert_with(|| {
            tracing::info!(peer = %key, "Peer registered");
            Peer::new(key, now)
        });

        peer.last_seen = now;
        if let Some(user) = user {
            peer.user = Some(user.to_string());
        }
        peer.links.insert(queue.kind(), queue)
    }

    /// Release one link if it is still the current one for `(key, kind)`.
    ///
    /// A peer left with no links is removed. Releasing a link that has been
    /// replaced or already released is a no-op.
    pub fn release(&self, key: &PeerKey, kind: StreamKind, link_id: u64) -> Option<Released> {
        let mut peers = self.peers.lock();
        let peer = peers.get_mut(key)?;
        if peer.links.get(&kind).map(StreamQueue::link_id) != Some(link_id) {
            return None;
        }

        let queue = peer.links.remove(&kind)?;
        let peer_removed = peer.links.is_empty();
        if peer_removed {
            peers.remove(key);
        }
        Some(Released { queue, peer_removed })
    }

    /// Links of every peer on `kind` except the sender
    pub fn targets(&self, kind: StreamKind, sender: &PeerKey) -> Vec<(PeerKey, StreamQueue)> {
        self.peers
            .lock()
            .values()
            .filter(|peer| peer.key != *sender)
            .filter_map(|peer| peer.links.get(&kind).map(|queue| (peer.key, queue.clone())))
            .collect()
    }

    /// Evict peers silent for longer than the TTL.
    ///
    /// Silence says nothing about a reliable stream, which reports its own
    /// close; such a peer only loses its datagram link.
    pub fn sweep(&self, now: Instant) -> Sweep {
        let mut sweep = Sweep::default();
        let mut peers = self.peers.lock();

        peers.retain(|key, peer| {
            if !peer.is_expired(now, self.ttl) {
                return true;
            }

            if let Some(queue) = peer.links.remove(&StreamKind::Datagram) {
                sweep.closed.push(queue);
            }
            if peer.has_reliable_link() {
                return true;
            }

            sweep.closed.extend(peer.links.drain().map(|(_, queue)| queue));
            sweep.removed.push(*key);
            false
        });

        sweep
    }

    /// Lifecycle state of a peer
    pub fn state(&self, key: &PeerKey, now: Instant) -> PeerState {
        self.peers
            .lock()
            .get(key)
            .map(|peer| peer.state(now, self.ttl))
            .unwrap_or(PeerState::Removed)
    }

    pub fn contains(&self, key: &PeerKey) -> bool {
        self.peers.lock().contains_key(key)
    }

    pub fn has_link(&self, key: &PeerKey, kind: StreamKind) -> bool {
        self.peers
            .lock()
            .get(key)
            .map_or(false, |peer| peer.links.contains_key(&kind))
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Distinct announced usernames.
    ///
    /// A handshake client holds two entries, its stream identity and its
    /// datagram address, under one username. Entries that never announced a
    /// username count once each.
    pub fn user_count(&self) -> usize {
        let peers = self.peers.lock();
        let mut users = HashSet::new();
        let mut anonymous = 0;
        for peer in peers.values() {
            match &peer.user {
                Some(user) => {
                    users.insert(user.as_str());
                }
                None => anonymous += 1,
            }
        }
        users.len() + anonymous
    }

    /// Summaries of all peers, oldest first
    pub fn snapshot(&self, now: Instant) -> Vec<PeerSummary> {
        let mut summaries: Vec<PeerSummary> = self
            .peers
            .lock()
            .values()
            .map(|peer| PeerSummary {
                key: peer.key.to_string(),
                user: peer.user.clone(),
                kinds: peer.kinds(),
                state: peer.state(now, self.ttl),
                idle_ms: now.saturating_duration_since(peer.last_seen).as_millis() as u64,
                connected_at: peer.connected_at,
            })
            .collect();
        summaries.sort_by_key(|s| s.connected_at);
        summaries
    }

    /// Remove every peer, returning all links for closing
    pub fn drain(&self) -> Vec<StreamQueue> {
        self.peers
            .lock()
            .drain()
            .flat_map(|(_, peer)| peer.links.into_values())
            .collect()
    }
}
