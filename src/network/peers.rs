//! Relay peer tracking
//!
//! Peers are discovered from incoming datagrams; there is no join handshake.
//! Broadcasts iterate a snapshot so concurrent discovery never disturbs them.

use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Remote endpoint of a relay session, compared by value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress(SocketAddr);

impl PeerAddress {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Concurrent set of known peers with their last-seen time
pub struct PeerSet {
    peers: DashMap<PeerAddress, Instant>,
    idle_timeout: Option<Duration>,
}

impl PeerSet {
    /// Peers are kept for the life of the set
    pub fn new() -> Self {
        Self::with_idle_timeout(None)
    }

    /// Peers silent for longer than `idle_timeout` are dropped by
    /// [`PeerSet::evict_idle`]
    pub fn with_idle_timeout(idle_timeout: Option<Duration>) -> Self {
        Self {
            peers: DashMap::new(),
            idle_timeout,
        }
    }

    /// Record traffic from `peer`. Returns true the first time it is seen.
    pub fn observe(&self, peer: PeerAddress) -> bool {
        self.observe_at(peer, Instant::now())
    }

    pub fn observe_at(&self, peer: PeerAddress, now: Instant) -> bool {
        self.peers.insert(peer, now).is_none()
    }

    pub fn contains(&self, peer: &PeerAddress) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Copy of the current membership, safe to iterate while others insert
    pub fn snapshot(&self) -> Vec<PeerAddress> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Drop peers idle past the timeout. No-op without a timeout.
    pub fn evict_idle(&self) -> Vec<PeerAddress> {
        self.evict_idle_at(Instant::now())
    }

    pub fn evict_idle_at(&self, now: Instant) -> Vec<PeerAddress> {
        let Some(timeout) = self.idle_timeout else {
            return Vec::new();
        };

        let mut evicted = Vec::new();
        self.peers.retain(|peer, last_seen| {
            let keep = now.saturating_duration_since(*last_seen) <= timeout;
            if !keep {
                evicted.push(*peer);
            }
            keep
        });
        evicted
    }
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new()
    }
}
