// Peer Registry - Track known peers and their reachability
//
// The registry is the single owner of peer records. Other components hold
// peer ids and ask the registry for snapshots or state transitions.
// Peers that stay unreachable past a TTL move to a bounded cold set;
// when the active set is full, new discovery is rejected (degraded mode).

use super::BackoffPolicy;
use crate::identity::NodeId;
use crate::transport::{PeerAddress, TransportKind};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Peer-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("Cannot add self as a peer")]
    CannotAddSelf,

    #[error("Peer not found")]
    PeerNotFound,

    #[error("Peer registry full ({max} peers); new discovery rejected")]
    RegistryFull { max: usize },

    #[error("Invalid transition for peer {peer}: {from} -> {to}")]
    InvalidTransition {
        peer: NodeId,
        from: PeerState,
        to: PeerState,
    },
}

/// Reachability of a peer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerState {
    /// Known, never connected (or rediscovered)
    Discovered,
    /// Outbound attempt in progress
    Connecting,
    /// Session established
    Connected,
    /// Last attempt or session failed; retried under backoff
    Unreachable,
}

impl PeerState {
    /// Check if transition to the target state is valid
    pub fn can_transition_to(&self, target: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, target),
            (Discovered, Connecting)
                | (Discovered, Connected)
                | (Discovered, Unreachable)
                | (Connecting, Connected)
                | (Connecting, Unreachable)
                | (Connected, Unreachable)
                | (Unreachable, Connecting)
                | (Unreachable, Connected)
                | (Unreachable, Discovered)
        )
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::Discovered => "discovered",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Unreachable => "unreachable",
        };
        f.write_str(name)
    }
}

// ============================================================================
// PEER RECORDS
// ============================================================================

/// Bootstrap information about a peer, as carried by tokens and handshakes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    peer_id: NodeId,
    address: PeerAddress,
    transport_kind: TransportKind,
    shared_secret: Option<String>,
}

impl PeerInfo {
    pub fn new(peer_id: NodeId, address: PeerAddress, transport_kind: TransportKind) -> Self {
        Self {
            peer_id,
            address,
            transport_kind,
            shared_secret: None,
        }
    }

    pub fn with_shared_secret(mut self, secret: impl Into<String>) -> Self {
        self.shared_secret = Some(secret.into());
        self
    }

    pub fn peer_id(&self) -> &NodeId {
        &self.peer_id
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport_kind
    }

    pub fn shared_secret(&self) -> Option<&str> {
        self.shared_secret.as_deref()
    }
}

/// A peer as tracked by the registry
#[derive(Clone, Debug, PartialEq)]
pub struct Peer {
    info: PeerInfo,
    state: PeerState,
    /// Unix ms
    last_seen: u64,
    failed_attempts: u32,
    /// Unix ms; dialing before this is not allowed
    next_retry_at: u64,
    /// Unix ms
    unreachable_since: Option<u64>,
    rtt_samples: Vec<u32>,
}

impl Peer {
    fn discovered(info: PeerInfo, now: u64) -> Self {
        Self {
            info,
            state: PeerState::Discovered,
            last_seen: now,
            failed_attempts: 0,
            next_retry_at: now,
            unreachable_since: None,
            rtt_samples: Vec::new(),
        }
    }

    fn merge(&mut self, info: PeerInfo, now: u64) {
        let secret = info.shared_secret.or_else(|| self.info.shared_secret.take());
        self.info = PeerInfo {
            shared_secret: secret,
            ..info
        };
        self.last_seen = now;
    }

    fn apply(&mut self, to: PeerState, now: u64) {
        match to {
            PeerState::Connected => {
                self.failed_attempts = 0;
                self.unreachable_since = None;
                self.last_seen = now;
            }
            PeerState::Unreachable => {
                self.unreachable_since.get_or_insert(now);
            }
            PeerState::Discovered => {
                self.unreachable_since = None;
                self.next_retry_at = now;
            }
            PeerState::Connecting => {}
        }
        self.state = to;
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    pub fn peer_id(&self) -> &NodeId {
        &self.info.peer_id
    }

    pub fn address(&self) -> &PeerAddress {
        &self.info.address
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.info.transport_kind
    }

    pub fn shared_secret(&self) -> Option<&str> {
        self.info.shared_secret()
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Last time we heard from this peer (unix ms)
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Earliest time (unix ms) the peer may be dialed again
    pub fn next_retry_at(&self) -> u64 {
        self.next_retry_at
    }

    pub fn unreachable_since(&self) -> Option<u64> {
        self.unreachable_since
    }

    /// Get average RTT
    pub fn average_rtt(&self) -> Option<u32> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        let sum: u32 = self.rtt_samples.iter().sum();
        Some(sum / self.rtt_samples.len() as u32)
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Registry limits and timing
#[derive(Clone, Debug, PartialEq)]
pub struct RegistryConfig {
    /// Most non-cold peers tracked at once
    pub max_peers: usize,
    /// Most cold peers remembered
    pub cold_capacity: usize,
    /// Time unreachable before a peer goes cold
    pub unreachable_ttl: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_peers: 50,
            cold_capacity: 100,
            unreachable_ttl: Duration::from_secs(300),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_peers(mut self, max: usize) -> Self {
        self.max_peers = max;
        self
    }

    pub fn with_cold_capacity(mut self, capacity: usize) -> Self {
        self.cold_capacity = capacity;
        self
    }

    pub fn with_unreachable_ttl(mut self, ttl: Duration) -> Self {
        self.unreachable_ttl = ttl;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Statistics about a peer registry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PeerStats {
    pub known: usize,
    pub discovered: usize,
    pub connecting: usize,
    pub connected: usize,
    pub unreachable: usize,
    pub cold: usize,
    /// Invalid transitions that were refused
    pub inconsistencies: u64,
    /// New peers refused while full
    pub rejected: u64,
    pub degraded: bool,
}

#[derive(Default)]
struct RegistryInner {
    peers: HashMap<NodeId, Peer>,
    cold: HashMap<NodeId, Peer>,
    inconsistencies: u64,
    rejected: u64,
}

/// Thread-safe registry of known peers
pub struct PeerRegistry {
    my_node_id: NodeId,
    config: RegistryConfig,
    inner: Mutex<RegistryInner>,
}

impl PeerRegistry {
    pub fn new(my_node_id: NodeId, config: RegistryConfig) -> Self {
        Self {
            my_node_id,
            config,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn my_node_id(&self) -> &NodeId {
        &self.my_node_id
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Insert a new peer or merge into the existing record
    ///
    /// Returns the peer's state after the merge.
    pub fn upsert(&self, info: PeerInfo) -> Result<PeerState, PeerError> {
        if info.peer_id == self.my_node_id {
            return Err(PeerError::CannotAddSelf);
        }
        let now = now_ms();
        let mut guard = self.lock();
        let inner = &mut *guard;
        let peer_id = info.peer_id;

        if let Some(peer) = inner.peers.get_mut(&peer_id) {
            peer.merge(info, now);
            if peer.state == PeerState::Unreachable {
                // Fresh evidence the peer exists: retry now
                peer.next_retry_at = now;
            }
            return Ok(peer.state);
        }

        if inner.peers.len() >= self.config.max_peers {
            inner.rejected += 1;
            warn!(
                peer = %peer_id,
                max = self.config.max_peers,
                "Peer registry full, rejecting new peer (degraded)"
            );
            return Err(PeerError::RegistryFull {
                max: self.config.max_peers,
            });
        }

        let peer = match inner.cold.remove(&peer_id) {
            Some(mut cold) => {
                cold.merge(info, now);
                cold.failed_attempts = 0;
                cold.apply(PeerState::Discovered, now);
                debug!(peer = %peer_id, "Revived cold peer");
                cold
            }
            None => {
                debug!(peer = %peer_id, address = %info.address, "Discovered peer");
                Peer::discovered(info, now)
            }
        };
        inner.peers.insert(peer_id, peer);
        Ok(PeerState::Discovered)
    }

    /// Move a peer to a new state
    ///
    /// Invalid transitions leave the peer untouched and are counted.
    pub fn transition(&self, peer_id: &NodeId, to: PeerState) -> Result<(), PeerError> {
        let now = now_ms();
        let mut guard = self.lock();
        let inner = &mut *guard;
        let peer = inner.peers.get_mut(peer_id).ok_or(PeerError::PeerNotFound)?;
        let from = peer.state;

        if from == to {
            if to == PeerState::Connected {
                peer.last_seen = now;
            }
            return Ok(());
        }

        if !from.can_transition_to(to) {
            inner.inconsistencies += 1;
            warn!(peer = %peer_id, %from, %to, "Refusing invalid peer transition");
            return Err(PeerError::InvalidTransition {
                peer: *peer_id,
                from,
                to,
            });
        }

        peer.apply(to, now);
        if to == PeerState::Connected {
            info!(peer = %peer_id, address = %peer.info.address, "Peer connected");
        }
        Ok(())
    }

    /// Mark a failed attempt or dropped session and schedule the next retry
    ///
    /// Returns the backoff delay chosen.
    pub fn record_failure(&self, peer_id: &NodeId) -> Result<Duration, PeerError> {
        self.record_failure_at(peer_id, now_ms())
    }

    pub fn record_failure_at(&self, peer_id: &NodeId, now: u64) -> Result<Duration, PeerError> {
        let mut guard = self.lock();
        let peer = guard.peers.get_mut(peer_id).ok_or(PeerError::PeerNotFound)?;

        peer.failed_attempts = peer.failed_attempts.saturating_add(1);
        let delay = self.config.backoff.delay(peer.failed_attempts);
        peer.next_retry_at = now.saturating_add(delay.as_millis() as u64);
        peer.apply(PeerState::Unreachable, now);

        debug!(
            peer = %peer_id,
            attempts = peer.failed_attempts,
            retry_in_ms = delay.as_millis() as u64,
            "Peer unreachable"
        );
        Ok(delay)
    }

    /// Forget a peer, active or cold
    pub fn remove(&self, peer_id: &NodeId) -> Option<Peer> {
        let mut guard = self.lock();
        let removed = guard.peers.remove(peer_id).or_else(|| guard.cold.remove(peer_id));
        if removed.is_some() {
            info!(peer = %peer_id, "Removed peer");
        }
        removed
    }

    /// Forget a peer unless it has a session or a dial in progress
    pub fn remove_idle(&self, peer_id: &NodeId) -> bool {
        let mut guard = self.lock();
        match guard.peers.get(peer_id).map(|p| p.state) {
            Some(PeerState::Discovered | PeerState::Unreachable) => {
                guard.peers.remove(peer_id);
                debug!(peer = %peer_id, "Forgot idle peer");
                true
            }
            _ => false,
        }
    }

    /// Record a failed outbound attempt
    ///
    /// A peer that gained a session through another connection while the
    /// dial was in flight stays Connected; returns None in that case.
    pub fn record_dial_failure(&self, peer_id: &NodeId) -> Result<Option<Duration>, PeerError> {
        let now = now_ms();
        let mut guard = self.lock();
        let peer = guard.peers.get_mut(peer_id).ok_or(PeerError::PeerNotFound)?;
        if peer.state == PeerState::Connected {
            return Ok(None);
        }

        peer.failed_attempts = peer.failed_attempts.saturating_add(1);
        let delay = self.config.backoff.delay(peer.failed_attempts);
        peer.next_retry_at = now.saturating_add(delay.as_millis() as u64);
        peer.apply(PeerState::Unreachable, now);
        Ok(Some(delay))
    }

    /// Refresh last-seen after traffic from the peer
    pub fn mark_seen(&self, peer_id: &NodeId) {
        if let Some(peer) = self.lock().peers.get_mut(peer_id) {
            peer.last_seen = now_ms();
        }
    }

    /// Record a round-trip time measurement
    pub fn record_rtt(&self, peer_id: &NodeId, rtt_ms: u32) {
        if let Some(peer) = self.lock().peers.get_mut(peer_id) {
            peer.rtt_samples.push(rtt_ms);
            if peer.rtt_samples.len() > 10 {
                peer.rtt_samples.remove(0);
            }
        }
    }

    pub fn get(&self, peer_id: &NodeId) -> Option<Peer> {
        self.lock().peers.get(peer_id).cloned()
    }

    /// Connected peers
    pub fn list_active(&self) -> Vec<Peer> {
        self.list_where(|p| p.state == PeerState::Connected)
    }

    /// Every non-cold peer
    pub fn list_known(&self) -> Vec<Peer> {
        self.list_where(|_| true)
    }

    fn list_where(&self, filter: impl Fn(&Peer) -> bool) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.lock().peers.values().filter(|p| filter(p)).cloned().collect();
        peers.sort_by(|a, b| a.peer_id().cmp(b.peer_id()));
        peers
    }

    pub fn cold_peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.lock().cold.values().cloned().collect();
        peers.sort_by(|a, b| a.peer_id().cmp(b.peer_id()));
        peers
    }

    /// Peers whose retry time has come, soonest first
    pub fn due_for_dial(&self, now: u64) -> Vec<Peer> {
        let mut due: Vec<Peer> = self
            .lock()
            .peers
            .values()
            .filter(|p| matches!(p.state, PeerState::Discovered | PeerState::Unreachable))
            .filter(|p| p.next_retry_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|p| (p.next_retry_at, *p.peer_id()));
        due
    }

    /// Move long-unreachable peers to the cold set; returns how many moved
    pub fn evict_expired(&self, now: u64) -> usize {
        let ttl = self.config.unreachable_ttl.as_millis() as u64;
        let mut guard = self.lock();
        let inner = &mut *guard;

        let expired: Vec<NodeId> = inner
            .peers
            .values()
            .filter(|p| p.state == PeerState::Unreachable)
            .filter(|p| p.unreachable_since.is_some_and(|since| now.saturating_sub(since) >= ttl))
            .map(|p| *p.peer_id())
            .collect();

        for id in &expired {
            if let Some(peer) = inner.peers.remove(id) {
                inner.cold.insert(*id, peer);
            }
        }

        while inner.cold.len() > self.config.cold_capacity {
            let oldest = inner
                .cold
                .values()
                .min_by_key(|p| (p.last_seen, *p.peer_id()))
                .map(|p| *p.peer_id());
            match oldest {
                Some(id) => {
                    inner.cold.remove(&id);
                }
                None => break,
            }
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), cold = inner.cold.len(), "Moved expired peers to cold set");
        }
        expired.len()
    }

    /// Random sample of peers worth sharing with `requester`
    pub fn sample_for_exchange(&self, requester: &NodeId, limit: usize) -> Vec<PeerInfo> {
        let mut infos: Vec<PeerInfo> = self
            .lock()
            .peers
            .values()
            .filter(|p| p.peer_id() != requester)
            .filter(|p| matches!(p.state, PeerState::Connected | PeerState::Discovered))
            .map(|p| p.info.clone())
            .collect();
        infos.shuffle(&mut rand::thread_rng());
        infos.truncate(limit);
        infos
    }

    /// Bootstrap cache snapshot, most recently seen first
    pub fn export(&self) -> Vec<PeerInfo> {
        let guard = self.lock();
        let mut peers: Vec<&Peer> = guard.peers.values().chain(guard.cold.values()).collect();
        peers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.peer_id().cmp(b.peer_id())));
        peers.into_iter().map(|p| p.info.clone()).collect()
    }

    /// Load a bootstrap cache; returns how many peers were accepted
    pub fn import(&self, peers: Vec<PeerInfo>) -> usize {
        peers.into_iter().filter(|info| self.upsert(info.clone()).is_ok()).count()
    }

    pub fn connected_count(&self) -> usize {
        self.lock().peers.values().filter(|p| p.state == PeerState::Connected).count()
    }

    /// Non-cold peers
    pub fn known_count(&self) -> usize {
        self.lock().peers.len()
    }

    /// Whether new discovery is currently rejected
    pub fn is_degraded(&self) -> bool {
        self.lock().peers.len() >= self.config.max_peers
    }

    pub fn inconsistencies(&self) -> u64 {
        self.lock().inconsistencies
    }

    /// Get statistics
    pub fn stats(&self) -> PeerStats {
        let guard = self.lock();
        let mut stats = PeerStats {
            known: guard.peers.len(),
            cold: guard.cold.len(),
            inconsistencies: guard.inconsistencies,
            rejected: guard.rejected,
            degraded: guard.peers.len() >= self.config.max_peers,
            ..PeerStats::default()
        };

        for peer in guard.peers.values() {
            match peer.state {
                PeerState::Discovered => stats.discovered += 1,
                PeerState::Connecting => stats.connecting += 1,
                PeerState::Connected => stats.connected += 1,
                PeerState::Unreachable => stats.unreachable += 1,
            }
        }

        stats
    }
}

/// Current Unix time in milliseconds
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
