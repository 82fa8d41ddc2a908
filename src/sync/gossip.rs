// Gossip - per-peer replication bookkeeping
//
// Implements the bounded, acknowledged side of post replication:
// - Push: new posts are queued per session and sent in numbered batches
// - Flow control: at most `max_outstanding_batches` unacknowledged batches
// - Liveness: a batch unacknowledged past `ack_timeout` marks the peer stalled
//
// Nothing here touches the network; the engine drives sessions from its
// reader and writer tasks.

use crate::identity::NodeId;
use crate::post::{Post, PostId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Configuration for post replication
#[derive(Clone, Debug)]
pub struct GossipConfig {
    /// Period of the anti-entropy round
    pub sync_interval: Duration,
    /// Time allowed for the Hello exchange on a new connection
    pub handshake_timeout: Duration,
    /// A batch unacknowledged for this long marks the peer unresponsive
    pub ack_timeout: Duration,
    /// Posts per outbound batch
    pub max_batch_posts: usize,
    /// Unacknowledged batches allowed per peer
    pub max_outstanding_batches: usize,
    /// Posts waiting to be pushed to one peer; oldest dropped beyond this
    pub max_queued_posts: usize,
    /// Ids per Inventory message
    pub max_inventory_chunk: usize,
    /// Peers returned for one PeerRequest
    pub max_peer_exchange: usize,
    /// Buffered control messages per session
    pub control_queue: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(30),
            max_batch_posts: 64,
            max_outstanding_batches: 4,
            max_queued_posts: 10_000,
            max_inventory_chunk: 4096,
            max_peer_exchange: 16,
            control_queue: 256,
        }
    }
}

impl GossipConfig {
    /// Create a new config builder
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_max_batch_posts(mut self, max: usize) -> Self {
        self.max_batch_posts = max;
        self
    }

    pub fn with_max_outstanding_batches(mut self, max: usize) -> Self {
        self.max_outstanding_batches = max;
        self
    }

    pub fn with_max_queued_posts(mut self, max: usize) -> Self {
        self.max_queued_posts = max;
        self
    }

    pub fn with_max_inventory_chunk(mut self, max: usize) -> Self {
        self.max_inventory_chunk = max;
        self
    }

    pub fn with_max_peer_exchange(mut self, max: usize) -> Self {
        self.max_peer_exchange = max;
        self
    }

    /// Reject values that would stall replication
    pub fn validate(&self) -> Result<(), String> {
        if self.sync_interval.is_zero() {
            return Err("sync_interval must be non-zero".to_string());
        }
        if self.max_batch_posts == 0 || self.max_outstanding_batches == 0 {
            return Err("batch limits must be non-zero".to_string());
        }
        if self.max_inventory_chunk == 0 || self.control_queue == 0 {
            return Err("inventory chunk and control queue must be non-zero".to_string());
        }
        Ok(())
    }
}

/// A batch ready to go on the wire
#[derive(Clone, Debug)]
pub struct OutboundBatch {
    pub batch_id: u64,
    pub posts: Vec<Post>,
}

struct InFlight {
    ids: Vec<PostId>,
    sent_at: Instant,
}

/// Replication state towards one connected peer
pub struct PeerSession {
    peer_id: NodeId,
    max_batch_posts: usize,
    max_outstanding: usize,
    max_queued: usize,
    ack_timeout: Duration,
    queue: VecDeque<Post>,
    queued: HashSet<PostId>,
    in_flight: HashMap<u64, InFlight>,
    in_flight_ids: HashSet<PostId>,
    /// Ids the peer is known to hold (acked or listed in its inventory)
    remote_has: HashSet<PostId>,
    next_batch_id: u64,
    dropped: u64,
}

impl PeerSession {
    pub fn new(peer_id: NodeId, config: &GossipConfig) -> Self {
        Self {
            peer_id,
            max_batch_posts: config.max_batch_posts.max(1),
            max_outstanding: config.max_outstanding_batches.max(1),
            max_queued: config.max_queued_posts.max(1),
            ack_timeout: config.ack_timeout,
            queue: VecDeque::new(),
            queued: HashSet::new(),
            in_flight: HashMap::new(),
            in_flight_ids: HashSet::new(),
            remote_has: HashSet::new(),
            next_batch_id: 1,
            dropped: 0,
        }
    }

    pub fn peer_id(&self) -> &NodeId {
        &self.peer_id
    }

    /// Queue a post for this peer
    ///
    /// Returns false when the peer already has it or it is already queued
    /// or in flight. A full queue drops its oldest entry; the next
    /// anti-entropy round repairs the gap.
    pub fn enqueue(&mut self, post: Post) -> bool {
        let id = post.id();
        if self.remote_has.contains(&id) || self.queued.contains(&id) || self.in_flight_ids.contains(&id) {
            return false;
        }

        if self.queue.len() >= self.max_queued {
            if let Some(oldest) = self.queue.pop_front() {
                self.queued.remove(&oldest.id());
                self.dropped += 1;
            }
        }
        self.queued.insert(id);
        self.queue.push_back(post);
        true
    }

    pub fn mark_remote_has(&mut self, id: PostId) {
        self.remote_has.insert(id);
    }

    pub fn remote_has(&self, id: &PostId) -> bool {
        self.remote_has.contains(id)
    }

    /// Take the next batch if the outstanding window allows one
    pub fn next_batch(&mut self, now: Instant) -> Option<OutboundBatch> {
        if self.in_flight.len() >= self.max_outstanding {
            return None;
        }

        let mut posts = Vec::new();
        let mut ids = Vec::new();
        while posts.len() < self.max_batch_posts {
            let Some(post) = self.queue.pop_front() else {
                break;
            };
            let id = post.id();
            self.queued.remove(&id);
            // Learned from an inventory after queueing
            if self.remote_has.contains(&id) || self.in_flight_ids.contains(&id) {
                continue;
            }
            ids.push(id);
            posts.push(post);
        }
        if posts.is_empty() {
            return None;
        }

        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        self.in_flight_ids.extend(ids.iter().copied());
        self.in_flight.insert(batch_id, InFlight { ids, sent_at: now });
        Some(OutboundBatch { batch_id, posts })
    }

    /// Settle a batch; false for unknown or already settled ids
    pub fn acknowledge(&mut self, batch_id: u64) -> bool {
        self.acknowledge_at(batch_id, Instant::now()).is_some()
    }

    /// Settle a batch and return how long it was in flight
    pub fn acknowledge_at(&mut self, batch_id: u64, now: Instant) -> Option<Duration> {
        let batch = self.in_flight.remove(&batch_id)?;
        for id in batch.ids {
            self.in_flight_ids.remove(&id);
            self.remote_has.insert(id);
        }
        Some(now.saturating_duration_since(batch.sent_at))
    }

    /// True when any batch has waited longer than the ack timeout
    pub fn is_stalled(&self, now: Instant) -> bool {
        self.in_flight
            .values()
            .any(|batch| now.saturating_duration_since(batch.sent_at) >= self.ack_timeout)
    }

    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Posts discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Statistics about replication
#[derive(Clone, Debug, Default, Serialize)]
pub struct SyncStats {
    pub rounds: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub handshake_failures: u64,
    pub posts_received: u64,
    pub posts_accepted: u64,
    pub posts_duplicate: u64,
    pub posts_rejected: u64,
    pub corruption_reports: u64,
    pub batches_sent: u64,
    pub batches_acked: u64,
    pub peers_demoted: u64,
    pub last_sync: Option<DateTime<Utc>>,
}
