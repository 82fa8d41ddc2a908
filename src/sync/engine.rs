// Sync Engine - replication across live peer sessions
//
// Owns one session per connected peer. Each session runs a reader task
// (handles incoming messages, never blocks on the network) and a writer
// task (drains control messages and post batches). A periodic round sends
// digests, demotes unresponsive peers, dials peers whose backoff expired
// and moves long-unreachable peers to the cold set.

use super::gossip::{GossipConfig, PeerSession, SyncStats};
use super::protocol::{Hello, Message, PROTOCOL_VERSION};
use crate::identity::NodeId;
use crate::peer::{now_ms, PeerError, PeerInfo, PeerRegistry, PeerState};
use crate::post::{Post, PostError, PostId, PostStore};
use crate::transport::{
    Connection, ConnectionId, ConnectionReader, ConnectionWriter, PeerAddress, TransportError,
    TransportKind, TransportLayer,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How this node presents itself in handshakes
#[derive(Clone, Debug, Default)]
pub struct LocalEndpoint {
    /// Host peers should dial; the observed address is used when absent
    pub advertised_host: Option<String>,
    /// Network secret; peers must present it when set
    pub shared_secret: Option<String>,
}

struct SessionHandle {
    conn_id: ConnectionId,
    /// Node that opened the connection
    initiator: NodeId,
    state: Arc<Mutex<PeerSession>>,
    control: mpsc::Sender<Message>,
    flush: Arc<Notify>,
}

/// Cheap handles a task needs to talk to one session
#[derive(Clone)]
struct SessionRefs {
    peer: NodeId,
    state: Arc<Mutex<PeerSession>>,
    control: mpsc::Sender<Message>,
    flush: Arc<Notify>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Replicates the post store over peer sessions
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: GossipConfig,
    local: LocalEndpoint,
    node_id: NodeId,
    store: PostStore,
    registry: Arc<PeerRegistry>,
    transport: Arc<TransportLayer>,
    sessions: Mutex<HashMap<NodeId, SessionHandle>>,
    dialing: Mutex<HashSet<NodeId>>,
    stats: Mutex<SyncStats>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        config: GossipConfig,
        local: LocalEndpoint,
        store: PostStore,
        registry: Arc<PeerRegistry>,
        transport: Arc<TransportLayer>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let node_id = *registry.my_node_id();
        Self {
            inner: Arc::new(EngineInner {
                config,
                local,
                node_id,
                store,
                registry,
                transport,
                sessions: Mutex::new(HashMap::new()),
                dialing: Mutex::new(HashSet::new()),
                stats: Mutex::new(SyncStats::default()),
                shutdown,
                tasks: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &GossipConfig {
        &self.inner.config
    }

    /// Start consuming inbound connections and dial requests, and start
    /// the periodic sync round
    ///
    /// Returns false if the engine was already started or stopped.
    pub fn start(
        &self,
        incoming: mpsc::Receiver<Connection>,
        dial_requests: mpsc::UnboundedReceiver<NodeId>,
    ) -> bool {
        if self.inner.stopped.load(Ordering::SeqCst) || self.inner.running.swap(true, Ordering::SeqCst) {
            return false;
        }

        let handles = vec![
            tokio::spawn(Arc::clone(&self.inner).accept_loop(incoming)),
            tokio::spawn(Arc::clone(&self.inner).dial_loop(dial_requests)),
            tokio::spawn(Arc::clone(&self.inner).schedule_loop()),
        ];
        lock(&self.inner.tasks).extend(handles);
        info!(
            node = %self.inner.node_id,
            interval_ms = self.inner.config.sync_interval.as_millis() as u64,
            "Sync engine started"
        );
        true
    }

    /// Stop background tasks and close every session
    ///
    /// Peers with open sessions are marked unreachable. Terminal.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);
        for handle in lock(&self.inner.tasks).drain(..) {
            handle.abort();
        }

        let sessions: Vec<(NodeId, SessionHandle)> = lock(&self.inner.sessions).drain().collect();
        for (peer, handle) in &sessions {
            self.inner.transport.close_connection(handle.conn_id);
            let _ = self.inner.registry.record_failure(peer);
        }
        lock(&self.inner.stats).sessions_closed += sessions.len() as u64;
        info!(closed = sessions.len(), "Sync engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Push a locally created post to every connected peer
    pub fn announce(&self, post: &Post) {
        let queued = self.inner.propagate(std::slice::from_ref(post), None);
        debug!(post = %post.id(), peers = queued, "Announced post");
    }

    /// Run one anti-entropy round now
    pub fn sync_round(&self) {
        self.inner.sync_round();
    }

    /// Ask the engine to connect to a registered peer
    pub fn request_dial(&self, peer: NodeId) {
        self.inner.request_dial(peer);
    }

    /// Peers with a live session, in id order
    pub fn session_peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = lock(&self.inner.sessions).keys().copied().collect();
        peers.sort();
        peers
    }

    pub fn session_count(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    pub fn stats(&self) -> SyncStats {
        lock(&self.inner.stats).clone()
    }
}

impl EngineInner {
    fn bump(&self, update: impl FnOnce(&mut SyncStats)) {
        update(&mut lock(&self.stats));
    }

    fn has_session(&self, peer: &NodeId) -> bool {
        lock(&self.sessions).contains_key(peer)
    }

    fn snapshot_sessions(&self) -> Vec<SessionRefs> {
        lock(&self.sessions)
            .iter()
            .map(|(peer, handle)| SessionRefs {
                peer: *peer,
                state: Arc::clone(&handle.state),
                control: handle.control.clone(),
                flush: Arc::clone(&handle.flush),
            })
            .collect()
    }

    // ========================================================================
    // BACKGROUND LOOPS
    // ========================================================================

    async fn accept_loop(self: Arc<Self>, mut incoming: mpsc::Receiver<Connection>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                connection = incoming.recv() => match connection {
                    Some(connection) => {
                        tokio::spawn(Arc::clone(&self).accept(connection));
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn dial_loop(self: Arc<Self>, mut requests: mpsc::UnboundedReceiver<NodeId>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(peer) => self.request_dial(peer),
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn schedule_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(self.config.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sync_round(),
                _ = shutdown.changed() => break,
            }
        }
    }

    // ========================================================================
    // SYNC ROUND
    // ========================================================================

    fn sync_round(self: &Arc<Self>) {
        let now = Instant::now();

        // Unacked batches past the threshold: demote instead of waiting
        let stalled: Vec<(NodeId, ConnectionId)> = lock(&self.sessions)
            .iter()
            .filter(|(_, handle)| lock(&handle.state).is_stalled(now))
            .map(|(peer, handle)| (*peer, handle.conn_id))
            .collect();
        for (peer, conn_id) in stalled {
            warn!(peer = %peer, "Peer unresponsive, demoting to unreachable");
            self.bump(|s| s.peers_demoted += 1);
            self.transport.close_connection(conn_id);
            self.detach(&peer, conn_id, "unresponsive");
        }

        let sessions = self.snapshot_sessions();
        for session in &sessions {
            // A failed redial may have marked a peer unreachable while its
            // inbound session is alive
            if self.registry.get(&session.peer).is_some_and(|p| p.state() != PeerState::Connected) {
                let _ = self.registry.transition(&session.peer, PeerState::Connected);
            }
        }

        match self.store.digest() {
            Ok(digest) => {
                for session in &sessions {
                    let message = Message::Digest {
                        digest,
                        reply: false,
                    };
                    if session.control.try_send(message).is_err() {
                        debug!(peer = %session.peer, "Control queue busy, skipping digest");
                    }
                    session.flush.notify_one();
                }
            }
            Err(e) => warn!(error = %e, "Could not compute store digest"),
        }

        for peer in self.registry.due_for_dial(now_ms()) {
            self.request_dial(*peer.peer_id());
        }
        self.registry.evict_expired(now_ms());

        self.bump(|s| {
            s.rounds += 1;
            s.last_sync = Some(chrono::Utc::now());
        });
        debug!(sessions = sessions.len(), "Sync round complete");
    }

    // ========================================================================
    // HANDSHAKE
    // ========================================================================

    fn local_hello(&self, peer_secret: Option<&str>) -> Hello {
        let listen_port = self
            .transport
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.transport.config().port);
        Hello {
            node_id: self.node_id,
            protocol_version: PROTOCOL_VERSION,
            listen_port,
            advertised_host: self.local.advertised_host.clone(),
            transport_kind: if self.transport.is_anonymization_enabled() {
                TransportKind::Anonymized
            } else {
                TransportKind::Direct
            },
            shared_secret: peer_secret.map(str::to_string).or_else(|| self.local.shared_secret.clone()),
        }
    }

    fn check_hello(&self, hello: &Hello) -> Result<(), TransportError> {
        if hello.node_id == self.node_id {
            return Err(TransportError::Handshake("connected to self".to_string()));
        }
        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(TransportError::Handshake(format!(
                "protocol version {} (expected {})",
                hello.protocol_version, PROTOCOL_VERSION
            )));
        }
        if let Some(required) = &self.local.shared_secret {
            if hello.shared_secret.as_deref() != Some(required.as_str()) {
                return Err(TransportError::Handshake("shared secret mismatch".to_string()));
            }
        }
        Ok(())
    }

    /// Answer a connectivity check or complete an inbound handshake
    async fn accept(self: Arc<Self>, mut connection: Connection) {
        let remote = connection.remote().clone();
        let first = timeout(self.config.handshake_timeout, connection.recv::<Message>()).await;
        let hello = match first {
            Ok(Ok(Message::Hello(hello))) => hello,
            Ok(Ok(Message::Ping { nonce })) => {
                let pong = Message::Pong { nonce };
                let _ = timeout(self.transport.config().message_timeout, connection.send(&pong)).await;
                debug!(remote = %remote, "Answered connectivity check");
                return;
            }
            Ok(Ok(other)) => {
                self.bump(|s| s.handshake_failures += 1);
                debug!(remote = %remote, message = ?other.message_type(), "Expected hello");
                return;
            }
            Ok(Err(e)) => {
                self.bump(|s| s.handshake_failures += 1);
                debug!(remote = %remote, error = %e, "Inbound handshake failed");
                return;
            }
            Err(_) => {
                self.bump(|s| s.handshake_failures += 1);
                debug!(remote = %remote, "Inbound handshake timed out");
                return;
            }
        };

        if let Err(e) = self.check_hello(&hello) {
            self.bump(|s| s.handshake_failures += 1);
            warn!(remote = %remote, peer = %hello.node_id, error = %e, "Rejected inbound peer");
            return;
        }

        let host = hello
            .advertised_host
            .clone()
            .unwrap_or_else(|| remote.host().to_string());
        let mut info = PeerInfo::new(hello.node_id, PeerAddress::new(host, hello.listen_port), hello.transport_kind);
        if let Some(secret) = &hello.shared_secret {
            info = info.with_shared_secret(secret.clone());
        }
        match self.registry.upsert(info) {
            Ok(_) => {}
            Err(PeerError::RegistryFull { max }) => {
                warn!(peer = %hello.node_id, max, "Registry full, refusing inbound peer");
                return;
            }
            Err(e) => {
                debug!(peer = %hello.node_id, error = %e, "Could not register inbound peer");
                return;
            }
        }

        let reply = Message::Hello(self.local_hello(None));
        match timeout(self.transport.config().message_timeout, connection.send(&reply)).await {
            Ok(Ok(())) => self.attach(hello.node_id, connection, hello.node_id),
            Ok(Err(e)) => debug!(peer = %hello.node_id, error = %e, "Failed to answer hello"),
            Err(_) => debug!(peer = %hello.node_id, "Timed out answering hello"),
        }
    }

    fn request_dial(self: &Arc<Self>, peer: NodeId) {
        if !self.running.load(Ordering::SeqCst) || self.has_session(&peer) {
            return;
        }
        if !lock(&self.dialing).insert(peer) {
            return;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.dial(peer).await {
                debug!(peer = %peer, error = %e, "Dial failed");
            }
            lock(&inner.dialing).remove(&peer);
        });
    }

    /// Connect to a registered peer and complete the outbound handshake
    async fn dial(self: &Arc<Self>, peer: NodeId) -> Result<(), TransportError> {
        if self.has_session(&peer) {
            return Ok(());
        }
        let secret = self
            .registry
            .get(&peer)
            .and_then(|p| p.shared_secret().map(str::to_string));

        let mut connection = self.transport.connect(&peer).await?;
        let hello = Message::Hello(self.local_hello(secret.as_deref()));

        let exchange = async {
            connection.send(&hello).await?;
            match connection.recv::<Message>().await? {
                Message::Hello(reply) => Ok(reply),
                other => Err(TransportError::Handshake(format!(
                    "expected hello, got {:?}",
                    other.message_type()
                ))),
            }
        };
        let result = match timeout(self.config.handshake_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };
        let result = result.and_then(|reply| {
            if reply.node_id != peer {
                return Err(TransportError::Handshake(format!(
                    "expected {}, answered by {}",
                    peer, reply.node_id
                )));
            }
            self.check_hello(&reply)
        });

        if let Err(e) = result {
            self.bump(|s| s.handshake_failures += 1);
            let _ = self.registry.record_dial_failure(&peer);
            warn!(peer = %peer, error = %e, "Outbound handshake failed");
            return Err(e);
        }

        self.attach(peer, connection, self.node_id);
        Ok(())
    }

    // ========================================================================
    // SESSIONS
    // ========================================================================

    /// Install a handshaken connection as the peer's session
    ///
    /// Two connections between the same pair keep the one opened by the
    /// smaller node id; both ends reach the same decision.
    fn attach(self: &Arc<Self>, peer: NodeId, connection: Connection, initiator: NodeId) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let preferred = self.node_id.min(peer);
        let conn_id = connection.id();
        let state = Arc::new(Mutex::new(PeerSession::new(peer, &self.config)));
        let flush = Arc::new(Notify::new());
        let (control, control_rx) = mpsc::channel(self.config.control_queue.max(1));

        let replaced = {
            let mut sessions = lock(&self.sessions);
            let replaced = match sessions.get(&peer) {
                Some(existing) if existing.initiator == preferred && initiator != preferred => {
                    debug!(peer = %peer, conn = %conn_id, "Dropping duplicate connection");
                    return;
                }
                Some(existing) => Some(existing.conn_id),
                None => None,
            };
            sessions.insert(
                peer,
                SessionHandle {
                    conn_id,
                    initiator,
                    state: Arc::clone(&state),
                    control: control.clone(),
                    flush: Arc::clone(&flush),
                },
            );
            replaced
        };
        if let Some(old) = replaced {
            debug!(peer = %peer, old = %old, new = %conn_id, "Replacing duplicate session");
            self.transport.close_connection(old);
        }

        if let Err(e) = self.registry.transition(&peer, PeerState::Connected) {
            debug!(peer = %peer, error = %e, "Session opened for peer in unexpected state");
        }
        connection.bind_peer(peer);
        self.bump(|s| s.sessions_opened += 1);
        info!(peer = %peer, conn = %conn_id, route = %connection.route(), "Session established");

        let _ = control.try_send(Message::PeerRequest);
        match self.store.digest() {
            Ok(digest) => {
                let _ = control.try_send(Message::Digest { digest, reply: false });
            }
            Err(e) => warn!(error = %e, "Could not compute store digest"),
        }

        let refs = SessionRefs {
            peer,
            state,
            control,
            flush,
        };
        let (reader, writer) = connection.split();
        tokio::spawn(Arc::clone(self).run_writer(writer, control_rx, refs.clone()));
        tokio::spawn(Arc::clone(self).run_reader(reader, refs));
    }

    /// Forget the session if `conn_id` is still current and mark the peer unreachable
    fn detach(&self, peer: &NodeId, conn_id: ConnectionId, reason: &str) {
        let removed = {
            let mut sessions = lock(&self.sessions);
            match sessions.get(peer) {
                Some(handle) if handle.conn_id == conn_id => sessions.remove(peer),
                _ => None,
            }
        };
        if removed.is_none() {
            return;
        }

        self.bump(|s| s.sessions_closed += 1);
        let retry_in = self.registry.record_failure(peer).ok();
        info!(
            peer = %peer,
            reason,
            retry_in_ms = retry_in.map(|d| d.as_millis() as u64),
            "Session closed"
        );
    }

    async fn run_writer(
        self: Arc<Self>,
        mut writer: ConnectionWriter,
        mut control: mpsc::Receiver<Message>,
        session: SessionRefs,
    ) {
        let message_timeout = self.transport.config().message_timeout;
        'session: loop {
            let outgoing = tokio::select! {
                message = control.recv() => match message {
                    Some(message) => vec![message],
                    None => break,
                },
                _ = session.flush.notified() => self.drain_batches(&session),
            };

            for message in outgoing {
                match timeout(message_timeout, writer.send(&message)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        debug!(peer = %session.peer, error = %e, "Write failed");
                        self.transport.close_connection(writer.id());
                        break 'session;
                    }
                    Err(_) => {
                        warn!(peer = %session.peer, "Write timed out");
                        self.transport.close_connection(writer.id());
                        break 'session;
                    }
                }
            }
        }
        writer.shutdown().await;
    }

    fn drain_batches(&self, session: &SessionRefs) -> Vec<Message> {
        let now = Instant::now();
        let mut messages = Vec::new();
        {
            let mut state = lock(&session.state);
            while let Some(batch) = state.next_batch(now) {
                messages.push(Message::Posts {
                    batch_id: batch.batch_id,
                    posts: batch.posts,
                });
            }
        }
        if !messages.is_empty() {
            self.bump(|s| s.batches_sent += messages.len() as u64);
        }
        messages
    }

    async fn run_reader(self: Arc<Self>, mut reader: ConnectionReader, session: SessionRefs) {
        let conn_id = reader.id();
        let reason = loop {
            let message = match reader.recv::<Message>().await {
                Ok(message) => message,
                Err(e) => break e.to_string(),
            };
            self.registry.mark_seen(&session.peer);
            if let Err(e) = self.handle_message(&session, message) {
                break e.to_string();
            }
        };
        self.detach(&session.peer, conn_id, &reason);
    }

    // ========================================================================
    // MESSAGE HANDLING
    // ========================================================================

    fn send(&self, session: &SessionRefs, message: Message) -> Result<(), TransportError> {
        session.control.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TransportError::ConnectionFailed("peer is not draining its session".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn handle_message(&self, session: &SessionRefs, message: Message) -> Result<(), TransportError> {
        let peer = &session.peer;
        match message {
            Message::Ping { nonce } => self.send(session, Message::Pong { nonce }),
            Message::Pong { .. } => Ok(()),
            Message::Hello(_) => {
                debug!(peer = %peer, "Ignoring hello on established session");
                Ok(())
            }

            Message::Digest { digest, reply } => {
                let ours = match self.store.digest() {
                    Ok(ours) => ours,
                    Err(e) => {
                        warn!(error = %e, "Could not compute store digest");
                        return Ok(());
                    }
                };
                if ours.root == digest.root {
                    return Ok(());
                }
                debug!(peer = %peer, ours = ours.count, theirs = digest.count, "Digests differ");

                let ids = match self.store.ids() {
                    Ok(ids) => ids,
                    Err(e) => {
                        warn!(error = %e, "Could not list post ids");
                        return Ok(());
                    }
                };
                for chunk in ids.chunks(self.config.max_inventory_chunk.max(1)) {
                    self.send(session, Message::Inventory { ids: chunk.to_vec() })?;
                }
                if !reply {
                    self.send(session, Message::Digest { digest: ours, reply: true })?;
                }
                Ok(())
            }

            Message::Inventory { ids } => {
                let mut missing = Vec::new();
                {
                    let mut state = lock(&session.state);
                    for id in &ids {
                        state.mark_remote_has(*id);
                    }
                }
                for id in ids {
                    match self.store.knows(&id) {
                        Ok(false) => missing.push(id),
                        Ok(true) => {}
                        Err(e) => warn!(error = %e, "Post lookup failed"),
                    }
                }
                if !missing.is_empty() {
                    debug!(peer = %peer, count = missing.len(), "Requesting missing posts");
                    self.send(session, Message::Want { ids: missing })?;
                }
                Ok(())
            }

            Message::Want { ids } => {
                let posts = match self.store.posts_by_ids(&ids) {
                    Ok(posts) => posts,
                    Err(e) => {
                        warn!(error = %e, "Could not load wanted posts");
                        return Ok(());
                    }
                };
                let queued = {
                    let mut state = lock(&session.state);
                    posts.into_iter().filter(|post| state.enqueue(post.clone())).count()
                };
                if queued > 0 {
                    session.flush.notify_one();
                }
                Ok(())
            }

            Message::Posts { batch_id, posts } => {
                let accepted = self.ingest_batch(session, posts);
                self.send(session, Message::Ack { batch_id })?;
                if !accepted.is_empty() {
                    self.propagate(&accepted, Some(peer));
                }
                Ok(())
            }

            Message::Ack { batch_id } => {
                let rtt = lock(&session.state).acknowledge_at(batch_id, Instant::now());
                if let Some(rtt) = rtt {
                    self.bump(|s| s.batches_acked += 1);
                    self.registry
                        .record_rtt(peer, rtt.as_millis().min(u32::MAX as u128) as u32);
                    session.flush.notify_one();
                }
                Ok(())
            }

            Message::PeerRequest => {
                let peers = self
                    .registry
                    .sample_for_exchange(peer, self.config.max_peer_exchange);
                self.send(session, Message::PeerList { peers })
            }

            Message::PeerList { peers } => {
                for info in peers.into_iter().take(self.config.max_peer_exchange) {
                    let id = *info.peer_id();
                    if id == self.node_id || self.registry.get(&id).is_some() {
                        continue;
                    }
                    match self.registry.upsert(info) {
                        Ok(_) => debug!(peer = %id, via = %peer, "Learned peer from exchange"),
                        Err(PeerError::RegistryFull { .. }) => break,
                        Err(e) => debug!(peer = %id, error = %e, "Ignoring exchanged peer"),
                    }
                }
                Ok(())
            }
        }
    }

    /// Store a received batch; returns the posts that were new
    fn ingest_batch(&self, session: &SessionRefs, posts: Vec<Post>) -> Vec<Post> {
        let mut accepted = Vec::new();
        let mut held: Vec<PostId> = Vec::new();
        let (mut duplicate, mut rejected, mut corrupt) = (0u64, 0u64, 0u64);
        let received = posts.len() as u64;

        for post in posts {
            let id = post.id();
            match self.store.ingest_remote(post.clone()) {
                Ok(true) => {
                    held.push(id);
                    accepted.push(post);
                }
                Ok(false) => {
                    held.push(id);
                    duplicate += 1;
                }
                Err(e) if e.is_corruption() => {
                    corrupt += 1;
                    warn!(peer = %session.peer, post = %id, error = %e, "Corrupt post from peer");
                }
                Err(PostError::Storage(e)) => {
                    rejected += 1;
                    warn!(peer = %session.peer, post = %id, error = %e, "Failed to store post");
                }
                Err(e) => {
                    rejected += 1;
                    debug!(peer = %session.peer, post = %id, error = %e, "Rejected post");
                }
            }
        }

        {
            let mut state = lock(&session.state);
            for id in held {
                state.mark_remote_has(id);
            }
        }
        let new = accepted.len() as u64;
        self.bump(|s| {
            s.posts_received += received;
            s.posts_accepted += new;
            s.posts_duplicate += duplicate;
            s.posts_rejected += rejected;
            s.corruption_reports += corrupt;
        });
        if new > 0 {
            debug!(peer = %session.peer, new, duplicate, "Ingested batch");
        }
        accepted
    }

    /// Queue posts for every session except `exclude`; returns sessions touched
    fn propagate(&self, posts: &[Post], exclude: Option<&NodeId>) -> usize {
        let mut touched = 0;
        for session in self.snapshot_sessions() {
            if Some(&session.peer) == exclude {
                continue;
            }
            let queued = {
                let mut state = lock(&session.state);
                posts.iter().filter(|post| state.enqueue((*post).clone())).count()
            };
            if queued > 0 {
                session.flush.notify_one();
                touched += 1;
            }
        }
        touched
    }
}
