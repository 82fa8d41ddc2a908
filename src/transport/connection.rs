// Connections - framed streams tracked by route
//
// Every connection is registered with the tracker for as long as any half
// of it is alive. The tracker can force-close a connection at any time;
// pending and future I/O on it then fails with `TransportError::Closed`.

use super::{codec, BoxedStream, PeerAddress, TransportError, TransportKind};
use crate::identity::NodeId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;

/// Unique identifier for a connection
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new random connection ID
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

/// Which side opened the connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

// ============================================================================
// CONNECTION TRACKER
// ============================================================================

struct Tracked {
    route: TransportKind,
    peer: Option<NodeId>,
    close_tx: watch::Sender<bool>,
}

/// Registry of open connections, shared by the transport layer
#[derive(Default)]
pub(crate) struct ConnectionTracker {
    connections: Mutex<HashMap<ConnectionId, Tracked>>,
    force_closed: AtomicU64,
}

impl ConnectionTracker {
    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Tracked>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(self: &Arc<Self>, route: TransportKind) -> (Arc<Registration>, watch::Receiver<bool>) {
        let id = ConnectionId::generate();
        let (close_tx, close_rx) = watch::channel(false);
        self.lock().insert(
            id,
            Tracked {
                route,
                peer: None,
                close_tx,
            },
        );
        let registration = Arc::new(Registration {
            id,
            tracker: Arc::clone(self),
        });
        (registration, close_rx)
    }

    fn deregister(&self, id: ConnectionId) {
        self.lock().remove(&id);
    }

    pub(crate) fn set_peer(&self, id: ConnectionId, peer: NodeId) {
        if let Some(tracked) = self.lock().get_mut(&id) {
            tracked.peer = Some(peer);
        }
    }

    /// Force-close one connection; false if it was already gone
    pub(crate) fn close(&self, id: ConnectionId) -> bool {
        let removed = self.lock().remove(&id);
        match removed {
            Some(tracked) => {
                tracked.close_tx.send_replace(true);
                self.force_closed.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Force-close every connection matching `filter`
    fn close_where(&self, filter: impl Fn(&Tracked) -> bool) -> usize {
        let closing: Vec<Tracked> = {
            let mut connections = self.lock();
            let ids: Vec<ConnectionId> = connections
                .iter()
                .filter(|(_, t)| filter(t))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| connections.remove(id)).collect()
        };

        for tracked in &closing {
            tracked.close_tx.send_replace(true);
        }
        self.force_closed.fetch_add(closing.len() as u64, Ordering::Relaxed);
        closing.len()
    }

    pub(crate) fn close_route(&self, route: TransportKind) -> usize {
        self.close_where(|t| t.route == route)
    }

    pub(crate) fn close_peer(&self, peer: &NodeId) -> usize {
        self.close_where(|t| t.peer.as_ref() == Some(peer))
    }

    pub(crate) fn close_all(&self) -> usize {
        self.close_where(|_| true)
    }

    pub(crate) fn count(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn count_route(&self, route: TransportKind) -> usize {
        self.lock().values().filter(|t| t.route == route).count()
    }

    pub(crate) fn force_closed(&self) -> u64 {
        self.force_closed.load(Ordering::Relaxed)
    }
}

/// Keeps a connection registered until both halves are dropped
struct Registration {
    id: ConnectionId,
    tracker: Arc<ConnectionTracker>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.tracker.deregister(self.id);
    }
}

async fn until_closed<T>(
    closed: &mut watch::Receiver<bool>,
    io: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    if *closed.borrow() {
        return Err(TransportError::Closed);
    }
    tokio::select! {
        result = io => result,
        _ = wait_for_close(closed) => Err(TransportError::Closed),
    }
}

async fn wait_for_close(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            // Tracker entry gone without a close signal: never fires
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// CONNECTION
// ============================================================================

/// A framed, tracked stream to one remote endpoint
pub struct Connection {
    id: ConnectionId,
    route: TransportKind,
    direction: Direction,
    remote: PeerAddress,
    stream: BoxedStream,
    closed: watch::Receiver<bool>,
    registration: Arc<Registration>,
    max_frame_len: usize,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("direction", &self.direction)
            .field("remote", &self.remote)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        stream: BoxedStream,
        route: TransportKind,
        direction: Direction,
        remote: PeerAddress,
        tracker: &Arc<ConnectionTracker>,
        max_frame_len: usize,
    ) -> Self {
        let (registration, closed) = tracker.register(route);
        Self {
            id: registration.id,
            route,
            direction,
            remote,
            stream,
            closed,
            registration,
            max_frame_len,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn route(&self) -> TransportKind {
        self.route
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote(&self) -> &PeerAddress {
        &self.remote
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Associate the connection with a peer once its identity is known
    pub fn bind_peer(&self, peer: NodeId) {
        self.registration.tracker.set_peer(self.id, peer);
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), TransportError> {
        let max = self.max_frame_len;
        until_closed(&mut self.closed, codec::write_frame(&mut self.stream, message, max))
            .await
            .map(|_| ())
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, TransportError> {
        let max = self.max_frame_len;
        until_closed(&mut self.closed, codec::read_frame(&mut self.stream, max)).await
    }

    /// Split into independently owned halves
    pub fn split(self) -> (ConnectionReader, ConnectionWriter) {
        let (read, write) = tokio::io::split(self.stream);
        let reader = ConnectionReader {
            id: self.id,
            half: read,
            closed: self.closed.clone(),
            _registration: Arc::clone(&self.registration),
            max_frame_len: self.max_frame_len,
        };
        let writer = ConnectionWriter {
            id: self.id,
            half: write,
            closed: self.closed,
            _registration: self.registration,
            max_frame_len: self.max_frame_len,
        };
        (reader, writer)
    }
}

/// Receiving half of a split connection
pub struct ConnectionReader {
    id: ConnectionId,
    half: ReadHalf<BoxedStream>,
    closed: watch::Receiver<bool>,
    _registration: Arc<Registration>,
    max_frame_len: usize,
}

impl ConnectionReader {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, TransportError> {
        let max = self.max_frame_len;
        until_closed(&mut self.closed, codec::read_frame(&mut self.half, max)).await
    }
}

/// Sending half of a split connection
pub struct ConnectionWriter {
    id: ConnectionId,
    half: WriteHalf<BoxedStream>,
    closed: watch::Receiver<bool>,
    _registration: Arc<Registration>,
    max_frame_len: usize,
}

impl ConnectionWriter {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Send one message; returns bytes written
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<usize, TransportError> {
        let max = self.max_frame_len;
        until_closed(&mut self.closed, codec::write_frame(&mut self.half, message, max)).await
    }

    pub async fn shutdown(&mut self) {
        let _ = self.half.shutdown().await;
    }
}
