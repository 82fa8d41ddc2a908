// Transport Layer - direct or anonymized connections to peers
//
// Chooses the route for each outbound connection, applies connect
// timeouts, reports outcomes to the peer registry and owns the listener.
// Anonymized routing is only available while the proxy supervisor is
// enabled; disabling it cancels anonymized dials and force-closes
// anonymized connections after a bounded grace period.

use super::connection::{Connection, ConnectionId, ConnectionTracker, Direction};
use super::tcp::{self, Acceptor};
use super::{
    Dialer, PeerAddress, ProxyConnector, ProxyState, ProxySupervisor, TransportConfig,
    TransportError, TransportKind, TransportStats,
};
use crate::identity::NodeId;
use crate::peer::{PeerRegistry, PeerState};
use crate::sync::Message;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Counts an anonymized dial for as long as it is alive
struct PendingDial(Arc<AtomicUsize>);

impl PendingDial {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for PendingDial {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct TransportLayer {
    config: TransportConfig,
    registry: Arc<PeerRegistry>,
    dialer: Arc<dyn Dialer>,
    proxy: ProxySupervisor,
    tracker: Arc<ConnectionTracker>,
    anonymize_all: AtomicBool,
    pending_anonymized: Arc<AtomicUsize>,
    listener: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    outbound: AtomicU64,
    inbound: Arc<AtomicU64>,
    connect_failures: AtomicU64,
}

impl TransportLayer {
    pub fn new(
        config: TransportConfig,
        registry: Arc<PeerRegistry>,
        dialer: Arc<dyn Dialer>,
        proxy: Arc<dyn ProxyConnector>,
    ) -> Self {
        let supervisor = ProxySupervisor::new(proxy, config.proxy_startup_timeout, config.proxy_health_interval);
        Self {
            config,
            registry,
            dialer,
            proxy: supervisor,
            tracker: Arc::new(ConnectionTracker::default()),
            anonymize_all: AtomicBool::new(false),
            pending_anonymized: Arc::new(AtomicUsize::new(0)),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            outbound: AtomicU64::new(0),
            inbound: Arc::new(AtomicU64::new(0)),
            connect_failures: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    // ========================================================================
    // LISTENING
    // ========================================================================

    /// Bind the listener and start accepting
    ///
    /// Inbound connections are delivered on the returned channel.
    pub async fn listen(&self) -> Result<mpsc::Receiver<Connection>, TransportError> {
        if self.is_listening() {
            return Err(TransportError::AlreadyRunning);
        }

        let listener = tcp::bind(&self.config.bind_address, self.config.port).await?;
        let local = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(self.config.accept_backlog);

        let acceptor = Acceptor {
            listener,
            tracker: Arc::clone(&self.tracker),
            incoming: tx,
            max_connections: self.config.max_connections,
            max_frame_len: self.config.max_frame_len,
            accepted: Arc::clone(&self.inbound),
        };
        let handle = tokio::spawn(acceptor.run());

        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local);
        info!(address = %local, "Listening");
        Ok(rx)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    // ========================================================================
    // OUTBOUND
    // ========================================================================

    fn route_for(&self, kind: TransportKind, address: &PeerAddress) -> TransportKind {
        if kind == TransportKind::Anonymized
            || address.is_onion()
            || self.anonymize_all.load(Ordering::SeqCst)
        {
            TransportKind::Anonymized
        } else {
            TransportKind::Direct
        }
    }

    /// Connect to a registered peer
    ///
    /// The peer moves to Connecting; on failure it moves to Unreachable
    /// with a backoff scheduled, and the error is returned. Connectivity
    /// failures are retryable (see [`TransportError::is_retryable`]).
    /// A peer that is already Connected is not dialed again.
    pub async fn connect(&self, peer_id: &NodeId) -> Result<Connection, TransportError> {
        let peer = self
            .registry
            .get(peer_id)
            .ok_or_else(|| TransportError::ConnectionFailed(format!("unknown peer {}", peer_id)))?;
        if peer.state() == PeerState::Connected {
            return Err(TransportError::AlreadyConnected);
        }
        self.registry.transition(peer_id, PeerState::Connecting)?;

        let route = self.route_for(peer.transport_kind(), peer.address());
        match self.open(peer.address(), route, Some(*peer_id)).await {
            Ok(connection) => {
                debug!(peer = %peer_id, route = %route, conn = %connection.id(), "Connected");
                Ok(connection)
            }
            Err(e) => {
                self.connect_failures.fetch_add(1, Ordering::Relaxed);
                if let Ok(None) = self.registry.record_dial_failure(peer_id) {
                    debug!(peer = %peer_id, "Peer connected meanwhile; keeping its session");
                }
                warn!(peer = %peer_id, address = %peer.address(), route = %route, error = %e, "Connect failed");
                Err(e)
            }
        }
    }

    async fn open(
        &self,
        address: &PeerAddress,
        route: TransportKind,
        peer: Option<NodeId>,
    ) -> Result<Connection, TransportError> {
        let connection = match route {
            TransportKind::Direct => {
                let stream = timeout(self.config.connect_timeout, self.dialer.dial(address))
                    .await
                    .map_err(|_| TransportError::Timeout)??;
                self.register(stream, route, address)
            }
            TransportKind::Anonymized => self.open_anonymized(address).await?,
        };

        if let Some(peer) = peer {
            connection.bind_peer(peer);
        }
        self.outbound.fetch_add(1, Ordering::Relaxed);
        Ok(connection)
    }

    async fn open_anonymized(&self, address: &PeerAddress) -> Result<Connection, TransportError> {
        // Subscribe before checking so a concurrent disable is never missed
        let mut cancelled = self.proxy.cancellation();
        if !self.proxy.is_enabled() {
            return Err(TransportError::AnonymizationDisabled);
        }
        let _pending = PendingDial::enter(&self.pending_anonymized);
        let connector = self.proxy.connector();

        let stream = tokio::select! {
            result = timeout(self.config.connect_timeout, connector.dial(address)) => {
                result.map_err(|_| TransportError::Timeout)??
            }
            _ = cancelled.changed() => return Err(TransportError::Cancelled),
        };

        // Disabled while the dial was finishing
        if !self.proxy.is_enabled() {
            return Err(TransportError::Cancelled);
        }
        Ok(self.register(stream, TransportKind::Anonymized, address))
    }

    fn register(&self, stream: super::BoxedStream, route: TransportKind, address: &PeerAddress) -> Connection {
        Connection::new(
            stream,
            route,
            Direction::Outbound,
            address.clone(),
            &self.tracker,
            self.config.max_frame_len,
        )
    }

    // ========================================================================
    // ANONYMIZATION
    // ========================================================================

    /// Start routing everything through the proxy
    ///
    /// Fails with `ProxyStartup` if the proxy does not answer within the
    /// startup timeout; routing is left unchanged in that case.
    pub async fn enable_anonymization(&self) -> Result<(), TransportError> {
        self.proxy.start().await?;
        self.anonymize_all.store(true, Ordering::SeqCst);
        info!(proxy = %self.proxy.connector().endpoint(), "Anonymization enabled");
        Ok(())
    }

    /// Revert to direct routing
    ///
    /// Cancels in-flight anonymized dials, waits up to the grace period for
    /// them to unwind, then force-closes anonymized connections. Returns the
    /// number of connections closed.
    pub async fn disable_anonymization(&self) -> usize {
        let was_enabled = self.anonymize_all.swap(false, Ordering::SeqCst);
        self.proxy.stop();

        let deadline = Instant::now() + self.config.cancel_grace;
        while self.pending_anonymized.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let closed = self.tracker.close_route(TransportKind::Anonymized);
        if was_enabled || closed > 0 {
            info!(closed, "Anonymization disabled");
        }
        closed
    }

    pub fn is_anonymization_enabled(&self) -> bool {
        self.anonymize_all.load(Ordering::SeqCst)
    }

    pub fn proxy_state(&self) -> ProxyState {
        self.proxy.state()
    }

    pub fn proxy_endpoint(&self) -> String {
        self.proxy.connector().endpoint()
    }

    // ========================================================================
    // DIAGNOSTICS
    // ========================================================================

    /// Ping/pong round trip against `target`, or against our own listener
    ///
    /// The check connection is dropped before returning, whatever the outcome.
    pub async fn test_connectivity(&self, target: Option<PeerAddress>) -> Result<Duration, TransportError> {
        let address = match target {
            Some(address) => address,
            None => {
                let local = self.local_addr().ok_or(TransportError::NotRunning)?;
                loopback_for(local)
            }
        };
        let route = if address.is_loopback() {
            TransportKind::Direct
        } else {
            self.route_for(TransportKind::Direct, &address)
        };

        let started = Instant::now();
        let mut connection = self.open(&address, route, None).await?;
        let nonce: u64 = rand::random();

        let exchange = async {
            connection.send(&Message::Ping { nonce }).await?;
            match connection.recv::<Message>().await? {
                Message::Pong { nonce: echoed } if echoed == nonce => Ok(()),
                other => Err(TransportError::Handshake(format!(
                    "expected pong, got {:?}",
                    other.message_type()
                ))),
            }
        };
        timeout(self.config.message_timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout)??;

        let rtt = started.elapsed();
        debug!(target = %address, rtt_ms = rtt.as_millis() as u64, "Connectivity check passed");
        Ok(rtt)
    }

    // ========================================================================
    // CONNECTION MANAGEMENT
    // ========================================================================

    /// Force-close one connection
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        self.tracker.close(id)
    }

    /// Force-close every connection bound to `peer`
    pub fn close_peer(&self, peer: &NodeId) -> usize {
        self.tracker.close_peer(peer)
    }

    pub fn connection_count(&self) -> usize {
        self.tracker.count()
    }

    pub fn anonymized_connection_count(&self) -> usize {
        self.tracker.count_route(TransportKind::Anonymized)
    }

    /// Stop listening, stop the proxy supervisor and close everything
    pub fn shutdown(&self) -> usize {
        if let Some(handle) = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        self.local_addr.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.anonymize_all.store(false, Ordering::SeqCst);
        self.proxy.stop();
        self.tracker.close_all()
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            connections_active: self.tracker.count(),
            connections_anonymized: self.anonymized_connection_count(),
            connections_outbound: self.outbound.load(Ordering::Relaxed),
            connections_inbound: self.inbound.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            connections_force_closed: self.tracker.force_closed(),
        }
    }
}

impl Drop for TransportLayer {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

/// Address to reach a local listener bound to `local`
fn loopback_for(local: SocketAddr) -> PeerAddress {
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    PeerAddress::from(SocketAddr::new(ip, local.port()))
}
