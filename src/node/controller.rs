// Network Controller - the node as callers see it
//
// Wires storage, post store, registry, transport, discovery and sync
// together and enforces the lifecycle:
//   init -> Initialized -> start -> Started -> stop -> Stopped
// Stopped is terminal; a new controller is needed to run again.

use super::{ControllerState, NetworkStatus, NodeConfig};
use crate::discovery::{DiscoveryService, LanDiscovery};
use crate::error::MeshError;
use crate::identity::NodeId;
use crate::peer::{Peer, PeerError, PeerInfo, PeerRegistry};
use crate::post::{Post, PostStore};
use crate::storage::NodeStore;
use crate::sync::{LocalEndpoint, SyncEngine, SyncStats};
use crate::transport::{
    Dialer, PeerAddress, ProxyConnector, Socks5Proxy, TcpDialer, TransportKind, TransportLayer,
    TransportStats,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct NetworkController {
    config: NodeConfig,
    node_id: NodeId,
    storage: NodeStore,
    posts: PostStore,
    registry: Arc<PeerRegistry>,
    transport: Arc<TransportLayer>,
    discovery: DiscoveryService,
    lan: LanDiscovery,
    engine: SyncEngine,
    /// Handed to the sync engine on start
    dial_requests: Mutex<Option<mpsc::UnboundedReceiver<NodeId>>>,
    state: Mutex<ControllerState>,
    cleaned_up: AtomicBool,
}

impl NetworkController {
    // ========================================================================
    // INITIALIZATION
    // ========================================================================

    /// Build a node listening on `port` with the proxy at `proxy_port`
    ///
    /// No I/O is started; identity and posts live in memory.
    pub fn init(port: u16, proxy_port: u16) -> Result<Self, MeshError> {
        Self::with_config(NodeConfig::new(port, proxy_port))
    }

    /// Build a node with TCP dialing and a SOCKS5 proxy at the configured address
    pub fn with_config(config: NodeConfig) -> Result<Self, MeshError> {
        let proxy = Socks5Proxy::new(config.transport.proxy_host.clone(), config.proxy_port());
        Self::init_with(config, Arc::new(TcpDialer::new()), Arc::new(proxy))
    }

    /// Build a node with injected transport capabilities
    pub fn init_with(
        config: NodeConfig,
        dialer: Arc<dyn Dialer>,
        proxy: Arc<dyn ProxyConnector>,
    ) -> Result<Self, MeshError> {
        config.validate()?;

        let storage = NodeStore::open_or_temporary(config.data_dir())?;
        let keypair = Arc::new(storage.get_or_create_keypair()?);
        let node_id = NodeId::from_public_key(&keypair.public_key());

        let posts = PostStore::new(
            storage.posts_tree()?,
            storage.pruned_tree()?,
            node_id,
            config.posts.clone(),
        );
        let registry = Arc::new(PeerRegistry::new(node_id, config.registry.clone()));
        let restored = match storage.load_peer_cache() {
            Ok(cached) => registry.import(cached),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable bootstrap cache");
                0
            }
        };

        let transport = Arc::new(TransportLayer::new(
            config.transport.clone(),
            Arc::clone(&registry),
            dialer,
            proxy,
        ));
        let (discovery, dial_requests) = DiscoveryService::new(Arc::clone(&keypair), Arc::clone(&registry));
        let lan = discovery.lan(config.lan.clone());
        let local = LocalEndpoint {
            advertised_host: config.advertised_host.clone(),
            shared_secret: config.shared_secret.clone(),
        };
        let engine = SyncEngine::new(
            config.gossip.clone(),
            local,
            posts.clone(),
            Arc::clone(&registry),
            Arc::clone(&transport),
        );

        info!(
            node = %node_id,
            port = config.port(),
            proxy_port = config.proxy_port(),
            posts = posts.len(),
            restored_peers = restored,
            persistent = !storage.is_temporary(),
            "Node initialized"
        );

        Ok(Self {
            config,
            node_id,
            storage,
            posts,
            registry,
            transport,
            discovery,
            lan,
            engine,
            dial_requests: Mutex::new(Some(dial_requests)),
            state: Mutex::new(ControllerState::Initialized),
            cleaned_up: AtomicBool::new(false),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ControllerState {
        *self.lock_state()
    }

    fn require_live(&self, operation: &'static str) -> Result<(), MeshError> {
        match self.state() {
            ControllerState::Stopped => Err(MeshError::InvalidState {
                operation,
                state: ControllerState::Stopped.to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Bind the listener and start syncing; a no-op when already started
    pub async fn start(&self) -> Result<(), MeshError> {
        self.require_live("start")?;
        let Some(dial_requests) = self
            .dial_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            // Already started, or a concurrent start holds the receiver
            return Ok(());
        };

        let incoming = match self.transport.listen().await {
            Ok(incoming) => incoming,
            Err(e) => {
                *self.dial_requests.lock().unwrap_or_else(PoisonError::into_inner) = Some(dial_requests);
                return Err(e.into());
            }
        };
        {
            let mut state = self.lock_state();
            if *state == ControllerState::Stopped {
                drop(state);
                return Err(self.abort_start());
            }
            self.engine.start(incoming, dial_requests);
            *state = ControllerState::Started;
        }

        if self.config.anonymize_on_start {
            if let Err(e) = self.transport.enable_anonymization().await {
                warn!(error = %e, "Could not enable anonymization at start; routing directly");
            }
            if self.state() == ControllerState::Stopped {
                return Err(self.abort_start());
            }
        }

        if self.config.lan.enabled {
            let port = self.transport.local_addr().map(|addr| addr.port()).unwrap_or(self.config.port());
            match self.lan.start(self.config.advertised_host.clone(), port).await {
                Ok(addr) => debug!(address = %addr, "LAN discovery bound"),
                Err(e) => warn!(error = %e, "LAN discovery unavailable"),
            }
            if self.state() == ControllerState::Stopped {
                return Err(self.abort_start());
            }
        }

        info!(
            node = %self.node_id,
            address = ?self.transport.local_addr(),
            anonymized = self.transport.is_anonymization_enabled(),
            "Node started"
        );
        Ok(())
    }

    /// Undo whatever a start raced with `stop` brought up
    fn abort_start(&self) -> MeshError {
        self.lan.stop();
        self.transport.shutdown();
        debug!(node = %self.node_id, "Stopped while starting");
        MeshError::InvalidState {
            operation: "start",
            state: ControllerState::Stopped.to_string(),
        }
    }

    /// Stop syncing, close connections and save the bootstrap cache
    pub fn stop(&self) {
        {
            let mut state = self.lock_state();
            if *state == ControllerState::Stopped {
                return;
            }
            *state = ControllerState::Stopped;
        }

        self.engine.stop();
        self.lan.stop();
        let closed = self.transport.shutdown();
        self.save_peer_cache();
        if let Err(e) = self.posts.flush() {
            warn!(error = %e, "Failed to flush posts");
        }
        info!(node = %self.node_id, closed, "Node stopped");
    }

    /// Release everything; later calls do nothing
    pub fn cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop();
        if let Err(e) = self.storage.flush() {
            warn!(error = %e, "Failed to flush node store");
        }
        debug!(node = %self.node_id, "Cleaned up");
    }

    fn save_peer_cache(&self) {
        let peers = self.registry.export();
        match self.storage.save_peer_cache(&peers) {
            Ok(()) => debug!(count = peers.len(), "Saved bootstrap cache"),
            Err(e) => warn!(error = %e, "Failed to save bootstrap cache"),
        }
    }

    // ========================================================================
    // POSTS
    // ========================================================================

    /// Validate, store and announce a post
    ///
    /// A blank pseudonym becomes the configured default.
    pub fn create_post(&self, content: &str, pseudonym: &str) -> Result<Post, MeshError> {
        self.require_live("create_post")?;
        let post = self.posts.create(content, pseudonym)?;
        self.engine.announce(&post);
        info!(post = %post.id(), pseudonym = post.pseudonym(), "Created post");
        Ok(post)
    }

    /// Every stored post, newest first
    ///
    /// Each call returns an independent copy.
    pub fn get_posts(&self) -> Result<Vec<Post>, MeshError> {
        Ok(self.posts.get_all()?)
    }

    // ========================================================================
    // STATUS
    // ========================================================================

    pub fn status(&self) -> NetworkStatus {
        let state = self.state();
        let peers = self.registry.stats();
        NetworkStatus {
            state,
            node_id: self.node_id.to_hex(),
            network_enabled: state == ControllerState::Started && self.transport.is_listening(),
            anonymization_enabled: self.transport.is_anonymization_enabled(),
            proxy_state: self.transport.proxy_state(),
            peers_count: peers.connected,
            discovery_peers_count: peers.known,
            cold_peers_count: peers.cold,
            anonymized_connections: self.transport.anonymized_connection_count(),
            port: self
                .transport
                .local_addr()
                .map(|addr| addr.port())
                .unwrap_or(self.config.port()),
            proxy_port: self.config.proxy_port(),
            posts_count: self.posts.len(),
            degraded: peers.degraded,
            last_sync: self.engine.stats().last_sync,
        }
    }

    /// Same as [`NetworkController::status`]
    pub fn get_network_status(&self) -> NetworkStatus {
        self.status()
    }

    /// Known peers, in id order
    pub fn peers(&self) -> Vec<Peer> {
        self.registry.list_known()
    }

    /// Forget a peer and close its connections
    ///
    /// The peer comes back only if it is discovered again.
    pub fn remove_peer(&self, peer_id: &NodeId) -> Result<Peer, MeshError> {
        self.require_live("remove_peer")?;
        let peer = self.registry.remove(peer_id).ok_or(PeerError::PeerNotFound)?;
        let closed = self.transport.close_peer(peer_id);
        info!(peer = %peer_id, closed, "Peer removed");
        Ok(peer)
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.engine.stats()
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// Run an anti-entropy round immediately
    pub fn sync_now(&self) {
        if self.state() == ControllerState::Started {
            self.engine.sync_round();
        }
    }

    // ========================================================================
    // ANONYMIZATION
    // ========================================================================

    pub async fn enable_anonymization(&self) -> Result<(), MeshError> {
        self.require_live("enable_anonymization")?;
        self.transport.enable_anonymization().await?;
        Ok(())
    }

    /// Returns the number of anonymized connections closed
    pub async fn disable_anonymization(&self) -> Result<usize, MeshError> {
        self.require_live("disable_anonymization")?;
        Ok(self.transport.disable_anonymization().await)
    }

    // ========================================================================
    // DISCOVERY
    // ========================================================================

    /// Bootstrap info other nodes need to reach this one
    pub fn self_info(&self) -> PeerInfo {
        let port = self
            .transport
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.config.port());
        let host = self
            .config
            .advertised_host
            .clone()
            .unwrap_or_else(|| dialable_host(&self.config.transport.bind_address));
        let address = PeerAddress::new(host, port);

        let kind = if address.is_onion() || self.transport.is_anonymization_enabled() {
            TransportKind::Anonymized
        } else {
            TransportKind::Direct
        };
        let info = PeerInfo::new(self.node_id, address, kind);
        match &self.config.shared_secret {
            Some(secret) => info.with_shared_secret(secret.clone()),
            None => info,
        }
    }

    pub fn generate_discovery_token(&self) -> Result<String, MeshError> {
        Ok(self.discovery.generate_token(&self.self_info())?)
    }

    /// Register the peer a token describes and request a connection
    ///
    /// Before start the request waits until the node starts.
    pub fn parse_discovery_token(&self, data: &str) -> Result<PeerInfo, MeshError> {
        self.require_live("parse_discovery_token")?;
        Ok(self.discovery.parse_token(data)?)
    }

    /// Round trip through our own listener
    pub async fn test_p2p_network(&self) -> Result<Duration, MeshError> {
        if self.state() != ControllerState::Started {
            return Err(MeshError::InvalidState {
                operation: "test_p2p_network",
                state: self.state().to_string(),
            });
        }
        let rtt = self.transport.test_connectivity(None).await?;
        info!(rtt_ms = rtt.as_millis() as u64, "Network self-test passed");
        Ok(rtt)
    }
}

impl Drop for NetworkController {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// A wildcard bind address is not dialable; fall back to loopback
fn dialable_host(bind_address: &str) -> String {
    match bind_address.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => {
            if ip.is_ipv4() {
                "127.0.0.1".to_string()
            } else {
                "::1".to_string()
            }
        }
        _ => bind_address.to_string(),
    }
}
