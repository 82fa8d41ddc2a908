// LAN discovery - signed UDP announces between nodes on one network
//
// Each node periodically sends an Announce to its targets (the subnet
// broadcast address by default) and answers every Announce it hears with
// a Response. Both carry the sender's public key and a signature, so only
// nodes that own their id are registered. LAN-only peers that fall silent
// and never connected are forgotten after `peer_timeout`.

use super::service::DiscoveryService;
use crate::identity::{Keypair, NodeId, PublicKey};
use crate::peer::{now_ms, PeerInfo, PeerRegistry, PeerState};
use crate::transport::{PeerAddress, TransportKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const DEFAULT_LAN_PORT: u16 = 8889;
const MAX_DATAGRAM: usize = 1024;
const SIGNING_TAG: &[u8] = b"postmesh-lan:v1:";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LanError {
    #[error("Malformed announce: {0}")]
    Malformed(String),

    #[error("Announce signature does not verify")]
    BadSignature,

    #[error("Announce node id does not belong to its key")]
    IdentityMismatch,

    #[error("Announce timestamp {0} outside the accepted window")]
    Stale(u64),

    #[error("LAN discovery already running")]
    AlreadyRunning,

    #[error("Socket error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LanError {
    fn from(e: std::io::Error) -> Self {
        LanError::Io(e.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnnounceKind {
    Announce,
    Response,
}

/// What a node tells the local network about itself
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    pub kind: AnnounceKind,
    pub node_id: NodeId,
    /// Host to dial; the datagram's source address when absent
    pub host: Option<String>,
    pub port: u16,
    /// Unix milliseconds at the sender
    pub timestamp: u64,
    pub public_key: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct SignedAnnounce {
    body: Announce,
    signature: Vec<u8>,
}

impl Announce {
    fn signing_bytes(&self) -> Result<Vec<u8>, LanError> {
        let mut bytes = SIGNING_TAG.to_vec();
        bytes.extend(postcard::to_allocvec(self).map_err(|e| LanError::Malformed(e.to_string()))?);
        Ok(bytes)
    }

    /// Sign and encode as a datagram
    pub fn seal(self, keypair: &Keypair) -> Result<Vec<u8>, LanError> {
        let signature = keypair.sign(&self.signing_bytes()?);
        let signed = SignedAnnounce { body: self, signature };
        postcard::to_allocvec(&signed).map_err(|e| LanError::Malformed(e.to_string()))
    }

    /// Decode a datagram and check identity, signature and age
    pub fn open(datagram: &[u8], now: u64, max_age: Duration) -> Result<Announce, LanError> {
        let signed: SignedAnnounce =
            postcard::from_bytes(datagram).map_err(|e| LanError::Malformed(e.to_string()))?;
        let body = signed.body;

        let public_key = PublicKey::from_bytes(&body.public_key).map_err(|e| LanError::Malformed(e.to_string()))?;
        if NodeId::from_public_key(&public_key) != body.node_id {
            return Err(LanError::IdentityMismatch);
        }
        if !public_key.verify(&body.signing_bytes()?, &signed.signature) {
            return Err(LanError::BadSignature);
        }
        if now.abs_diff(body.timestamp) > max_age.as_millis() as u64 {
            return Err(LanError::Stale(body.timestamp));
        }
        if body.port == 0 {
            return Err(LanError::Malformed("port 0".to_string()));
        }
        Ok(body)
    }
}

/// Configuration for LAN discovery
#[derive(Clone, Debug)]
pub struct LanConfig {
    /// Off unless asked for
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
    /// Where announces go; the IPv4 broadcast address on `port` when empty
    pub targets: Vec<SocketAddr>,
    pub announce_interval: Duration,
    /// Silence after which a LAN-only peer is forgotten; also the
    /// accepted announce age
    pub peer_timeout: Duration,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_LAN_PORT,
            targets: Vec::new(),
            announce_interval: Duration::from_secs(30),
            peer_timeout: Duration::from_secs(300),
        }
    }
}

impl LanConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(mut self) -> Self {
        self.enabled = true;
        self
    }

    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_target(mut self, target: SocketAddr) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval = interval;
        self
    }

    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.announce_interval.is_zero() {
            return Err("LAN announce interval cannot be 0".to_string());
        }
        if self.peer_timeout.is_zero() {
            return Err("LAN peer timeout cannot be 0".to_string());
        }
        Ok(())
    }

    /// Announce destinations; none when broadcasting on an ephemeral port
    fn announce_targets(&self) -> Vec<SocketAddr> {
        if !self.targets.is_empty() {
            return self.targets.clone();
        }
        if self.port == 0 {
            return Vec::new();
        }
        vec![SocketAddr::from((Ipv4Addr::BROADCAST, self.port))]
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LanStats {
    pub announces_sent: u64,
    pub announces_received: u64,
    pub rejected: u64,
    pub forgotten: u64,
}

/// Where this node can be dialed, as set at start
#[derive(Clone, Debug)]
struct Advertised {
    host: Option<String>,
    port: u16,
}

/// UDP discovery on the local network
pub struct LanDiscovery {
    inner: Arc<LanInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct LanInner {
    config: LanConfig,
    keypair: Arc<Keypair>,
    node_id: NodeId,
    registry: Arc<PeerRegistry>,
    dial_requests: mpsc::UnboundedSender<NodeId>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    advertised: Mutex<Option<Advertised>>,
    heard: Mutex<HashMap<NodeId, Instant>>,
    sent: AtomicU64,
    received: AtomicU64,
    rejected: AtomicU64,
    forgotten: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DiscoveryService {
    /// LAN discovery sharing this service's identity, registry and dial queue
    pub fn lan(&self, config: LanConfig) -> LanDiscovery {
        let (keypair, registry, dial_requests) = self.parts();
        let node_id = *registry.my_node_id();
        LanDiscovery {
            inner: Arc::new(LanInner {
                config,
                keypair,
                node_id,
                registry,
                dial_requests,
                socket: Mutex::new(None),
                advertised: Mutex::new(None),
                heard: Mutex::new(HashMap::new()),
                sent: AtomicU64::new(0),
                received: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                forgotten: AtomicU64::new(0),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

impl LanDiscovery {
    pub fn config(&self) -> &LanConfig {
        &self.inner.config
    }

    /// Bind the discovery socket and start announcing `port` (and `host`
    /// when set; peers otherwise use the datagram's source address)
    pub async fn start(&self, host: Option<String>, port: u16) -> Result<SocketAddr, LanError> {
        if self.is_running() {
            return Err(LanError::AlreadyRunning);
        }
        let config = &self.inner.config;
        let socket = UdpSocket::bind((config.bind_address.as_str(), config.port)).await?;
        socket.set_broadcast(true)?;
        let local = socket.local_addr()?;
        let socket = Arc::new(socket);

        *lock(&self.inner.socket) = Some(Arc::clone(&socket));
        *lock(&self.inner.advertised) = Some(Advertised { host, port });

        let handles = vec![
            tokio::spawn(Arc::clone(&self.inner).receive_loop(Arc::clone(&socket))),
            tokio::spawn(Arc::clone(&self.inner).announce_loop()),
        ];
        lock(&self.tasks).extend(handles);
        info!(address = %local, "LAN discovery started");
        Ok(local)
    }

    pub fn stop(&self) {
        let handles: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        let was_running = lock(&self.inner.socket).take().is_some();
        if was_running {
            info!("LAN discovery stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.socket).is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.socket).as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Send one announce to `target` now
    pub async fn announce_to(&self, target: SocketAddr) -> Result<(), LanError> {
        self.inner.send(AnnounceKind::Announce, target).await
    }

    /// Forget LAN-only peers silent for longer than the timeout, as of `now`
    pub fn forget_silent_at(&self, now: Instant) -> usize {
        self.inner.forget_silent(now)
    }

    /// Peers heard on the LAN within the timeout
    pub fn heard_count(&self) -> usize {
        lock(&self.inner.heard).len()
    }

    pub fn stats(&self) -> LanStats {
        let inner = &self.inner;
        LanStats {
            announces_sent: inner.sent.load(Ordering::Relaxed),
            announces_received: inner.received.load(Ordering::Relaxed),
            rejected: inner.rejected.load(Ordering::Relaxed),
            forgotten: inner.forgotten.load(Ordering::Relaxed),
        }
    }
}

impl Drop for LanDiscovery {
    fn drop(&mut self) {
        for handle in lock(&self.tasks).drain(..) {
            handle.abort();
        }
    }
}

impl LanInner {
    fn socket(&self) -> Option<Arc<UdpSocket>> {
        lock(&self.socket).clone()
    }

    fn message(&self, kind: AnnounceKind) -> Result<Vec<u8>, LanError> {
        let advertised = lock(&self.advertised)
            .clone()
            .ok_or_else(|| LanError::Io("not started".to_string()))?;
        Announce {
            kind,
            node_id: self.node_id,
            host: advertised.host,
            port: advertised.port,
            timestamp: now_ms(),
            public_key: *self.keypair.public_key().as_bytes(),
        }
        .seal(&self.keypair)
    }

    async fn send(&self, kind: AnnounceKind, target: SocketAddr) -> Result<(), LanError> {
        let socket = self.socket().ok_or_else(|| LanError::Io("not started".to_string()))?;
        let datagram = self.message(kind)?;
        socket.send_to(&datagram, target).await?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn announce_loop(self: Arc<Self>) {
        let targets = self.config.announce_targets();
        let mut ticker = interval(self.config.announce_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for target in &targets {
                if let Err(e) = self.send(AnnounceKind::Announce, *target).await {
                    debug!(target = %target, error = %e, "Announce not sent");
                }
            }
            self.forget_silent(Instant::now());
        }
    }

    async fn receive_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    let Some(announce) = self.handle_datagram(&buf[..len], from) else {
                        continue;
                    };
                    if announce.kind == AnnounceKind::Announce {
                        if let Err(e) = self.send(AnnounceKind::Response, from).await {
                            debug!(to = %from, error = %e, "Response not sent");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "LAN discovery socket error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Verify a datagram and register its sender; None for our own or
    /// rejected datagrams
    fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) -> Option<Announce> {
        let announce = match Announce::open(datagram, now_ms(), self.config.peer_timeout) {
            Ok(announce) => announce,
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(from = %from, error = %e, "Rejected LAN announce");
                return None;
            }
        };
        if announce.node_id == self.node_id {
            return None;
        }
        self.received.fetch_add(1, Ordering::Relaxed);

        let host = announce.host.clone().unwrap_or_else(|| from.ip().to_string());
        let info = PeerInfo::new(
            announce.node_id,
            PeerAddress::new(host, announce.port),
            TransportKind::Direct,
        );
        match self.registry.upsert(info) {
            Ok(state) => {
                let first = lock(&self.heard).insert(announce.node_id, Instant::now()).is_none();
                if first {
                    debug!(peer = %announce.node_id, from = %from, "Discovered peer on LAN");
                }
                if state == PeerState::Discovered && self.dial_requests.send(announce.node_id).is_err() {
                    debug!(peer = %announce.node_id, "Dial consumer gone");
                }
            }
            Err(e) => debug!(peer = %announce.node_id, error = %e, "LAN peer not registered"),
        }
        Some(announce)
    }

    fn forget_silent(&self, now: Instant) -> usize {
        let timeout = self.config.peer_timeout;
        let silent: Vec<NodeId> = {
            let mut heard = lock(&self.heard);
            let silent: Vec<NodeId> = heard
                .iter()
                .filter(|(_, last)| now.saturating_duration_since(**last) > timeout)
                .map(|(id, _)| *id)
                .collect();
            for id in &silent {
                heard.remove(id);
            }
            silent
        };

        let forgotten = silent.iter().filter(|id| self.registry.remove_idle(id)).count();
        if forgotten > 0 {
            self.forgotten.fetch_add(forgotten as u64, Ordering::Relaxed);
            debug!(forgotten, "Forgot silent LAN peers");
        }
        forgotten
    }
}
