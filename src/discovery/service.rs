use super::token::{self, TokenError};
use crate::identity::{Keypair, NodeId};
use crate::peer::{PeerError, PeerInfo, PeerRegistry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("Token describes this node")]
    SelfToken,

    #[error(transparent)]
    Registry(#[from] PeerError),
}

/// Out-of-band bootstrap: turns tokens into registry entries and dial requests
///
/// Dial requests go to whoever holds the receiver returned by [`DiscoveryService::new`]
/// (the sync engine); requests made before it starts are buffered.
pub struct DiscoveryService {
    keypair: Arc<Keypair>,
    registry: Arc<PeerRegistry>,
    dial_requests: mpsc::UnboundedSender<NodeId>,
    bootstrapped: AtomicU64,
}

impl DiscoveryService {
    pub fn new(keypair: Arc<Keypair>, registry: Arc<PeerRegistry>) -> (Self, mpsc::UnboundedReceiver<NodeId>) {
        let (dial_requests, rx) = mpsc::unbounded_channel();
        let service = Self {
            keypair,
            registry,
            dial_requests,
            bootstrapped: AtomicU64::new(0),
        };
        (service, rx)
    }

    /// Encode this node's bootstrap info
    pub fn generate_token(&self, self_info: &PeerInfo) -> Result<String, DiscoveryError> {
        Ok(token::generate_token(self_info, &self.keypair)?)
    }

    /// Decode a peer's token, register the peer and request a connection
    pub fn parse_token(&self, data: &str) -> Result<PeerInfo, DiscoveryError> {
        let info = token::parse_token(data)?;
        if info.peer_id() == self.registry.my_node_id() {
            return Err(DiscoveryError::SelfToken);
        }

        self.registry.upsert(info.clone())?;
        self.bootstrapped.fetch_add(1, Ordering::Relaxed);

        if self.dial_requests.send(*info.peer_id()).is_err() {
            debug!(peer = %info.peer_id(), "Dial consumer gone; peer waits for the next sync round");
        }
        info!(
            peer = %info.peer_id(),
            address = %info.address(),
            transport = %info.transport_kind(),
            "Bootstrapped peer from token"
        );
        Ok(info)
    }

    pub(super) fn parts(&self) -> (Arc<Keypair>, Arc<PeerRegistry>, mpsc::UnboundedSender<NodeId>) {
        (
            Arc::clone(&self.keypair),
            Arc::clone(&self.registry),
            self.dial_requests.clone(),
        )
    }

    /// Tokens accepted so far
    pub fn bootstrapped_count(&self) -> u64 {
        self.bootstrapped.load(Ordering::Relaxed)
    }
}
