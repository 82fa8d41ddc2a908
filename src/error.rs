// Error taxonomy surfaced by the node controller
//
// Component errors stay typed inside their modules; the controller maps
// them onto the four failure classes callers act on, plus peer, storage
// and lifecycle errors.

use crate::discovery::{DiscoveryError, TokenError};
use crate::peer::PeerError;
use crate::post::PostError;
use crate::storage::StoreError;
use crate::transport::TransportError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// Bad caller input; never retried
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Timeout, refusal or proxy failure; retried internally under backoff
    #[error("Connectivity error: {0}")]
    Connectivity(#[from] TransportError),

    /// Malformed or unsupported discovery token
    #[error("Decode error: {0}")]
    Decode(#[from] TokenError),

    /// Remote data that contradicts its own id
    #[error("Corrupt data: {0}")]
    Corruption(String),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Operation {operation} not allowed while {state}")]
    InvalidState { operation: &'static str, state: String },
}

impl MeshError {
    /// Whether repeating the operation later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            MeshError::Connectivity(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, MeshError::Validation(_))
    }
}

impl From<PostError> for MeshError {
    fn from(err: PostError) -> Self {
        if err.is_validation() {
            MeshError::Validation(err.to_string())
        } else if err.is_corruption() {
            MeshError::Corruption(err.to_string())
        } else {
            MeshError::Storage(err.to_string())
        }
    }
}

impl From<DiscoveryError> for MeshError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::Token(e) => MeshError::Decode(e),
            DiscoveryError::SelfToken => MeshError::Validation(err.to_string()),
            DiscoveryError::Registry(e) => MeshError::Peer(e),
        }
    }
}

impl From<StoreError> for MeshError {
    fn from(err: StoreError) -> Self {
        MeshError::Storage(err.to_string())
    }
}
