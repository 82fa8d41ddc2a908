// Protocol - Message types for post synchronization
//
// Defines the wire format for all messages exchanged between nodes:
// - Hello: session handshake (Ping/Pong instead of Hello is a connectivity check)
// - Digest/Inventory/Want: anti-entropy; each side pulls what it lacks
// - Posts/Ack: push propagation with per-batch acknowledgement
// - PeerRequest/PeerList: peer exchange

use crate::identity::NodeId;
use crate::peer::PeerInfo;
use crate::post::{Post, PostId, StoreDigest};
use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PROTOCOL_VERSION: u16 = 1;

/// Types of messages in the protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Hello,
    Ping,
    Pong,
    Digest,
    Inventory,
    Want,
    Posts,
    Ack,
    PeerRequest,
    PeerList,
}

/// Protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),
}

/// First message of a session, sent by both sides
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub node_id: NodeId,
    pub protocol_version: u16,
    /// Port the sender accepts connections on
    pub listen_port: u16,
    /// Host to dial the sender at; the observed address is used when absent
    pub advertised_host: Option<String>,
    pub transport_kind: TransportKind,
    /// Network secret, when the receiving node requires one
    pub shared_secret: Option<String>,
}

/// Wrapper for all message types
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Hello(Hello),
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    /// Summary of the sender's post set; `reply` is set when answering a digest
    Digest { digest: StoreDigest, reply: bool },
    /// A chunk of the ids the sender holds
    Inventory { ids: Vec<PostId> },
    /// Ids the sender is missing
    Want { ids: Vec<PostId> },
    Posts { batch_id: u64, posts: Vec<Post> },
    Ack { batch_id: u64 },
    PeerRequest,
    PeerList { peers: Vec<PeerInfo> },
}

impl Message {
    /// Get the message type
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::Ping { .. } => MessageType::Ping,
            Message::Pong { .. } => MessageType::Pong,
            Message::Digest { .. } => MessageType::Digest,
            Message::Inventory { .. } => MessageType::Inventory,
            Message::Want { .. } => MessageType::Want,
            Message::Posts { .. } => MessageType::Posts,
            Message::Ack { .. } => MessageType::Ack,
            Message::PeerRequest => MessageType::PeerRequest,
            Message::PeerList { .. } => MessageType::PeerList,
        }
    }

    /// Serialize to bytes using postcard
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        postcard::to_allocvec(self).map_err(|e| ProtocolError::SerializationFailed(e.to_string()))
    }

    /// Deserialize from bytes using postcard
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        postcard::from_bytes(bytes).map_err(|e| ProtocolError::DeserializationFailed(e.to_string()))
    }
}
