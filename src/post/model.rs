use crate::identity::NodeId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Unique identifier for a post (SHA256 over its fields)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PostId([u8; 32]);

impl PostId {
    /// Create a PostId from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(array))
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PostId({})", &self.to_hex()[..12])
    }
}

/// A short pseudonymous post
///
/// Immutable once built. The id is a pure function of the other four
/// fields, so two nodes that hold "the same" post always agree on its id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    id: PostId,
    content: String,
    timestamp: u64,
    pseudonym: String,
    origin: NodeId,
}

impl Post {
    /// Build a post and derive its id
    pub fn new(
        content: impl Into<String>,
        pseudonym: impl Into<String>,
        timestamp: u64,
        origin: NodeId,
    ) -> Self {
        let content = content.into();
        let pseudonym = pseudonym.into();
        let id = Self::compute_id(&content, &pseudonym, timestamp, &origin);
        Self {
            id,
            content,
            timestamp,
            pseudonym,
            origin,
        }
    }

    /// Reassemble a post whose id was carried alongside it
    ///
    /// The id is NOT checked here; use [`Post::has_valid_id`] before trusting it.
    pub fn from_parts(
        id: PostId,
        content: impl Into<String>,
        pseudonym: impl Into<String>,
        timestamp: u64,
        origin: NodeId,
    ) -> Self {
        Self {
            id,
            content: content.into(),
            timestamp,
            pseudonym: pseudonym.into(),
            origin,
        }
    }

    /// Derive the id from post fields
    pub fn compute_id(content: &str, pseudonym: &str, timestamp: u64, origin: &NodeId) -> PostId {
        let mut bytes = Vec::with_capacity(content.len() + pseudonym.len() + 56);
        bytes.extend_from_slice(b"post:");

        bytes.extend_from_slice(&(content.len() as u32).to_le_bytes());
        bytes.extend_from_slice(content.as_bytes());

        bytes.extend_from_slice(&(pseudonym.len() as u32).to_le_bytes());
        bytes.extend_from_slice(pseudonym.as_bytes());

        bytes.extend_from_slice(origin.as_bytes());
        bytes.extend_from_slice(&timestamp.to_le_bytes());

        PostId(Sha256::digest(&bytes).into())
    }

    pub fn id(&self) -> PostId {
        self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Origin-assigned Unix time in seconds
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn pseudonym(&self) -> &str {
        &self.pseudonym
    }

    /// Node that authored the post
    pub fn origin(&self) -> &NodeId {
        &self.origin
    }

    /// Whether the carried id matches the fields
    pub fn has_valid_id(&self) -> bool {
        self.id == Self::compute_id(&self.content, &self.pseudonym, self.timestamp, &self.origin)
    }

    /// Serialize to bytes using postcard
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Deserialize from bytes using postcard
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// Ordering used by every post listing: newest first, ties by id
pub fn feed_order(a: &Post, b: &Post) -> std::cmp::Ordering {
    b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id))
}
