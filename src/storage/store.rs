// NodeStore - Persistent node state using sled
//
// Provides typed access for storing:
// - The node identity keypair
// - The post tree used by PostStore
// - The bootstrap cache (peers known at last shutdown)

use crate::identity::Keypair;
use crate::peer::PeerInfo;
use std::path::Path;
use thiserror::Error;

/// Key prefixes for organizing data
mod keys {
    pub const IDENTITY_KEYPAIR: &[u8] = b"identity:keypair";
    pub const PEER_CACHE: &[u8] = b"peers:bootstrap_cache";
    pub const POSTS_TREE: &str = "posts";
    pub const PRUNED_TREE: &str = "posts_pruned";
}

/// Errors from storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    OpenFailed(String),

    #[error("Database operation failed: {0}")]
    DatabaseError(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Flush failed: {0}")]
    FlushFailed(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::DatabaseError(err.to_string())
    }
}

/// Statistics about the storage
#[derive(Clone, Debug)]
pub struct StorageStats {
    /// Number of keys in the default tree
    pub key_count: usize,
    /// Approximate disk size in bytes
    pub disk_size_bytes: u64,
    /// Whether the database lives only in memory
    pub temporary: bool,
}

/// Persistent key-value store for node data
///
/// Uses sled for crash-safe, embedded storage.
/// All writes are atomic and durable after flush.
pub struct NodeStore {
    db: sled::Db,
    temporary: bool,
}

impl NodeStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::OpenFailed(e.to_string()))?;
        Ok(Self { db, temporary: false })
    }

    /// Open an in-memory store that is discarded on drop
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::OpenFailed(e.to_string()))?;
        Ok(Self { db, temporary: true })
    }

    /// Open at `path` when given, otherwise in memory
    pub fn open_or_temporary<P: AsRef<Path>>(path: Option<P>) -> Result<Self, StoreError> {
        match path {
            Some(path) => Self::open(path),
            None => Self::temporary(),
        }
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.db.is_empty())
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::FlushFailed(e.to_string()))?;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> Result<StorageStats, StoreError> {
        Ok(StorageStats {
            key_count: self.db.len(),
            disk_size_bytes: self.db.size_on_disk().unwrap_or(0),
            temporary: self.temporary,
        })
    }

    /// Tree holding posts, keyed by post id
    pub fn posts_tree(&self) -> Result<sled::Tree, StoreError> {
        Ok(self.db.open_tree(keys::POSTS_TREE)?)
    }

    /// Tree holding ids of posts dropped by retention
    pub fn pruned_tree(&self) -> Result<sled::Tree, StoreError> {
        Ok(self.db.open_tree(keys::PRUNED_TREE)?)
    }

    fn put_raw(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    // ========================================================================
    // IDENTITY PERSISTENCE
    // ========================================================================

    /// Save the node keypair
    pub fn save_keypair(&self, keypair: &Keypair) -> Result<(), StoreError> {
        self.put_raw(keys::IDENTITY_KEYPAIR, &keypair.to_bytes())
    }

    /// Load the node keypair
    pub fn load_keypair(&self) -> Result<Option<Keypair>, StoreError> {
        match self.get_raw(keys::IDENTITY_KEYPAIR)? {
            Some(bytes) => {
                let keypair = Keypair::from_bytes(&bytes)
                    .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?;
                Ok(Some(keypair))
            }
            None => Ok(None),
        }
    }

    /// Get the node keypair, creating one if it doesn't exist
    pub fn get_or_create_keypair(&self) -> Result<Keypair, StoreError> {
        if let Some(keypair) = self.load_keypair()? {
            return Ok(keypair);
        }

        let keypair = Keypair::generate();
        self.save_keypair(&keypair)?;
        Ok(keypair)
    }

    // ========================================================================
    // BOOTSTRAP CACHE
    // ========================================================================

    /// Replace the cached peer list
    pub fn save_peer_cache(&self, peers: &[PeerInfo]) -> Result<(), StoreError> {
        let bytes = postcard::to_allocvec(peers)
            .map_err(|e| StoreError::SerializationFailed(e.to_string()))?;
        self.put_raw(keys::PEER_CACHE, &bytes)
    }

    /// Peers saved at last shutdown, empty if none
    pub fn load_peer_cache(&self) -> Result<Vec<PeerInfo>, StoreError> {
        match self.get_raw(keys::PEER_CACHE)? {
            Some(bytes) => postcard::from_bytes(&bytes)
                .map_err(|e| StoreError::DeserializationFailed(e.to_string())),
            None => Ok(Vec::new()),
        }
    }
}
