// PostStore - Durable record of posts, deduplicated by id
//
// Backed by a sled tree keyed by post id. Every insert is an atomic
// insert-if-absent, so concurrent ingestion of the same post from two
// peers yields exactly one "new". With a retention cap, the oldest posts
// are pruned and their ids kept as tombstones so peers cannot feed them
// back in.

use super::model::feed_order;
use super::{Post, PostError, PostId, PostPolicy, PostValidator};
use crate::identity::NodeId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Compact summary of a store's contents, exchanged during anti-entropy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDigest {
    /// Number of posts
    pub count: u64,
    /// SHA256 over the sorted id list
    pub root: [u8; 32],
    /// Newest post timestamp (0 when empty)
    pub watermark: u64,
}

impl StoreDigest {
    pub fn empty() -> Self {
        Self {
            count: 0,
            root: Sha256::digest(b"").into(),
            watermark: 0,
        }
    }
}

/// Local post store
#[derive(Clone)]
pub struct PostStore {
    tree: sled::Tree,
    pruned: sled::Tree,
    origin: NodeId,
    validator: PostValidator,
}

impl PostStore {
    /// Wrap opened sled trees for posts and pruned-id tombstones
    pub fn new(tree: sled::Tree, pruned: sled::Tree, origin: NodeId, policy: PostPolicy) -> Self {
        Self {
            tree,
            pruned,
            origin,
            validator: PostValidator::new(policy),
        }
    }

    /// In-memory store, discarded on drop
    pub fn temporary(origin: NodeId, policy: PostPolicy) -> Result<Self, PostError> {
        let db = sled::Config::new().temporary(true).open()?;
        let tree = db.open_tree("posts")?;
        let pruned = db.open_tree("posts_pruned")?;
        Ok(Self::new(tree, pruned, origin, policy))
    }

    pub fn origin(&self) -> &NodeId {
        &self.origin
    }

    pub fn policy(&self) -> &PostPolicy {
        self.validator.policy()
    }

    // ========================================================================
    // LOCAL AUTHORING
    // ========================================================================

    /// Author a post stamped with the current time
    pub fn create(&self, content: &str, pseudonym: &str) -> Result<Post, PostError> {
        self.create_at(content, pseudonym, unix_now())
    }

    /// Author a post with an explicit timestamp
    ///
    /// Re-creating identical content, pseudonym and timestamp returns the
    /// stored post without duplicating it.
    pub fn create_at(&self, content: &str, pseudonym: &str, timestamp: u64) -> Result<Post, PostError> {
        let pseudonym = self.validator.validate_local(content, pseudonym)?;
        let post = Post::new(content, pseudonym, timestamp, self.origin);

        if self.insert_if_absent(&post)? {
            debug!(post = %post.id(), "Created post");
        }
        Ok(post)
    }

    // ========================================================================
    // REMOTE INGESTION
    // ========================================================================

    /// Ingest a post received from a peer
    ///
    /// Returns true if the post is new and retained. Rejected posts are
    /// never stored.
    pub fn ingest_remote(&self, post: Post) -> Result<bool, PostError> {
        self.validator.validate_remote(&post, unix_now())?;
        self.insert_if_absent(&post)
    }

    fn insert_if_absent(&self, post: &Post) -> Result<bool, PostError> {
        if self.pruned.contains_key(post.id().as_bytes())? {
            return Ok(false);
        }
        if !self.swap_in(post)? {
            return Ok(false);
        }
        if self.prune()? > 0 {
            // The new post may itself have been the oldest
            return Ok(self.tree.contains_key(post.id().as_bytes())?);
        }
        Ok(true)
    }

    fn swap_in(&self, post: &Post) -> Result<bool, PostError> {
        let bytes = post
            .to_bytes()
            .map_err(|e| PostError::Storage(e.to_string()))?;

        match self
            .tree
            .compare_and_swap(post.id().as_bytes(), None as Option<&[u8]>, Some(bytes))?
        {
            Ok(()) => Ok(true),
            Err(cas) => {
                let existing = cas
                    .current
                    .map(|v| Post::from_bytes(&v))
                    .transpose()
                    .map_err(|e| PostError::Storage(e.to_string()))?;

                match existing {
                    Some(stored) if stored != *post => {
                        warn!(post = %post.id(), "Post id collides with different stored fields");
                        Err(PostError::Conflict(post.id()))
                    }
                    _ => Ok(false),
                }
            }
        }
    }

    // ========================================================================
    // RETENTION
    // ========================================================================

    /// Drop the oldest posts beyond `max_posts`; returns how many went
    pub fn prune(&self) -> Result<usize, PostError> {
        let Some(max) = self.policy().max_posts else {
            return Ok(0);
        };
        let excess = self.tree.len().saturating_sub(max);
        if excess == 0 {
            return Ok(0);
        }

        let mut removed = 0;
        for post in self.get_all()?.iter().rev().take(excess) {
            let key = post.id();
            self.pruned.insert(key.as_bytes(), Vec::new())?;
            if self.tree.remove(key.as_bytes())?.is_some() {
                removed += 1;
            }
        }
        debug!(removed, kept = self.tree.len(), "Pruned oldest posts");
        Ok(removed)
    }

    /// Whether the post was dropped by retention
    pub fn is_pruned(&self, id: &PostId) -> Result<bool, PostError> {
        Ok(self.pruned.contains_key(id.as_bytes())?)
    }

    pub fn pruned_count(&self) -> usize {
        self.pruned.len()
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// All posts, newest first; equal timestamps ordered by id
    pub fn get_all(&self) -> Result<Vec<Post>, PostError> {
        let mut posts = Vec::with_capacity(self.tree.len());
        for entry in self.tree.iter() {
            let (_, value) = entry?;
            posts.push(decode(&value)?);
        }
        posts.sort_by(feed_order);
        Ok(posts)
    }

    pub fn get(&self, id: &PostId) -> Result<Option<Post>, PostError> {
        self.tree
            .get(id.as_bytes())?
            .map(|v| decode(&v))
            .transpose()
    }

    pub fn contains(&self, id: &PostId) -> Result<bool, PostError> {
        Ok(self.tree.contains_key(id.as_bytes())?)
    }

    /// Stored or pruned; either way there is nothing to fetch
    pub fn knows(&self, id: &PostId) -> Result<bool, PostError> {
        Ok(self.contains(id)? || self.is_pruned(id)?)
    }

    /// Every stored id in ascending order
    pub fn ids(&self) -> Result<Vec<PostId>, PostError> {
        let mut ids = Vec::with_capacity(self.tree.len());
        for key in self.tree.iter().keys() {
            ids.push(key_to_id(&key?)?);
        }
        Ok(ids)
    }

    /// Look up several posts, skipping unknown ids
    pub fn posts_by_ids(&self, ids: &[PostId]) -> Result<Vec<Post>, PostError> {
        let mut posts = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(post) = self.get(id)? {
                posts.push(post);
            }
        }
        Ok(posts)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Summarize the store for anti-entropy
    pub fn digest(&self) -> Result<StoreDigest, PostError> {
        let mut hasher = Sha256::new();
        let mut count = 0u64;
        let mut watermark = 0u64;

        for entry in self.tree.iter() {
            let (key, value) = entry?;
            hasher.update(&key);
            watermark = watermark.max(decode(&value)?.timestamp());
            count += 1;
        }

        Ok(StoreDigest {
            count,
            root: hasher.finalize().into(),
            watermark,
        })
    }

    pub fn flush(&self) -> Result<(), PostError> {
        self.tree.flush()?;
        self.pruned.flush()?;
        Ok(())
    }
}

fn decode(bytes: &[u8]) -> Result<Post, PostError> {
    Post::from_bytes(bytes).map_err(|e| PostError::Storage(format!("corrupt post record: {}", e)))
}

fn key_to_id(key: &[u8]) -> Result<PostId, PostError> {
    let bytes: [u8; 32] = key
        .try_into()
        .map_err(|_| PostError::Storage(format!("bad post key length {}", key.len())))?;
    Ok(PostId::from_bytes(bytes))
}

/// Current Unix time in seconds
pub(crate) fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
