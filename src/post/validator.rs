use super::{Post, PostId};
use thiserror::Error;

pub const DEFAULT_MAX_CONTENT_LEN: usize = 1000;
pub const DEFAULT_MAX_PSEUDONYM_LEN: usize = 64;
pub const DEFAULT_PSEUDONYM: &str = "anonymous";
pub const DEFAULT_MAX_CLOCK_SKEW_SECS: u64 = 300;

/// Errors from creating, ingesting or reading posts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PostError {
    #[error("Post content is empty")]
    EmptyContent,

    #[error("Post content too long: {len} chars (max {max})")]
    ContentTooLong { len: usize, max: usize },

    #[error("Pseudonym too long: {len} chars (max {max})")]
    PseudonymTooLong { len: usize, max: usize },

    #[error("Post timestamp {timestamp} is more than {max_skew}s ahead of local time {now}")]
    FutureTimestamp { timestamp: u64, now: u64, max_skew: u64 },

    #[error("Post {0} does not match its id")]
    IdMismatch(PostId),

    #[error("Post {0} collides with a stored post holding different fields")]
    Conflict(PostId),

    #[error("Post storage failed: {0}")]
    Storage(String),
}

impl PostError {
    /// Bad input, never worth retrying
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PostError::EmptyContent
                | PostError::ContentTooLong { .. }
                | PostError::PseudonymTooLong { .. }
                | PostError::FutureTimestamp { .. }
        )
    }

    /// A remote post that lies about its id
    pub fn is_corruption(&self) -> bool {
        matches!(self, PostError::IdMismatch(_) | PostError::Conflict(_))
    }
}

impl From<sled::Error> for PostError {
    fn from(err: sled::Error) -> Self {
        PostError::Storage(err.to_string())
    }
}

/// Limits applied to local and remote posts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostPolicy {
    /// Maximum content length in characters
    pub max_content_len: usize,
    /// Maximum pseudonym length in characters
    pub max_pseudonym_len: usize,
    /// Substituted for a blank pseudonym on local posts
    pub default_pseudonym: String,
    /// How far ahead of local time a remote timestamp may be
    pub max_clock_skew_secs: u64,
    /// Retention cap; the oldest posts are pruned beyond it
    pub max_posts: Option<usize>,
}

impl Default for PostPolicy {
    fn default() -> Self {
        Self {
            max_content_len: DEFAULT_MAX_CONTENT_LEN,
            max_pseudonym_len: DEFAULT_MAX_PSEUDONYM_LEN,
            default_pseudonym: DEFAULT_PSEUDONYM.to_string(),
            max_clock_skew_secs: DEFAULT_MAX_CLOCK_SKEW_SECS,
            max_posts: None,
        }
    }
}

impl PostPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_content_len(mut self, len: usize) -> Self {
        self.max_content_len = len;
        self
    }

    pub fn with_max_pseudonym_len(mut self, len: usize) -> Self {
        self.max_pseudonym_len = len;
        self
    }

    pub fn with_default_pseudonym(mut self, pseudonym: impl Into<String>) -> Self {
        self.default_pseudonym = pseudonym.into();
        self
    }

    pub fn with_max_clock_skew_secs(mut self, secs: u64) -> Self {
        self.max_clock_skew_secs = secs;
        self
    }

    pub fn with_max_posts(mut self, max: usize) -> Self {
        self.max_posts = Some(max);
        self
    }
}

/// Validator for posts
#[derive(Clone, Debug, Default)]
pub struct PostValidator {
    policy: PostPolicy,
}

impl PostValidator {
    pub fn new(policy: PostPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PostPolicy {
        &self.policy
    }

    /// Check user input and return the pseudonym to store
    pub fn validate_local<'a>(&'a self, content: &str, pseudonym: &'a str) -> Result<&'a str, PostError> {
        self.check_content(content)?;

        let pseudonym = pseudonym.trim();
        if pseudonym.is_empty() {
            return Ok(self.policy.default_pseudonym.as_str());
        }
        self.check_pseudonym(pseudonym)?;
        Ok(pseudonym)
    }

    /// Check a post received from a peer
    ///
    /// Order matters: a forged id is reported as corruption even when the
    /// fields would also fail validation.
    pub fn validate_remote(&self, post: &Post, now: u64) -> Result<(), PostError> {
        if !post.has_valid_id() {
            return Err(PostError::IdMismatch(post.id()));
        }

        self.check_content(post.content())?;
        self.check_pseudonym(post.pseudonym())?;

        let max_skew = self.policy.max_clock_skew_secs;
        if post.timestamp() > now.saturating_add(max_skew) {
            return Err(PostError::FutureTimestamp {
                timestamp: post.timestamp(),
                now,
                max_skew,
            });
        }

        Ok(())
    }

    fn check_content(&self, content: &str) -> Result<(), PostError> {
        if content.trim().is_empty() {
            return Err(PostError::EmptyContent);
        }

        let len = content.chars().count();
        if len > self.policy.max_content_len {
            return Err(PostError::ContentTooLong {
                len,
                max: self.policy.max_content_len,
            });
        }

        Ok(())
    }

    fn check_pseudonym(&self, pseudonym: &str) -> Result<(), PostError> {
        let len = pseudonym.chars().count();
        if len > self.policy.max_pseudonym_len {
            return Err(PostError::PseudonymTooLong {
                len,
                max: self.policy.max_pseudonym_len,
            });
        }
        Ok(())
    }
}
