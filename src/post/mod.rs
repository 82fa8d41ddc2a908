// Post module - WHAT USERS WRITE
// Post model, validation rules and the deduplicating post store

mod model;
mod store;
mod validator;

pub use model::{feed_order, Post, PostId};
pub use store::{PostStore, StoreDigest};
pub use validator::{
    PostError, PostPolicy, PostValidator, DEFAULT_MAX_CLOCK_SKEW_SECS, DEFAULT_MAX_CONTENT_LEN,
    DEFAULT_MAX_PSEUDONYM_LEN, DEFAULT_PSEUDONYM,
};
