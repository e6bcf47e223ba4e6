//! Backing-store abstraction.
//!
//! The coordinator drives everything through the [`Store`] trait: plain and
//! conditional SETs, the two ownership CAS scripts, and a client-side-cached
//! GET whose reads the server tracks so it can push invalidations when the
//! keys change. Store constructors hand back the invalidation stream
//! alongside the store so the callback edge is wired before the first read.

pub mod cache;
pub mod memory;
pub mod redis;

use std::time::Duration;

use tokio::sync::mpsc;

/// A server-pushed invalidation notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// The named keys changed (or expired) after this connection read them.
    Keys(Vec<String>),
    /// Connection-level reset: everything this connection has read must be
    /// considered stale (tracking table lost, failover, FLUSHALL).
    All,
}

/// Stream of invalidations delivered by a store, created at connect time.
pub type InvalidationStream = mpsc::UnboundedReceiver<Invalidation>;

/// Errors surfaced by [`Store`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis command failed: {0}")]
    Redis(#[from] fred::error::Error),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("store connection closed")]
    Closed,
}

/// The command surface the coordinator consumes.
///
/// Key-absent replies are `Ok(None)`, never an error. Implementations must
/// be cheap to clone; clones share the underlying connection.
#[async_trait::async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    /// Client-side-cached GET. A fresh local entry is served from memory;
    /// otherwise the key is read from the store, recorded locally for at
    /// most `cache_ttl`, and tracked by the server for invalidation.
    async fn get_cached(&self, key: &str, cache_ttl: Duration)
        -> Result<Option<String>, StoreError>;

    /// `SET key value PX ttl`.
    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// `SET key value NX GET PX ttl`: set only if absent, returning the
    /// prior value. `None` means the set happened.
    async fn set_nx_get(&self, key: &str, value: &str, ttl: Duration)
        -> Result<Option<String>, StoreError>;

    /// Atomically replace `key` with `value` (fresh `ttl`) only while its
    /// current value equals `owner`.
    async fn set_if_owned(&self, key: &str, owner: &str, value: &str, ttl: Duration)
        -> Result<(), StoreError>;

    /// Atomically delete `key` only while its current value equals `owner`.
    async fn del_if_owned(&self, key: &str, owner: &str) -> Result<(), StoreError>;

    /// Unconditional `DEL key`.
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Terminate the connection.
    async fn close(&self);
}
