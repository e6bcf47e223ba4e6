//! Client-side cache-aside coordination for Redis-compatible stores.
//!
//! A [`Client`] wraps a store that supports server-assisted client-side
//! caching (RESP3 `CLIENT TRACKING`) and exposes one read-through
//! primitive, [`Client::get`]:
//!
//! - fresh values are served from an in-process cache, invalidated by
//!   server pushes rather than polling;
//! - on a miss, exactly one caller across every process sharing the store
//!   is elected to run the loader, while concurrent callers for the same
//!   key wait for the winner's published value instead of stampeding the
//!   backend;
//! - if the elected loader's process dies, its liveness marker expires and
//!   waiters are woken by the resulting invalidation to re-contend.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use cache_aside::{Client, MemoryBackend};
//!
//! # async fn demo() -> Result<(), cache_aside::Error> {
//! let backend = MemoryBackend::new();
//! let (store, invalidations) = backend.connect();
//! let client = Client::with_store(store, invalidations, Duration::from_secs(10));
//!
//! let value = client
//!     .get(Duration::from_secs(1), "user:42", |key| async move {
//!         Ok(format!("loaded for {key}"))
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! Production deployments connect with [`Client::connect`] and a
//! [`Config`]; the in-memory store exists for tests and embedded use.

pub mod client;
pub mod config;
pub mod error;
pub mod scripts;
pub mod store;

pub use client::{Client, CLIENT_ID_PREFIX, DEFAULT_CLIENT_TTL};
pub use config::{Config, RedisConfig};
pub use error::Error;
pub use store::memory::{MemoryBackend, MemoryStore};
pub use store::redis::RedisStore;
pub use store::{Invalidation, InvalidationStream, Store, StoreError};
