//! The cache-aside coordinator.
//!
//! [`Client::get`] is a read-through: values are served from the in-process
//! cache while fresh, and on a miss exactly one caller across every process
//! sharing the backing store runs the loader while the rest wait for the
//! published value. Election works by writing the caller's client-id into
//! the key (`SET key id NX GET PX ttl`); the id doubles as the name of a
//! liveness marker key that the winner keeps refreshed, so waiters cache
//! the marker and are woken by its invalidation if the winner dies.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::config::Config;
use crate::error::Error;
use crate::store::redis::RedisStore;
use crate::store::{Invalidation, InvalidationStream, Store};

/// Prefix of every client-id key.
///
/// This is a wire-level constant: all clients sharing a store must agree on
/// it to tell population placeholders from real values, which also means
/// user values must never start with it.
pub const CLIENT_ID_PREFIX: &str = "rueidisid:";

/// Liveness marker TTL used when none is configured.
pub const DEFAULT_CLIENT_TTL: Duration = Duration::from_secs(10);

/// A cache-aside client over a backing store.
///
/// Safe to share across tasks (typically behind an [`Arc`]); every method
/// takes `&self`.
pub struct Client<S: Store = RedisStore> {
    store: S,
    shared: SharedState,
    shutdown: watch::Sender<bool>,
    client_ttl: Duration,
}

/// Mutable coordinator state. One mutex guards both fields and is held only
/// across map and id accesses, never across store I/O.
#[derive(Default)]
struct Shared {
    /// `""` until first allocation, then `rueidisid:<ULID>`, cleared again
    /// on connection-level invalidation or close.
    client_id: String,
    /// One wake-up signal per key currently being waited on.
    waiters: HashMap<String, watch::Sender<bool>>,
}

type SharedState = Arc<Mutex<Shared>>;

impl Client<RedisStore> {
    /// Connect to the store described by `config`.
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        let (store, invalidations) = RedisStore::connect(&config.redis).await?;
        Ok(Self::with_store(store, invalidations, config.client_ttl()))
    }
}

impl<S: Store> Client<S> {
    /// Build a coordinator over an already-connected store and its
    /// invalidation stream. A zero `client_ttl` falls back to
    /// [`DEFAULT_CLIENT_TTL`].
    pub fn with_store(store: S, invalidations: InvalidationStream, client_ttl: Duration) -> Self {
        let client_ttl = if client_ttl.is_zero() {
            DEFAULT_CLIENT_TTL
        } else {
            client_ttl
        };
        let (shutdown, _) = watch::channel(false);
        let client = Self {
            store,
            shared: Arc::new(Mutex::new(Shared::default())),
            shutdown,
            client_ttl,
        };
        client.spawn_invalidation_pump(invalidations);
        client
    }

    /// Read-through get, bounded by `ttl`.
    ///
    /// `ttl` is used three ways, mirroring the store key's lifecycle: as the
    /// PX expiry of the populated key, as the lifetime of the local cache
    /// entry, and as the deadline for the whole call. `loader` may be
    /// invoked more than once if the population lock is lost and re-won;
    /// exactly one invocation succeeds per published value. Its return
    /// value must not start with [`CLIENT_ID_PREFIX`], which is reserved
    /// for lock placeholders.
    pub async fn get<F, Fut>(&self, ttl: Duration, key: &str, loader: F) -> Result<String, Error>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = anyhow::Result<String>>,
    {
        let deadline = Instant::now() + ttl;
        match tokio::time::timeout_at(deadline, self.get_inner(ttl, key, Some(&loader))).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded),
        }
    }

    /// Like [`Client::get`] but never populates: a miss is
    /// [`Error::NotFound`]. Still waits out a population in progress, so a
    /// value being loaded elsewhere is returned once published.
    pub async fn get_existing(&self, ttl: Duration, key: &str) -> Result<String, Error> {
        type NoLoader = fn(String) -> std::future::Ready<anyhow::Result<String>>;
        let deadline = Instant::now() + ttl;
        let inner = self.get_inner::<NoLoader, std::future::Ready<anyhow::Result<String>>>(
            ttl, key, None,
        );
        match tokio::time::timeout_at(deadline, inner).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded),
        }
    }

    /// Unconditionally delete `key`. Does not interact with the population
    /// lock; the store's invalidation push wakes any local readers.
    pub async fn del(&self, key: &str) -> Result<(), Error> {
        self.store.del(key).await?;
        Ok(())
    }

    /// Shut down: stop the background tasks, drop this client's liveness
    /// marker so waiters in other processes wake immediately instead of
    /// after the marker TTL, and close the store connection.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let id = std::mem::take(&mut lock(&self.shared).client_id);
        if !id.is_empty() {
            if let Err(e) = self.store.del(&id).await {
                warn!(error = %e, "failed to delete liveness marker on close");
            }
        }
        self.store.close().await;
    }

    /// One pass of the retry loop per iteration: register intent, read,
    /// then populate or wait. The waiter must be registered before the read
    /// so an invalidation landing between the read and the sleep still
    /// wakes us.
    async fn get_inner<F, Fut>(
        &self,
        ttl: Duration,
        key: &str,
        loader: Option<&F>,
    ) -> Result<String, Error>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = anyhow::Result<String>>,
    {
        loop {
            let wait = register(&self.shared, key);
            let observed = match self.store.get_cached(key, ttl).await? {
                Some(value) => value,
                None => match loader {
                    None => return Err(Error::NotFound),
                    Some(loader) => {
                        let id = self.keepalive().await?;
                        match self.store.set_nx_get(key, &id, ttl).await? {
                            None => return self.populate(ttl, key, id, loader).await,
                            Some(existing) => existing,
                        }
                    }
                },
            };

            if !observed.starts_with(CLIENT_ID_PREFIX) {
                return Ok(observed);
            }

            // `observed` names the current lock holder. Cache its liveness
            // marker so the marker's invalidation wakes us too, then sleep
            // until either the value key or the marker changes.
            let holder_wait = register(&self.shared, &observed);
            match self.store.get_cached(&observed, self.client_ttl).await? {
                None => {
                    debug!(%key, holder = %observed, "lock holder is gone, reclaiming");
                    if let Err(e) = self.store.del_if_owned(key, &observed).await {
                        warn!(%key, error = %e, "failed to clear stale lock");
                    }
                }
                Some(_) => {
                    tokio::select! {
                        () = fired(wait) => {}
                        () = fired(holder_wait) => {}
                    }
                }
            }
        }
    }

    /// Run the loader while holding the population lock, then publish under
    /// CAS. The guard releases the lock if this future is dropped mid-load.
    async fn populate<F, Fut>(
        &self,
        ttl: Duration,
        key: &str,
        id: String,
        loader: &F,
    ) -> Result<String, Error>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = anyhow::Result<String>>,
    {
        let guard = LockGuard::new(self.store.clone(), key.to_string(), id);
        match loader(key.to_string()).await {
            Ok(value) => match self.store.set_if_owned(key, guard.owner(), &value, ttl).await {
                Ok(()) => {
                    // The CAS may have lost to lock expiry; waiters then
                    // recover via TTL-driven invalidation. Either way this
                    // caller has the value.
                    guard.defuse();
                    debug!(%key, "value populated");
                    Ok(value)
                }
                Err(e) => {
                    guard.release().await;
                    Err(e.into())
                }
            },
            Err(e) => {
                guard.release().await;
                Err(Error::Loader(e))
            }
        }
    }

    /// This client's id, allocating the liveness marker on first use.
    ///
    /// Exactly one refresh task runs per published id; a concurrent
    /// allocator that loses the publication race adopts the winner's id and
    /// lets its own marker lapse.
    async fn keepalive(&self) -> Result<String, Error> {
        let id = lock(&self.shared).client_id.clone();
        if !id.is_empty() {
            return Ok(id);
        }

        let id = format!("{CLIENT_ID_PREFIX}{}", Ulid::new());
        self.store.set_px(&id, "", self.client_ttl).await?;

        let mut shared = lock(&self.shared);
        if shared.client_id.is_empty() {
            shared.client_id = id.clone();
            drop(shared);
            debug!(client_id = %id, "liveness marker allocated");
            self.spawn_refresh(id.clone());
            Ok(id)
        } else {
            Ok(shared.client_id.clone())
        }
    }

    /// Re-issue the marker SET every half TTL. Exits on shutdown or when
    /// the published id no longer matches (cleared by a connection-level
    /// invalidation, possibly reallocated since).
    fn spawn_refresh(&self, id: String) {
        let store = self.store.clone();
        let shared = Arc::clone(&self.shared);
        let mut shutdown = self.shutdown.subscribe();
        let ttl = self.client_ttl;
        tokio::spawn(async move {
            let interval = ttl / 2;
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {
                        if lock(&shared).client_id != id {
                            return;
                        }
                        if let Err(e) = store.set_px(&id, "", ttl).await {
                            // Transient by assumption; the TTL is the net.
                            debug!(client_id = %id, error = %e, "liveness refresh failed");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    /// Consume the store's invalidation stream. Key invalidations wake the
    /// matching waiters; a connection-level reset clears the client id and
    /// wakes everyone, then best-effort-deletes the old marker (outside the
    /// mutex) so other processes are not left waiting on a ghost.
    fn spawn_invalidation_pump(&self, mut invalidations: InvalidationStream) {
        let store = self.store.clone();
        let shared = Arc::clone(&self.shared);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = invalidations.recv() => match msg {
                        Some(Invalidation::Keys(keys)) => wake(&shared, keys),
                        Some(Invalidation::All) => {
                            let old_id = {
                                let mut sh = lock(&shared);
                                for (_, tx) in sh.waiters.drain() {
                                    let _ = tx.send(true);
                                }
                                std::mem::take(&mut sh.client_id)
                            };
                            if !old_id.is_empty() {
                                debug!(client_id = %old_id, "connection reset, dropping liveness marker");
                                if let Err(e) = store.del(&old_id).await {
                                    warn!(error = %e, "failed to drop liveness marker after reset");
                                }
                            }
                        }
                        None => return,
                    },
                    _ = shutdown.changed() => return,
                }
            }
        });
    }
}

/// Return the wake-up signal for `key`, creating it if absent. Concurrent
/// registrants for the same key share one signal.
fn register(shared: &SharedState, key: &str) -> watch::Receiver<bool> {
    let mut sh = lock(shared);
    match sh.waiters.get(key) {
        Some(tx) => tx.subscribe(),
        None => {
            let (tx, rx) = watch::channel(false);
            sh.waiters.insert(key.to_string(), tx);
            rx
        }
    }
}

/// Fire and remove the signal for each key that has one. Firing is a
/// broadcast; the signal never stays in the map afterwards.
fn wake(shared: &SharedState, keys: impl IntoIterator<Item = String>) {
    let mut sh = lock(shared);
    for key in keys {
        if let Some(tx) = sh.waiters.remove(&key) {
            let _ = tx.send(true);
        }
    }
}

/// Resolve once the signal fires. Dropping the sender counts as firing, so
/// a waiter that subscribes just before the wake still resolves.
async fn fired(mut signal: watch::Receiver<bool>) {
    let _ = signal.changed().await;
}

fn lock(shared: &SharedState) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases the population lock unless the value was published.
///
/// Dropping an armed guard (the populate future was cancelled mid-load)
/// spawns the release on a background task, so caller cancellation cannot
/// leave the lock held for its full TTL.
struct LockGuard<S: Store> {
    store: S,
    key: String,
    owner: String,
    armed: bool,
}

impl<S: Store> LockGuard<S> {
    fn new(store: S, key: String, owner: String) -> Self {
        Self {
            store,
            key,
            owner,
            armed: true,
        }
    }

    fn owner(&self) -> &str {
        &self.owner
    }

    fn defuse(mut self) {
        self.armed = false;
    }

    async fn release(mut self) {
        self.armed = false;
        if let Err(e) = self.store.del_if_owned(&self.key, &self.owner).await {
            warn!(key = %self.key, error = %e, "failed to release population lock");
        }
    }
}

impl<S: Store> Drop for LockGuard<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Dropped outside a runtime there is nothing to spawn on; the lock
        // TTL and dead-holder reclaim cover that case.
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);
        handle.spawn(async move {
            let _ = store.del_if_owned(&key, &owner).await;
        });
    }
}
