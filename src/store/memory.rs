//! In-memory [`Store`] with server-assisted caching semantics.
//!
//! [`MemoryBackend`] plays the server role: one keyspace with millisecond
//! expiry, a per-connection table of tracked keys, and push channels over
//! which it delivers invalidations the way a RESP3 server would: once per
//! tracked read, on writes and on expiry. Multiple [`MemoryStore`]
//! connections over one backend let the full coordination protocol run in
//! tests and embedded setups without a live server.
//!
//! Every store operation yields to the scheduler once, standing in for the
//! network round-trip: protocol retry loops must not be able to starve the
//! invalidation pump between an operation and the next read.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use super::cache::LocalCache;
use super::{Invalidation, InvalidationStream, Store, StoreError};

/// How often the backend scans for expired keys. Expiry must be pushed, not
/// just observed lazily: waiters sleep on the invalidation of keys nobody
/// reads again.
const SWEEP_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Debug)]
enum Push {
    Invalidate(Vec<String>),
    Reset,
}

#[derive(Debug)]
struct Conn {
    push: mpsc::UnboundedSender<Push>,
    tracked: HashSet<String>,
}

#[derive(Debug, Default)]
struct State {
    keys: HashMap<String, Entry>,
    conns: HashMap<u64, Conn>,
    next_conn_id: u64,
}

/// Shared in-memory "server". Create once, then open one connection per
/// coordinator with [`MemoryBackend::connect`].
#[derive(Debug)]
pub struct MemoryBackend {
    /// Self-handle so connections and the sweeper can hold the backend
    /// without keeping it alive forever.
    me: Weak<MemoryBackend>,
    state: Mutex<State>,
    server_reads: AtomicU64,
    sweeper_started: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state: Mutex::default(),
            server_reads: AtomicU64::new(0),
            sweeper_started: AtomicBool::new(false),
        })
    }

    /// Open a new tracking connection. Must be called from within a tokio
    /// runtime; the first call starts the expiry sweeper.
    pub fn connect(&self) -> (MemoryStore, InvalidationStream) {
        let backend = self.me.upgrade().expect("MemoryBackend is always behind an Arc");
        self.start_sweeper();

        let (push_tx, mut push_rx) = mpsc::unbounded_channel();
        let (inv_tx, inv_rx) = mpsc::unbounded_channel();
        let conn_id = {
            let mut st = self.lock();
            let id = st.next_conn_id;
            st.next_conn_id += 1;
            st.conns.insert(
                id,
                Conn {
                    push: push_tx,
                    tracked: HashSet::new(),
                },
            );
            id
        };

        let cache = Arc::new(LocalCache::new());

        // Pump server pushes into the local cache, then on to the consumer.
        let pump_cache = Arc::clone(&cache);
        tokio::spawn(async move {
            while let Some(push) = push_rx.recv().await {
                match push {
                    Push::Invalidate(keys) => {
                        for key in &keys {
                            pump_cache.invalidate(key);
                        }
                        if inv_tx.send(Invalidation::Keys(keys)).is_err() {
                            return;
                        }
                    }
                    Push::Reset => {
                        pump_cache.clear();
                        if inv_tx.send(Invalidation::All).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        (
            MemoryStore {
                backend,
                conn_id,
                cache,
            },
            inv_rx,
        )
    }

    /// Push a connection-level reset to every client, as a server does when
    /// it loses its tracking tables (failover, FLUSHALL, RESET).
    pub fn reset(&self) {
        let mut st = self.lock();
        for conn in st.conns.values_mut() {
            conn.tracked.clear();
            let _ = conn.push.send(Push::Reset);
        }
    }

    /// Whether `key` currently holds a live value.
    pub fn contains(&self, key: &str) -> bool {
        let mut st = self.lock();
        Self::live_value(&mut st, key).is_some()
    }

    /// All keys currently holding live values. Diagnostic surface for
    /// assertions about marker and lock lifetimes.
    pub fn live_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let st = self.lock();
        st.keys
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Number of reads that reached the backend (as opposed to being served
    /// from a connection's local cache).
    pub fn server_reads(&self) -> u64 {
        self.server_reads.load(Ordering::Relaxed)
    }

    fn start_sweeper(&self) {
        if self.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let backend = self.me.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                let Some(backend) = backend.upgrade() else {
                    return;
                };
                backend.sweep();
            }
        });
    }

    fn sweep(&self) {
        let now = Instant::now();
        let mut st = self.lock();
        let expired: Vec<String> = st
            .keys
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            st.keys.remove(&key);
            Self::notify(&mut st, &key);
        }
    }

    /// Invalidate `key` on every connection that tracked a read of it. Each
    /// tracked read is notified at most once, as with RESP3 tracking.
    fn notify(st: &mut State, key: &str) {
        for conn in st.conns.values_mut() {
            if conn.tracked.remove(key) {
                let _ = conn.push.send(Push::Invalidate(vec![key.to_string()]));
            }
        }
    }

    /// Value of `key` if present and unexpired; expires (and notifies) lazily
    /// otherwise.
    fn live_value(st: &mut State, key: &str) -> Option<String> {
        let expired = matches!(st.keys.get(key), Some(e) if e.expires_at <= Instant::now());
        if expired {
            st.keys.remove(key);
            Self::notify(st, key);
            return None;
        }
        st.keys.get(key).map(|e| e.value.clone())
    }

    fn read(&self, conn_id: u64, key: &str) -> Result<Option<String>, StoreError> {
        self.server_reads.fetch_add(1, Ordering::Relaxed);
        let mut st = self.lock();
        let value = Self::live_value(&mut st, key);
        let conn = st.conns.get_mut(&conn_id).ok_or(StoreError::Closed)?;
        conn.tracked.insert(key.to_string());
        Ok(value)
    }

    fn write(&self, key: &str, value: &str, ttl: Duration) {
        let mut st = self.lock();
        st.keys.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Self::notify(&mut st, key);
    }

    fn write_nx_get(&self, key: &str, value: &str, ttl: Duration) -> Option<String> {
        let mut st = self.lock();
        if let Some(existing) = Self::live_value(&mut st, key) {
            return Some(existing);
        }
        st.keys.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Self::notify(&mut st, key);
        None
    }

    fn write_if_owned(&self, key: &str, owner: &str, value: &str, ttl: Duration) {
        let mut st = self.lock();
        if Self::live_value(&mut st, key).as_deref() == Some(owner) {
            st.keys.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Instant::now() + ttl,
                },
            );
            Self::notify(&mut st, key);
        }
    }

    fn remove_if_owned(&self, key: &str, owner: &str) {
        let mut st = self.lock();
        if Self::live_value(&mut st, key).as_deref() == Some(owner) {
            st.keys.remove(key);
            Self::notify(&mut st, key);
        }
    }

    fn remove(&self, key: &str) {
        let mut st = self.lock();
        if st.keys.remove(key).is_some() {
            Self::notify(&mut st, key);
        }
    }

    fn disconnect(&self, conn_id: u64) {
        self.lock().conns.remove(&conn_id);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One client connection over a shared [`MemoryBackend`].
#[derive(Clone)]
pub struct MemoryStore {
    backend: Arc<MemoryBackend>,
    conn_id: u64,
    cache: Arc<LocalCache>,
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_cached(
        &self,
        key: &str,
        cache_ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        tokio::task::yield_now().await;
        if let Some(hit) = self.cache.get(key) {
            trace!(%key, "local cache hit");
            return Ok(hit);
        }
        let gen = self.cache.generation();
        let value = self.backend.read(self.conn_id, key)?;
        self.cache.insert_if(gen, key, value.clone(), cache_ttl);
        Ok(value)
    }

    async fn set_px(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.backend.write(key, value, ttl);
        Ok(())
    }

    async fn set_nx_get(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        tokio::task::yield_now().await;
        Ok(self.backend.write_nx_get(key, value, ttl))
    }

    async fn set_if_owned(
        &self,
        key: &str,
        owner: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.backend.write_if_owned(key, owner, value, ttl);
        Ok(())
    }

    async fn del_if_owned(&self, key: &str, owner: &str) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.backend.remove_if_owned(key, owner);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.backend.remove(key);
        Ok(())
    }

    async fn close(&self) {
        self.backend.disconnect(self.conn_id);
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nx_get_returns_existing_value() {
        let backend = MemoryBackend::new();
        let (store, _inv) = backend.connect();

        let prev = store
            .set_nx_get("k", "first", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(prev, None);

        let prev = store
            .set_nx_get("k", "second", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(prev, Some("first".into()));
    }

    #[tokio::test]
    async fn expiry_pushes_invalidation_to_tracking_reader() {
        let backend = MemoryBackend::new();
        let (store, mut inv) = backend.connect();

        store.set_px("k", "v", Duration::from_millis(30)).await.unwrap();
        // Track the key by reading it.
        let value = store.get_cached("k", Duration::from_secs(5)).await.unwrap();
        assert_eq!(value, Some("v".into()));

        let msg = tokio::time::timeout(Duration::from_millis(500), inv.recv())
            .await
            .expect("expiry should push an invalidation")
            .unwrap();
        assert_eq!(msg, Invalidation::Keys(vec!["k".into()]));

        // The local cache entry went with it.
        assert_eq!(
            store.get_cached("k", Duration::from_secs(5)).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn writes_invalidate_only_tracked_reads() {
        let backend = MemoryBackend::new();
        let (reader, mut reader_inv) = backend.connect();
        let (writer, mut writer_inv) = backend.connect();

        reader.get_cached("k", Duration::from_secs(5)).await.unwrap();
        writer.set_px("k", "v1", Duration::from_secs(5)).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_millis(100), reader_inv.recv())
            .await
            .expect("tracked reader should be notified")
            .unwrap();
        assert_eq!(msg, Invalidation::Keys(vec!["k".into()]));

        // The writer never read the key, so a second write stays silent for
        // it; the reader was already notified once and is no longer tracked.
        writer.set_px("k", "v2", Duration::from_secs(5)).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), writer_inv.recv())
                .await
                .is_err()
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(50), reader_inv.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn cas_ops_respect_ownership() {
        let backend = MemoryBackend::new();
        let (store, _inv) = backend.connect();

        store.set_px("k", "owner-a", Duration::from_secs(5)).await.unwrap();

        store
            .set_if_owned("k", "owner-b", "v", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            store.get_cached("k", Duration::from_millis(1)).await.unwrap(),
            Some("owner-a".into())
        );

        store
            .set_if_owned("k", "owner-a", "v", Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(
            store.get_cached("k", Duration::from_millis(1)).await.unwrap(),
            Some("v".into())
        );

        store.del_if_owned("k", "owner-a").await.unwrap();
        assert!(backend.contains("k"));
        store.del_if_owned("k", "v").await.unwrap();
        assert!(!backend.contains("k"));
    }

    #[tokio::test]
    async fn reset_pushes_connection_level_invalidation() {
        let backend = MemoryBackend::new();
        let (store, mut inv) = backend.connect();

        store.set_px("k", "v", Duration::from_secs(5)).await.unwrap();
        store.get_cached("k", Duration::from_secs(5)).await.unwrap();

        backend.reset();
        let msg = tokio::time::timeout(Duration::from_millis(100), inv.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, Invalidation::All);
    }

    #[tokio::test]
    async fn reads_after_close_fail() {
        let backend = MemoryBackend::new();
        let (store, _inv) = backend.connect();
        store.close().await;
        let err = store
            .get_cached("k", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Closed));
    }
}
