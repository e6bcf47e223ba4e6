//! In-process client-side cache.
//!
//! Holds values (and confirmed misses) read from the backing store until
//! either the per-entry TTL elapses or the server pushes an invalidation
//! for the key. A global generation counter closes the race between an
//! in-flight read and a concurrent invalidation: the insert is dropped when
//! any invalidation arrived after the read began, so a reply that was
//! already stale on arrival never sticks in the cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry {
    /// `None` records a confirmed miss. The server tracks reads of absent
    /// keys too, so a miss stays valid until invalidated.
    value: Option<String>,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct LocalCache {
    entries: Mutex<HashMap<String, Entry>>,
    generation: AtomicU64,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current invalidation generation. Sample before issuing a store read
    /// and pass to [`LocalCache::insert_if`] with the reply.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Fresh entry for `key`, if any. Outer `None` means "not cached";
    /// inner `None` is a cached miss.
    pub fn get(&self, key: &str) -> Option<Option<String>> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Record a read result unless an invalidation arrived since `gen` was
    /// sampled.
    pub fn insert_if(&self, gen: u64, key: &str, value: Option<String>, ttl: Duration) {
        if self.generation.load(Ordering::Acquire) != gen {
            return;
        }
        let mut entries = self.lock();
        // Re-check under the map lock: an invalidation running concurrently
        // either bumped the generation already (we skip) or is still waiting
        // on the lock and will remove this entry right after we insert it.
        if self.generation.load(Ordering::Acquire) != gen {
            return;
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.lock().remove(key);
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
