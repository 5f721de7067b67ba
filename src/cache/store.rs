//! TTL-aware, bounded LRU store for finalized responses.
//!
//! The store is shared by every request task, so all state sits behind one
//! `std::sync::Mutex` with short, never-awaiting critical sections. Recency
//! bookkeeping comes from the [`lru`] crate; expiry is a per-entry insertion
//! stamp checked on lookup, so an expired entry acts as a miss even before
//! any sweeper removes it.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::background;
use crate::http::{Headers, StatusCode};

/// One finalized response, immutable once created.
///
/// Produced by snapshotting a [`ResponseCapture`](super::ResponseCapture)
/// after the downstream handler returns, then shared via `Arc` between the
/// store and every request that replays it.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// Status code the downstream handler set (or the capture's default).
    pub status: StatusCode,
    /// Snapshot of the headers the handler produced, order and duplicates
    /// preserved.
    pub headers: Headers,
    /// The complete body.
    pub body: Bytes,
}

impl CachedResponse {
    /// Returns the body length in bytes.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }
}

// A stored response plus the instant it entered the store.
struct StoredEntry {
    response: Arc<CachedResponse>,
    inserted_at: Instant,
}

/// Bounded, TTL-aware key/value store with least-recently-used eviction.
///
/// Keys are request paths. Both operations are total: [`get`](Self::get) and
/// [`insert`](Self::insert) never fail, and inserting beyond capacity evicts
/// the least-recently-used key. Recency is updated on insertion and on every
/// successful lookup.
///
/// # Examples
///
/// ```
/// use std::num::NonZeroUsize;
/// use std::sync::Arc;
/// use std::time::Duration;
/// use bytes::Bytes;
/// use cachegate::cache::{CacheStore, CachedResponse};
/// use cachegate::http::{Headers, StatusCode};
///
/// let store = CacheStore::new(NonZeroUsize::new(100).unwrap(), Duration::from_secs(60));
/// store.insert(
///     "/data.json",
///     Arc::new(CachedResponse {
///         status: StatusCode::Ok,
///         headers: Headers::new(),
///         body: Bytes::from_static(b"{}"),
///     }),
/// );
/// assert!(store.get("/data.json").is_some());
/// assert!(store.get("/other.json").is_none());
/// ```
pub struct CacheStore {
    entries: Mutex<LruCache<String, StoredEntry>>,
    ttl: Duration,
}

impl CacheStore {
    /// Creates a store holding at most `capacity` distinct keys, each visible
    /// for `ttl` after insertion.
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    // Recover rather than poison-cascade: no critical section here can leave
    // the map in an inconsistent state.
    fn entries(&self) -> MutexGuard<'_, LruCache<String, StoredEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up a key, returning `None` if it is absent or expired.
    ///
    /// A hit marks the key most-recently-used. An expired entry is popped on
    /// the spot and reported as a miss, regardless of remaining capacity.
    pub fn get(&self, key: &str) -> Option<Arc<CachedResponse>> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                Some(Arc::clone(&entry.response))
            }
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    /// Inserts or overwrites the entry for `key`, stamped with the current
    /// instant.
    ///
    /// If the number of distinct keys would exceed capacity, the single
    /// least-recently-used key is evicted first.
    pub fn insert(&self, key: impl Into<String>, response: Arc<CachedResponse>) {
        self.entries().put(
            key.into(),
            StoredEntry {
                response,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Removes every expired entry, returning how many were dropped.
    ///
    /// Purely a maintenance operation: lookups already treat expired entries
    /// as absent, this just releases their memory earlier.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.inserted_at.elapsed() >= self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    /// Returns the number of stored entries, including any not yet purged
    /// expired ones.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns `true` if the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Spawns a background task that calls [`purge_expired`](Self::purge_expired)
    /// every `period`.
    ///
    /// Optional: correctness never depends on the sweeper running. The
    /// returned handle aborts the loop when aborted; dropping it detaches.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        background::spawn_periodic("cache-sweeper", period, move || {
            let store = Arc::clone(&store);
            async move {
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = store.len(), "swept expired cache entries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn response(body: &'static [u8]) -> Arc<CachedResponse> {
        Arc::new(CachedResponse {
            status: StatusCode::Ok,
            headers: Headers::new(),
            body: Bytes::from_static(body),
        })
    }

    fn store(capacity: usize, ttl: Duration) -> CacheStore {
        CacheStore::new(NonZeroUsize::new(capacity).unwrap(), ttl)
    }

    #[test]
    fn insert_then_get() {
        let store = store(10, Duration::from_secs(60));
        store.insert("/a.json", response(b"a"));
        let hit = store.get("/a.json").unwrap();
        assert_eq!(&hit.body[..], b"a");
        assert!(store.get("/missing.json").is_none());
    }

    #[test]
    fn overwrite_replaces_without_growing() {
        let store = store(10, Duration::from_secs(60));
        store.insert("/a.json", response(b"old"));
        store.insert("/a.json", response(b"new"));
        assert_eq!(store.len(), 1);
        assert_eq!(&store.get("/a.json").unwrap().body[..], b"new");
    }

    #[test]
    fn capacity_overflow_evicts_least_recently_used() {
        let store = store(3, Duration::from_secs(60));
        for key in ["/k1", "/k2", "/k3", "/k4"] {
            store.insert(key, response(b"x"));
        }
        assert!(store.get("/k1").is_none());
        assert!(store.get("/k4").is_some());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn lookup_refreshes_recency() {
        let store = store(2, Duration::from_secs(60));
        store.insert("/a", response(b"a"));
        store.insert("/b", response(b"b"));
        // Touch /a so /b becomes the eviction candidate.
        assert!(store.get("/a").is_some());
        store.insert("/c", response(b"c"));
        assert!(store.get("/a").is_some());
        assert!(store.get("/b").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_a_miss() {
        let store = store(10, Duration::from_secs(60));
        store.insert("/a.json", response(b"a"));

        advance(Duration::from_secs(59)).await;
        assert!(store.get("/a.json").is_some());

        advance(Duration::from_secs(2)).await;
        assert!(store.get("/a.json").is_none());
        // The expired entry was popped by the lookup itself.
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_only_expired_entries() {
        let store = store(10, Duration::from_secs(60));
        store.insert("/old.json", response(b"old"));
        advance(Duration::from_secs(40)).await;
        store.insert("/new.json", response(b"new"));
        advance(Duration::from_secs(30)).await;

        assert_eq!(store.purge_expired(), 1);
        assert!(store.get("/old.json").is_none());
        assert!(store.get("/new.json").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_on_schedule() {
        let store = Arc::new(store(10, Duration::from_secs(60)));
        store.insert("/a.json", response(b"a"));

        let sweeper = store.spawn_sweeper(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(91)).await;

        assert!(store.is_empty());
        sweeper.abort();
    }
}
