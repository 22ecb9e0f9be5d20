//! In-memory cache of resolved object descriptors.
//!
//! Entries are keyed by OID and hold the JSON-serialized descriptor that was
//! last handed to a client.  Every entry shares the same time-to-live; there is
//! no per-entry override.  Concurrent writers to the same OID are resolved
//! last-writer-wins.

use std::time::Duration;

use bytes::Bytes;
use tracing::trace;

/// Thread-safe, TTL-bounded OID → bytes store.
pub trait ObjectCache: Send + Sync {
    /// Return the cached bytes for `oid`, or `None` if absent or expired.
    fn get(&self, oid: &str) -> Option<Bytes>;

    /// Insert or overwrite the entry for `oid`.
    fn set(&self, oid: &str, value: Bytes);

    /// Remove the entry for `oid` if present.
    fn delete(&self, oid: &str);
}

// ---------------------------------------------------------------------------
// MemoryCache
// ---------------------------------------------------------------------------

/// [`ObjectCache`] backed by a bounded moka cache with a fixed TTL.
#[derive(Clone)]
pub struct MemoryCache {
    inner: moka::sync::Cache<String, Bytes>,
}

impl MemoryCache {
    /// Create a cache whose entries all expire `eviction` after insertion.
    pub fn new(eviction: Duration, max_entries: u64) -> Self {
        let inner = moka::sync::Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(eviction)
            .build();
        Self { inner }
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

impl ObjectCache for MemoryCache {
    fn get(&self, oid: &str) -> Option<Bytes> {
        let value = self.inner.get(oid);
        trace!(oid, hit = value.is_some(), "cache lookup");
        value
    }

    fn set(&self, oid: &str, value: Bytes) {
        trace!(oid, len = value.len(), "cache set");
        self.inner.insert(oid.to_string(), value);
    }

    fn delete(&self, oid: &str) {
        trace!(oid, "cache delete");
        self.inner.invalidate(oid);
    }
}
