//! Receiver-side segment cache.
//!
//! LRU bounded by total bytes, keyed by ciphertext hash. Entries still
//! referenced by an in-flight reassembly carry a pin count and are never
//! evicted; pack segments shared by several member files stay resident
//! until the last member consumed them.

use std::sync::Mutex;

use lru::LruCache;
use tracing::trace;

use common::{CacheStats, ContentHash};

struct Entry {
    data: Vec<u8>,
    pins: u32,
}

struct Inner {
    entries: LruCache<ContentHash, Entry>,
    bytes: u64,
    capacity: u64,
    stats: CacheStats,
}

pub struct SegmentCache {
    inner: Mutex<Inner>,
}

impl SegmentCache {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                bytes: 0,
                capacity: capacity_bytes.max(1),
                stats: CacheStats::default(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("segment cache mutex poisoned")
    }

    /// Insert a decrypted segment with an initial pin count (the number of
    /// files that will consume it).
    pub fn insert(&self, key: ContentHash, data: Vec<u8>, pins: u32) {
        let mut inner = self.lock();
        if let Some(existing) = inner.entries.get_mut(&key) {
            existing.pins += pins;
            return;
        }
        let len = data.len() as u64;
        inner.bytes += len;
        inner.entries.put(key, Entry { data, pins });
        inner.stats.items += 1;
        inner.stats.bytes = inner.bytes;
        Self::evict_unpinned(&mut inner);
    }

    fn evict_unpinned(inner: &mut Inner) {
        while inner.bytes > inner.capacity {
            // Walk from the LRU end looking for an unpinned victim.
            let victim = inner
                .entries
                .iter()
                .rev()
                .find(|(_, e)| e.pins == 0)
                .map(|(k, _)| *k);
            let Some(key) = victim else {
                // Everything is pinned by in-flight reassembly.
                return;
            };
            if let Some(entry) = inner.entries.pop(&key) {
                inner.bytes -= entry.data.len() as u64;
                inner.stats.evictions += 1;
                inner.stats.items -= 1;
                inner.stats.bytes = inner.bytes;
                trace!(key = %key.to_hex(), "evicted segment");
            }
        }
    }

    /// Whether a segment is resident (counts as neither hit nor miss).
    pub fn contains(&self, key: &ContentHash) -> bool {
        self.lock().entries.contains(key)
    }

    /// Fetch for reassembly. A hit refreshes recency and counts toward
    /// `bytes_served`.
    pub fn get(&self, key: &ContentHash) -> Option<Vec<u8>> {
        let mut inner = self.lock();
        match inner.entries.get(key) {
            Some(entry) => {
                let data = entry.data.clone();
                inner.stats.hits += 1;
                inner.stats.bytes_served += data.len() as u64;
                Some(data)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Add pins to an already-resident entry. Resume uses this to restore
    /// the one-pin-per-consumer balance before reassembly spends the pins
    /// again; a prior run released one pin for every file it wrote.
    pub fn pin(&self, key: &ContentHash, pins: u32) {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.pins += pins;
        }
    }

    /// Release one pin after a file consumed the segment.
    pub fn unpin(&self, key: &ContentHash) {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.pins = entry.pins.saturating_sub(1);
        }
        Self::evict_unpinned(&mut inner);
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }
}
