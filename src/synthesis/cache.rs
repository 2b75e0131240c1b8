//! Bounded cache of synthesized short fragments

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use lru::LruCache;
use tokio::sync::Mutex;

/// Hit/miss counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// LRU cache keyed on exact fragment text
///
/// Only fragments of at most `max_chars` characters are admitted; longer
/// fragments are unlikely to repeat.
pub struct SynthesisCache {
    entries: Mutex<LruCache<String, Bytes>>,
    max_chars: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SynthesisCache {
    /// Create a cache holding up to `capacity` fragments
    #[must_use]
    pub fn new(capacity: usize, max_chars: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            max_chars,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Whether `text` is short enough to be cached
    #[must_use]
    pub fn admits(&self, text: &str) -> bool {
        text.chars().count() <= self.max_chars
    }

    /// Look up a fragment, recording a hit or miss
    pub async fn get(&self, text: &str) -> Option<Bytes> {
        let found = self.entries.lock().await.get(text).cloned();
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Store a fragment if it is short enough; returns whether it was stored
    pub async fn put(&self, text: &str, audio: Bytes) -> bool {
        if !self.admits(text) {
            return false;
        }
        self.entries.lock().await.put(text.to_string(), audio);
        true
    }

    /// Current counters
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().await.len(),
        }
    }
}
