//! Bounded in-memory chunk cache.
//!
//! Entries are kept in LRU order. A running counter tracks the subtree size
//! of every cached chunk; an insert that would push it past the budget first
//! evicts least-recently-used entries. The cache can overshoot by at most one
//! chunk, when that chunk alone is larger than the budget.

use cairn_core::{Chunk, ContentKey};
use lru::LruCache;
use parking_lot::Mutex;

pub struct MemoryStore {
    budget: u64,
    inner: Mutex<Inner>,
}

struct Inner {
    entries: LruCache<ContentKey, Chunk>,
    used: u64,
}

impl MemoryStore {
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                used: 0,
            }),
        }
    }

    /// Look up a chunk, marking it most recently used.
    pub fn get(&self, key: &ContentKey) -> Option<Chunk> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Presence check that leaves LRU order alone.
    pub fn contains(&self, key: &ContentKey) -> bool {
        self.inner.lock().entries.contains(key)
    }

    pub fn put(&self, chunk: Chunk) {
        let mut inner = self.inner.lock();
        if inner.entries.get(&chunk.key).is_some() {
            return;
        }

        let cost = chunk.cost();
        while inner.used + cost > self.budget {
            let Some((key, evicted)) = inner.entries.pop_lru() else {
                break;
            };
            inner.used -= evicted.cost();
            tracing::trace!(key = %key.short(), "evicted from memory");
        }
        inner.used += cost;
        inner.entries.put(chunk.key.clone(), chunk);
    }

    /// Bytes currently charged against the budget.
    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().used
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
