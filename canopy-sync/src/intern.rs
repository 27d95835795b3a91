//! Intern table for compact patches.
//!
//! The server may send a subtree once as `{ "$def": [token, node] }` and
//! afterwards refer to it as `{ "$ref": token }`. Tokens are only valid for
//! one connection epoch, so the table is cleared on every (re)connect. The
//! table is bounded; the least recently used token is evicted first, and a
//! reference to an evicted token is a decode error.

use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;

/// Default number of interned payloads kept per connection.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Bounded token → payload mapping with LRU eviction.
pub struct InternTable {
    entries: LruCache<String, Value>,
    /// Number of resets since creation (one per connection epoch).
    epoch: u64,
    evictions: u64,
}

impl Default for InternTable {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl InternTable {
    /// Create a table holding at most `capacity` payloads (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            epoch: 0,
            evictions: 0,
        }
    }

    /// Store a definition. Redefining a token replaces its payload.
    pub fn define(&mut self, token: impl Into<String>, payload: Value) {
        let token = token.into();
        if let Some((evicted, _)) = self.entries.push(token.clone(), payload) {
            // `push` also hands back the old value when the key existed.
            if evicted != token {
                self.evictions += 1;
                log::debug!("Intern table full, evicted token '{evicted}'");
            }
        }
    }

    /// Look up a token, marking it as recently used.
    pub fn resolve(&mut self, token: &str) -> Option<&Value> {
        self.entries.get(token)
    }

    /// Whether `token` is currently defined, without touching recency.
    pub fn contains(&self, token: &str) -> bool {
        self.entries.contains(token)
    }

    /// Forget every token; called when a new connection epoch starts.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.epoch += 1;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Total tokens evicted for capacity since creation.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}
