use std::hash::Hash;

use crate::clock::Instant;
use crate::singleflight::ValueHandle;

/// The per-key record tracked by the cache.
///
/// An entry carries the shared handle to the value plus the bookkeeping the
/// maintenance pass needs: when the value was last (re)loaded, when it was
/// last read through the cache API, and its size at load time. The recency
/// links live in the arena slots of [`LruList`](crate::lru::LruList).
pub(crate) struct Entry<K: Eq + Hash, V> {
    handle: ValueHandle<K, V>,
    loaded_at: Instant,
    last_read_at: Instant,
    size: u64,
}

impl<K: Eq + Hash, V> Entry<K, V> {
    pub(crate) fn new(handle: ValueHandle<K, V>, size: u64, now: Instant) -> Self {
        Entry {
            handle,
            loaded_at: now,
            last_read_at: now,
            size,
        }
    }

    pub(crate) fn key(&self) -> &K {
        self.handle.key()
    }

    pub(crate) fn handle(&self) -> &ValueHandle<K, V> {
        &self.handle
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn loaded_at(&self) -> Instant {
        self.loaded_at
    }

    pub(crate) fn last_read_at(&self) -> Instant {
        self.last_read_at
    }

    /// Marks a read. The owning list moves the entry to the front.
    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_read_at = now;
    }

    /// Swaps in a freshly reloaded value.
    ///
    /// Updates `loaded_at` and the recorded size. `last_read_at` stays put:
    /// an entry nobody reads must keep aging out even while reloads succeed.
    pub(crate) fn assign(&mut self, value: V, size: u64, now: Instant) {
        self.handle.replace(value);
        self.loaded_at = now;
        self.size = size;
    }

    /// Reads the value without counting as a read.
    pub(crate) fn peek<R>(&self, f: impl FnOnce(&V) -> R) -> R {
        self.handle.with(f)
    }
}
