//! Deduplication of concurrent loads.
//!
//! The [`SingleFlight`] map guarantees that at most one load is in flight per
//! key, no matter how many requesters ask for that key at the same time. The
//! first requester spawns the load; everyone else joins the same broadcast
//! channel and receives a clone of the result, success or failure.
//!
//! Finished values are handed out as [`ValueHandle`]s: reference-counted
//! pointers that keep the value alive independently of cache membership.
//! While any handle for a key is alive, further requests for that key are
//! served from it without invoking the loader again; when the last handle
//! drops, the key disappears from the map and the next request loads afresh.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};

use crate::error::{CacheError, CacheResult};
use crate::utils::CallOnDrop;

/// Channel over which one in-flight load broadcasts its result to all joined
/// requesters.
type LoadChannel<K, V> = Shared<oneshot::Receiver<CacheResult<ValueHandle<K, V>>>>;

/// One slot per key: either a load in flight or a finished value that is
/// still referenced by at least one handle.
enum Slot<K: Eq + Hash, V> {
    Loading(LoadChannel<K, V>),
    Ready(Weak<ValueCell<K, V>>),
}

type Registry<K, V> = Mutex<HashMap<K, Slot<K, V>>>;

/// What a lookup found in the registry, decoupled from the map borrow.
enum Found<K: Eq + Hash, V> {
    Value(Arc<ValueCell<K, V>>),
    InFlight(LoadChannel<K, V>),
    Absent,
}

/// The shared cell behind every [`ValueHandle`].
///
/// Dropping the last handle for a key removes the key from the registry, so
/// the registry never pins values on its own.
struct ValueCell<K: Eq + Hash, V> {
    key: K,
    value: RwLock<V>,
    registry: Weak<Registry<K, V>>,
}

impl<K: Eq + Hash, V> Drop for ValueCell<K, V> {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut map = registry.lock();
        if let Some(Slot::Ready(weak)) = map.get(&self.key) {
            // A racing request may have already replaced the slot with a
            // fresh load or a fresh cell; only drop the stale one.
            if weak.strong_count() == 0 {
                map.remove(&self.key);
            }
        }
    }
}

/// A reference-counted handle to a loaded value.
///
/// The handle keeps the value alive independently of cache membership:
/// erasing or evicting the entry does not invalidate handles already handed
/// out. Background reloads replace the value in place, so a handle always
/// observes the most recently loaded value.
pub struct ValueHandle<K: Eq + Hash, V> {
    cell: Arc<ValueCell<K, V>>,
}

impl<K: Eq + Hash, V> ValueHandle<K, V> {
    /// The key this value was loaded for.
    pub fn key(&self) -> &K {
        &self.cell.key
    }

    /// Returns a copy of the value.
    pub fn value(&self) -> V
    where
        V: Clone,
    {
        self.cell.value.read().clone()
    }

    /// Runs `f` against the value without copying it out.
    pub fn with<R>(&self, f: impl FnOnce(&V) -> R) -> R {
        f(&self.cell.value.read())
    }

    /// Swaps the held value. Readers observe the new value from here on.
    pub(crate) fn replace(&self, value: V) {
        *self.cell.value.write() = value;
    }

    /// Wraps a value that never entered a registry. Used when caching is
    /// disabled and values are handed straight through from the loader.
    pub(crate) fn detached(key: K, value: V) -> Self {
        ValueHandle {
            cell: Arc::new(ValueCell {
                key,
                value: RwLock::new(value),
                registry: Weak::new(),
            }),
        }
    }
}

impl<K: Eq + Hash, V> Clone for ValueHandle<K, V> {
    fn clone(&self) -> Self {
        ValueHandle {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<K: Eq + Hash + fmt::Debug, V> fmt::Debug for ValueHandle<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueHandle")
            .field("key", self.key())
            .finish_non_exhaustive()
    }
}

/// Coalesces concurrent loads per key and tracks finished values for as long
/// as any handle references them.
pub(crate) struct SingleFlight<K: Eq + Hash, V> {
    registry: Arc<Registry<K, V>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        SingleFlight {
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns a handle to the value for `key`, invoking `load` at most once
    /// across all concurrent callers.
    ///
    /// If a finished value is still referenced, a new handle to it is
    /// returned without loading. If a load is in flight, the caller joins
    /// it. Otherwise `load()` is spawned and its outcome, success or
    /// failure, reaches every joined caller. Failures leave no trace: the
    /// key is removed so the next request starts over.
    pub(crate) async fn get_or_load<F>(&self, key: &K, load: F) -> CacheResult<ValueHandle<K, V>>
    where
        F: FnOnce() -> BoxFuture<'static, CacheResult<V>>,
    {
        let channel = {
            let mut map = self.registry.lock();
            let found = match map.get(key) {
                // A dangling weak means the last handle raced us and is
                // mid-drop; treat the key as absent and load afresh.
                Some(Slot::Ready(weak)) => {
                    weak.upgrade().map_or(Found::Absent, Found::Value)
                }
                Some(Slot::Loading(channel)) => Found::InFlight(channel.clone()),
                None => Found::Absent,
            };
            match found {
                Found::Value(cell) => return Ok(ValueHandle { cell }),
                Found::InFlight(channel) => channel,
                Found::Absent => self.spawn_load(&mut map, key.clone(), load()),
            }
        };

        match channel.await {
            Ok(result) => result,
            Err(oneshot::Canceled) => Err(CacheError::Cancelled),
        }
    }

    /// The current size of the key table. The cache keeps its own index
    /// sized in step with this.
    pub(crate) fn buckets_count(&self) -> usize {
        self.registry.lock().capacity()
    }

    /// Opportunistically shrinks the key table once occupancy has drifted
    /// far below its capacity. Never fails the caller.
    pub(crate) fn rehash(&self) {
        let mut map = self.registry.lock();
        if map.capacity() > 64 && map.capacity() / 4 > map.len() {
            map.shrink_to_fit();
        }
    }

    #[cfg(test)]
    pub(crate) fn keys_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Registers the in-flight slot and spawns the load. Must be called with
    /// the registry lock held so the spawned task cannot observe the map
    /// before its own slot is in place.
    fn spawn_load(
        &self,
        map: &mut HashMap<K, Slot<K, V>>,
        key: K,
        load: BoxFuture<'static, CacheResult<V>>,
    ) -> LoadChannel<K, V> {
        let (sender, receiver) = oneshot::channel();
        let channel: LoadChannel<K, V> = receiver.shared();
        map.insert(key.clone(), Slot::Loading(channel.clone()));

        let registry = Arc::downgrade(&self.registry);
        tokio::spawn(async move {
            // If this task dies before settling the slot, waiters see the
            // channel close; clearing the slot lets the next request retry.
            let guard_registry = registry.clone();
            let guard_key = key.clone();
            let abort_guard = CallOnDrop::new(move || {
                if let Some(registry) = guard_registry.upgrade() {
                    let mut map = registry.lock();
                    if let Some(Slot::Loading(_)) = map.get(&guard_key) {
                        map.remove(&guard_key);
                    }
                }
            });

            let result = match load.await {
                Ok(value) => match registry.upgrade() {
                    Some(registry) => {
                        let cell = Arc::new(ValueCell {
                            key: key.clone(),
                            value: RwLock::new(value),
                            registry: Arc::downgrade(&registry),
                        });
                        registry.lock().insert(key, Slot::Ready(Arc::downgrade(&cell)));
                        Ok(ValueHandle { cell })
                    }
                    None => Err(CacheError::Cancelled),
                },
                Err(err) => {
                    if let Some(registry) = registry.upgrade() {
                        registry.lock().remove(&key);
                    }
                    Err(err)
                }
            };

            drop(abort_guard);
            sender.send(result).ok();
        });

        channel
    }
}

impl<K: Eq + Hash, V> fmt::Debug for SingleFlight<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self.registry.try_lock().map(|map| map.len());
        f.debug_struct("SingleFlight")
            .field("keys", &keys.unwrap_or_default())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn slow_loader(
        calls: &Arc<AtomicUsize>,
        value: u32,
    ) -> impl FnOnce() -> BoxFuture<'static, CacheResult<u32>> {
        let calls = calls.clone();
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(value)
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_loads_coalesce() {
        let flight: SingleFlight<u32, u32> = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b, c) = futures::join!(
            flight.get_or_load(&7, slow_loader(&calls, 14)),
            flight.get_or_load(&7, slow_loader(&calls, 14)),
            flight.get_or_load(&7, slow_loader(&calls, 14)),
        );

        assert_eq!(a.unwrap().value(), 14);
        assert_eq!(b.unwrap().value(), 14);
        assert_eq!(c.unwrap().value(), 14);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_referenced_value_is_reused() {
        let flight: SingleFlight<u32, u32> = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let handle = flight
            .get_or_load(&1, slow_loader(&calls, 10))
            .await
            .unwrap();
        let again = flight
            .get_or_load(&1, slow_loader(&calls, 10))
            .await
            .unwrap();

        assert_eq!(handle.value(), 10);
        assert_eq!(again.value(), 10);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flight.keys_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_handle_drop_clears_key() {
        let flight: SingleFlight<u32, u32> = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let handle = flight
            .get_or_load(&1, slow_loader(&calls, 10))
            .await
            .unwrap();
        let clone = handle.clone();
        drop(handle);
        assert_eq!(flight.keys_count(), 1);

        drop(clone);
        assert_eq!(flight.keys_count(), 0);

        // A later request loads afresh.
        let handle = flight
            .get_or_load(&1, slow_loader(&calls, 10))
            .await
            .unwrap();
        assert_eq!(handle.value(), 10);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reaches_all_joiners() {
        let flight: SingleFlight<u32, u32> = SingleFlight::new();

        let failing = || {
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(CacheError::LoadFailed("backend unavailable".into()))
            }
            .boxed()
        };

        let (a, b) = futures::join!(
            flight.get_or_load(&7, failing),
            flight.get_or_load(&7, failing),
        );

        let expected = CacheError::LoadFailed("backend unavailable".into());
        assert_eq!(a.unwrap_err(), expected);
        assert_eq!(b.unwrap_err(), expected);

        // Failures leave no trace behind.
        assert_eq!(flight.keys_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_through_handle_is_observed() {
        let flight: SingleFlight<u32, u32> = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let handle = flight
            .get_or_load(&1, slow_loader(&calls, 10))
            .await
            .unwrap();
        let other = handle.clone();

        handle.replace(11);
        assert_eq!(other.value(), 11);
        assert_eq!(other.with(|v| *v + 1), 12);
    }
}
