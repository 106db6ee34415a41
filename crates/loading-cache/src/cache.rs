//! The cache engine: lookup, insertion, eviction, and the periodic
//! maintenance task that expires, shrinks, and reloads entries.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;

use crate::clock::{self, Instant};
use crate::config::CacheConfig;
use crate::entry::Entry;
use crate::error::{CacheError, CacheResult};
use crate::lru::{EntryId, LruList};
use crate::singleflight::{SingleFlight, ValueHandle};

/// Produces values for cache keys.
///
/// Implemented by anything that can asynchronously resolve a key, typically a
/// database or remote lookup. Closures of the shape
/// `Fn(&K) -> BoxFuture<'static, CacheResult<V>>` implement it out of the box.
pub trait Loader<K, V>: Send + Sync + 'static {
    /// Loads the value for `key`.
    fn load(&self, key: &K) -> BoxFuture<'static, CacheResult<V>>;
}

impl<K, V, F> Loader<K, V> for F
where
    F: Fn(&K) -> BoxFuture<'static, CacheResult<V>> + Send + Sync + 'static,
{
    fn load(&self, key: &K) -> BoxFuture<'static, CacheResult<V>> {
        self(key)
    }
}

/// Gives every cached value its size.
///
/// The summed sizes of all entries are capped by
/// [`CacheConfig::max_size`]; the weight is computed once per (re)load.
pub trait EntryWeight<V>: Send + Sync + 'static {
    /// The size of `value`, in whatever unit `max_size` is expressed in.
    fn weight(value: &V) -> u64;
}

/// The default weight: every entry counts as 1, turning `max_size` into an
/// entry-count cap.
#[derive(Debug)]
pub struct UnitWeight;

impl<V> EntryWeight<V> for UnitWeight {
    fn weight(_value: &V) -> u64 {
        1
    }
}

struct CacheState<K: Eq + Hash, V> {
    index: HashMap<K, EntryId>,
    lru: LruList<K, V>,
    current_size: u64,
    stopped: bool,
}

struct CacheShared<K: Eq + Hash, V> {
    config: CacheConfig,
    loader: Option<Arc<dyn Loader<K, V>>>,
    loading: SingleFlight<K, V>,
    state: Mutex<CacheState<K, V>>,
}

struct TimerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// An asynchronous, size-bounded, expiring loading cache.
///
/// Values are produced by an asynchronous [`Loader`], with at most one load
/// in flight per key no matter how many requesters arrive concurrently.
/// Entries expire when unread for longer than [`CacheConfig::expiry`] and are
/// evicted least-recently-read first once the summed entry sizes exceed
/// [`CacheConfig::max_size`]. With [`CacheConfig::refresh`] set, a background
/// task reloads entries on a fixed cadence so hot keys are served without
/// ever waiting for the loader once primed; entries whose reloads keep
/// failing age out through the expiry bound instead of serving stale data
/// forever.
///
/// The cache must be created inside a Tokio runtime. Call [`stop`] for an
/// orderly shutdown that drains in-flight background reloads; merely dropping
/// the cache also terminates the maintenance task, just without waiting for
/// it.
///
/// [`stop`]: LoadingCache::stop
pub struct LoadingCache<K: Eq + Hash, V, W = UnitWeight> {
    shared: Arc<CacheShared<K, V>>,
    timer: Mutex<Option<TimerHandle>>,
    _weight: PhantomData<W>,
}

impl<K, V, W> LoadingCache<K, V, W>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
    W: EntryWeight<V>,
{
    /// Creates a cache without a configured loader.
    ///
    /// Values are loaded through the per-call loaders of [`get_with`] and
    /// [`get_handle_with`]. `config.refresh` must be `None`: background
    /// reloads need a loader the cache can call on its own.
    ///
    /// [`get_with`]: LoadingCache::get_with
    /// [`get_handle_with`]: LoadingCache::get_handle_with
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        Self::build(config, None)
    }

    /// Creates a cache around a configured loader.
    ///
    /// The loader serves [`get`]/[`get_handle`] misses and, when
    /// `config.refresh` is set, the background reload pass.
    ///
    /// [`get`]: LoadingCache::get
    /// [`get_handle`]: LoadingCache::get_handle
    pub fn with_loader(config: CacheConfig, loader: impl Loader<K, V>) -> CacheResult<Self> {
        Self::build(config, Some(Arc::new(loader)))
    }

    fn build(config: CacheConfig, loader: Option<Arc<dyn Loader<K, V>>>) -> CacheResult<Self> {
        config.validate(loader.is_some())?;
        let shared = Arc::new(CacheShared {
            config,
            loader,
            loading: SingleFlight::new(),
            state: Mutex::new(CacheState {
                index: HashMap::new(),
                lru: LruList::new(),
                current_size: 0,
                stopped: false,
            }),
        });
        let timer = shared
            .config
            .caching_enabled()
            .then(|| spawn_maintenance::<K, V, W>(Arc::downgrade(&shared)));
        Ok(LoadingCache {
            shared,
            timer: Mutex::new(timer),
            _weight: PhantomData,
        })
    }

    /// Returns the value for `key`, loading it through the configured loader
    /// if necessary.
    ///
    /// With caching disabled (zero expiry) this delegates straight to the
    /// loader. Otherwise a hit refreshes the entry's recency; a miss loads
    /// the value, sharing the load with any concurrent request for the same
    /// key, and inserts it.
    pub async fn get(&self, key: &K) -> CacheResult<V>
    where
        V: Clone,
    {
        let loader = self.configured_loader()?.clone();
        if !self.shared.config.caching_enabled() {
            return loader.load(key).await;
        }
        let handle = self
            .load_through_cache(key, || loader.load(key))
            .await?;
        Ok(handle.value())
    }

    /// Like [`get`](LoadingCache::get), with a per-call loader.
    pub async fn get_with<F, Fut>(&self, key: &K, load: F) -> CacheResult<V>
    where
        V: Clone,
        F: FnOnce(&K) -> Fut,
        Fut: Future<Output = CacheResult<V>> + Send + 'static,
    {
        if !self.shared.config.caching_enabled() {
            return load(key).await;
        }
        let handle = self
            .load_through_cache(key, move || load(key).boxed())
            .await?;
        Ok(handle.value())
    }

    /// Returns a shared handle to the value for `key`, loading it through
    /// the configured loader if necessary.
    ///
    /// The handle stays dereferenceable after the entry is erased or
    /// evicted; it is the way to hold a value across suspension points
    /// without pinning cache membership.
    pub async fn get_handle(&self, key: &K) -> CacheResult<ValueHandle<K, V>> {
        let loader = self.configured_loader()?.clone();
        if !self.shared.config.caching_enabled() {
            let value = loader.load(key).await?;
            return Ok(ValueHandle::detached(key.clone(), value));
        }
        self.load_through_cache(key, || loader.load(key)).await
    }

    /// Like [`get_handle`](LoadingCache::get_handle), with a per-call loader.
    pub async fn get_handle_with<F, Fut>(&self, key: &K, load: F) -> CacheResult<ValueHandle<K, V>>
    where
        F: FnOnce(&K) -> Fut,
        Fut: Future<Output = CacheResult<V>> + Send + 'static,
    {
        if !self.shared.config.caching_enabled() {
            let value = load(key).await?;
            return Ok(ValueHandle::detached(key.clone(), value));
        }
        self.load_through_cache(key, move || load(key).boxed())
            .await
    }

    /// Returns a handle to the materialized entry for `key`, if any.
    ///
    /// This is a probe: it neither loads nor counts as a read, and it never
    /// suspends. Keys whose load is still in flight report `None`.
    pub fn find(&self, key: &K) -> Option<ValueHandle<K, V>> {
        let state = self.shared.state.lock();
        let id = *state.index.get(key)?;
        state.lru.get(id).map(|entry| entry.handle().clone())
    }

    /// Returns a copy of the cached value for `key`.
    ///
    /// Unlike [`find`](LoadingCache::find) this counts as a read. Fails with
    /// [`CacheError::NotFound`] if the key has no materialized entry.
    pub fn at(&self, key: &K) -> CacheResult<V>
    where
        V: Clone,
    {
        self.touch_existing(key)
            .map(|handle| handle.value())
            .ok_or(CacheError::NotFound)
    }

    /// Removes the entry for `key`; reports whether one was present.
    ///
    /// Handles already given out keep the value alive past the removal.
    pub fn erase(&self, key: &K) -> bool {
        let mut state = self.shared.state.lock();
        let CacheState {
            index,
            lru,
            current_size,
            ..
        } = &mut *state;
        let Some(id) = index.remove(key) else {
            return false;
        };
        if let Some(entry) = lru.remove(id) {
            tracing::trace!(key = ?entry.key(), "erasing the entry");
            *current_size -= entry.size();
        }
        true
    }

    /// Removes every entry whose value matches `pred`.
    ///
    /// The predicate peeks at values without refreshing their recency.
    pub fn remove_if(&self, mut pred: impl FnMut(&V) -> bool) {
        let mut state = self.shared.state.lock();
        let CacheState {
            index,
            lru,
            current_size,
            ..
        } = &mut *state;
        lru.remove_if(
            |entry| entry.peek(&mut pred),
            |entry| {
                tracing::trace!(key = ?entry.key(), "removing the entry on predicate");
                index.remove(entry.key());
                *current_size -= entry.size();
            },
        );
    }

    /// A snapshot of handles to all materialized entries.
    ///
    /// The order is unspecified but stable as long as the cache is not
    /// mutated in between.
    pub fn iter(&self) -> impl Iterator<Item = ValueHandle<K, V>> {
        let state = self.shared.state.lock();
        let handles: Vec<_> = state
            .index
            .values()
            .filter_map(|&id| state.lru.get(id))
            .map(|entry| entry.handle().clone())
            .collect();
        handles.into_iter()
    }

    /// The number of materialized entries.
    pub fn entries_count(&self) -> usize {
        self.shared.state.lock().index.len()
    }

    /// The summed size of all materialized entries.
    pub fn size(&self) -> u64 {
        self.shared.state.lock().current_size
    }

    /// The configuration the cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Shuts the maintenance task down and waits for it to settle.
    ///
    /// After `stop` returns, no further loader invocations originate from
    /// the cache itself: the timer is cancelled and any in-flight background
    /// reloads have been drained. Requests keep being served; misses load in
    /// the foreground as usual. Calling `stop` again is a no-op.
    pub async fn stop(&self) {
        let timer = self.timer.lock().take();
        self.shared.state.lock().stopped = true;
        if let Some(TimerHandle { shutdown, task }) = timer {
            let _ = shutdown.send(());
            task.await.ok();
        }
    }

    fn configured_loader(&self) -> CacheResult<&Arc<dyn Loader<K, V>>> {
        self.shared.loader.as_ref().ok_or(CacheError::Configuration(
            "cache has no configured loader; use get_with or get_handle_with",
        ))
    }

    /// The common hit-or-load path for all caching-enabled lookups.
    async fn load_through_cache<F>(&self, key: &K, load: F) -> CacheResult<ValueHandle<K, V>>
    where
        F: FnOnce() -> BoxFuture<'static, CacheResult<V>>,
    {
        if let Some(handle) = self.touch_existing(key) {
            return Ok(handle);
        }

        let handle = self.shared.loading.get_or_load(key, load).await?;

        // A concurrent request may have inserted the entry while we were
        // suspended on the load; re-check before taking the insert path.
        self.insert_handle(handle)
    }

    fn touch_existing(&self, key: &K) -> Option<ValueHandle<K, V>> {
        let mut state = self.shared.state.lock();
        let id = *state.index.get(key)?;
        Self::touch_entry(&mut state, id, clock::now())
    }

    fn touch_entry(
        state: &mut CacheState<K, V>,
        id: EntryId,
        now: Instant,
    ) -> Option<ValueHandle<K, V>> {
        let entry = state.lru.get_mut(id)?;
        entry.touch(now);
        state.lru.move_to_front(id);
        state.lru.get(id).map(|entry| entry.handle().clone())
    }

    fn insert_handle(&self, handle: ValueHandle<K, V>) -> CacheResult<ValueHandle<K, V>> {
        let mut state = self.shared.state.lock();
        let now = clock::now();

        if let Some(&id) = state.index.get(handle.key()) {
            if let Some(existing) = Self::touch_entry(&mut state, id, now) {
                return Ok(existing);
            }
        }

        let size = handle.with(W::weight);
        let max_size = self.shared.config.max_size;
        if size > max_size {
            tracing::trace!(key = ?handle.key(), size, max_size, "loaded value does not fit");
            return Err(CacheError::EntryTooBig { size, max_size });
        }

        align_index(&mut state, &self.shared.loading);

        tracing::trace!(key = ?handle.key(), size, "storing the value for the first time");
        let id = state.lru.push_front(Entry::new(handle.clone(), size, now));
        state.index.insert(handle.key().clone(), id);
        state.current_size += size;

        // The caller must never observe an oversized cache.
        shrink(&mut state, max_size);
        Ok(handle)
    }
}

impl<K: Eq + Hash, V, W> fmt::Debug for LoadingCache<K, V, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (entries, current_size) = self
            .shared
            .state
            .try_lock()
            .map(|state| (state.index.len(), state.current_size))
            .unwrap_or_default();
        f.debug_struct("LoadingCache")
            .field("entries", &entries)
            .field("current_size", &current_size)
            .field("max_size", &self.shared.config.max_size)
            .finish()
    }
}

/// Evicts least recently read entries until the cache fits its bound again.
fn shrink<K, V>(state: &mut CacheState<K, V>, max_size: u64)
where
    K: Eq + Hash + fmt::Debug,
{
    while state.current_size > max_size {
        let Some(id) = state.lru.back() else {
            break;
        };
        let Some(entry) = state.lru.remove(id) else {
            break;
        };
        tracing::trace!(key = ?entry.key(), size = entry.size(), "evicting the least recently read entry");
        state.index.remove(entry.key());
        state.current_size -= entry.size();
    }
}

/// Drops entries that have gone unread for longer than `expiry` and, with
/// reloads enabled, entries whose last successful load is older than that.
///
/// The second clause makes entries with persistently failing reloads age out
/// even while they are still being read.
fn drop_expired<K, V>(
    state: &mut CacheState<K, V>,
    expiry: Duration,
    reload_enabled: bool,
    now: Instant,
) where
    K: Eq + Hash + fmt::Debug,
{
    let CacheState {
        index,
        lru,
        current_size,
        ..
    } = state;
    lru.remove_if(
        |entry| {
            let idle = now.saturating_duration_since(entry.last_read_at());
            let stale = now.saturating_duration_since(entry.loaded_at());
            idle > expiry || (reload_enabled && stale > expiry)
        },
        |entry| {
            tracing::trace!(key = ?entry.key(), "dropping the expired entry");
            index.remove(entry.key());
            *current_size -= entry.size();
        },
    );
}

/// Keeps the index table sized in step with the single-flight map, which
/// carries the same live key set. Sizing failures are swallowed; lookups
/// keep working with the table as it is.
fn align_index<K, V>(state: &mut CacheState<K, V>, loading: &SingleFlight<K, V>)
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let target = loading.buckets_count();
    let capacity = state.index.capacity();
    if capacity < target {
        let _ = state.index.try_reserve(target - state.index.len());
    } else if capacity > target {
        state.index.shrink_to(target);
    }
}

fn spawn_maintenance<K, V, W>(shared: Weak<CacheShared<K, V>>) -> TimerHandle
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
    W: EntryWeight<V>,
{
    let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let Some(period) = shared.upgrade().map(|shared| shared.config.timer_period()) else {
            return;
        };
        let mut next_tick = clock::now() + period;
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = time::sleep_until(next_tick) => {}
            }
            let Some(shared) = shared.upgrade() else {
                break;
            };
            let tick_start = clock::now();
            run_tick::<K, V, W>(&shared, tick_start).await;
            next_tick = tick_start + period;
        }
        tracing::trace!("maintenance task terminated");
    });
    TimerHandle { shutdown, task }
}

/// One maintenance pass: expire, shrink, rehash, then fan the reloads out.
async fn run_tick<K, V, W>(shared: &Arc<CacheShared<K, V>>, tick_start: Instant)
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
    W: EntryWeight<V>,
{
    tracing::trace!("maintenance tick");
    let reload_enabled = shared.config.reload_enabled();

    let stale_keys = {
        let mut state = shared.state.lock();
        drop_expired(
            &mut state,
            shared.config.expiry,
            reload_enabled,
            tick_start,
        );
        shrink(&mut state, shared.config.max_size);
        align_index(&mut state, &shared.loading);
        shared.loading.rehash();

        match shared.config.refresh {
            Some(refresh) if !state.stopped => state
                .lru
                .iter()
                .filter(|(_, entry)| entry.loaded_at() + refresh < tick_start)
                .map(|(_, entry)| entry.key().clone())
                .collect(),
            _ => Vec::new(),
        }
    };

    if stale_keys.is_empty() {
        return;
    }
    let Some(loader) = shared.loader.clone() else {
        return;
    };

    let reloads = stale_keys.into_iter().map(|key| {
        let loader = loader.clone();
        let shared = Arc::clone(shared);
        async move {
            tracing::trace!(key = ?key, "reloading the value");
            let result = loader.load(&key).await;
            finish_reload::<K, V, W>(&shared, key, result);
        }
    });
    future::join_all(reloads).await;
}

/// Applies one background reload outcome.
///
/// Failures are logged and swallowed: if they persist, the entry ages out
/// through the expiry bound on its load time and the next foreground request
/// surfaces the error to its caller.
fn finish_reload<K, V, W>(shared: &CacheShared<K, V>, key: K, result: CacheResult<V>)
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
    W: EntryWeight<V>,
{
    let value = match result {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(key = ?key, error = %err, "reload failed");
            return;
        }
    };

    let mut state = shared.state.lock();
    let CacheState {
        index,
        lru,
        current_size,
        ..
    } = &mut *state;
    let Some(&id) = index.get(&key) else {
        tracing::trace!(key = ?key, "entry was dropped during the reload");
        return;
    };
    let Some(entry) = lru.get_mut(id) else {
        return;
    };

    let new_size = W::weight(&value);
    let old_size = entry.size();
    entry.assign(value, new_size, clock::now());
    *current_size = *current_size - old_size + new_size;
    if new_size > old_size {
        shrink(&mut state, shared.config.max_size);
    }
}
