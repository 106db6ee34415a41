//! An asynchronous, size-bounded, expiring loading cache with single-flight
//! loads and background refresh.
//!
//! The cache maps opaque keys to values produced by an asynchronous
//! [`Loader`]. It guarantees that at most one load is in flight per key no
//! matter how many requesters arrive concurrently, tracks recency and age
//! for eviction, and — with a refresh period configured — reloads cached
//! entries in the background so hot keys are served without ever waiting for
//! the loader once primed.
//!
//! ## How a request is served
//!
//! A `get` goes through the following steps:
//! - A hit on a materialized entry refreshes its recency and returns the
//!   cached value immediately.
//! - On miss, the request goes through the single-flight layer: if a load
//!   for the key is already in flight, the request joins it; otherwise it
//!   starts one. Either way the loader runs once and its outcome, success
//!   or failure, reaches every joined requester.
//! - The freshly loaded value is inserted as the most recently read entry,
//!   unless a concurrent request already inserted one, and the cache is
//!   shrunk back under its size bound before the caller resumes.
//!
//! Entries are dropped when they go unread for longer than the configured
//! expiry, when size pressure evicts them from the least recently read end,
//! or — with reloads enabled — when their last *successful* load is older
//! than the expiry. That last rule means a persistently failing backend
//! makes affected entries age out instead of serving stale data forever.
//!
//! Values are handed out either by copy ([`LoadingCache::get`]) or as
//! reference-counted [`ValueHandle`]s ([`LoadingCache::get_handle`]) that
//! stay alive past eviction and erasure.
//!
//! Setting a zero expiry disables caching entirely: every request is
//! delegated straight to the loader and the cache holds no entries.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use futures::FutureExt;
//! use loading_cache::{CacheConfig, CacheResult, LoadingCache};
//!
//! # async fn demo() -> CacheResult<()> {
//! let config = CacheConfig {
//!     max_size: 1024,
//!     expiry: Duration::from_secs(60),
//!     refresh: Some(Duration::from_secs(5)),
//! };
//!
//! let cache: LoadingCache<String, String> = LoadingCache::with_loader(config, |key: &String| {
//!     let key = key.clone();
//!     async move { CacheResult::Ok(format!("resolved {key}")) }.boxed()
//! })?;
//!
//! let value = cache.get(&"tenant-42".to_owned()).await?;
//! assert_eq!(value, "resolved tenant-42");
//!
//! cache.stop().await;
//! # Ok(())
//! # }
//! ```

mod cache;
mod clock;
mod config;
mod entry;
mod error;
mod lru;
mod singleflight;
mod utils;


pub use cache::{EntryWeight, Loader, LoadingCache, UnitWeight};
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use singleflight::ValueHandle;
