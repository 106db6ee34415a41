use std::time::Duration;

use serde::Deserialize;

use crate::error::{CacheError, CacheResult};

/// Configuration for a [`LoadingCache`](crate::LoadingCache).
///
/// Durations deserialize from humantime strings (`"10s"`, `"250ms"`), so the
/// struct can be embedded directly in a service's config file.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound on the summed size of all cached entries.
    ///
    /// Entry sizes come from the cache's [`EntryWeight`](crate::EntryWeight)
    /// parameter; with the default weight of 1 per entry this is an entry
    /// count. Must be nonzero when caching is enabled.
    pub max_size: u64,

    /// How long an entry may go unread before it is dropped.
    ///
    /// With background reloads enabled this also bounds staleness: an entry
    /// whose reloads keep failing is dropped once its last successful load is
    /// older than this, even if it is still being read.
    ///
    /// A zero expiry disables caching entirely; every request goes straight
    /// to the loader.
    #[serde(with = "humantime_serde")]
    pub expiry: Duration,

    /// Cadence at which cached entries are reloaded in the background.
    ///
    /// `None` disables background reloads. When set it must be nonzero and
    /// the cache needs a configured loader.
    ///
    /// To keep hot entries served without ever blocking on the loader, pick
    /// an expiry of at least `refresh` plus the typical load latency.
    #[serde(with = "humantime_serde")]
    pub refresh: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_size: 1024,
            expiry: Duration::from_secs(60),
            refresh: None,
        }
    }
}

impl CacheConfig {
    /// Whether this configuration caches at all.
    pub fn caching_enabled(&self) -> bool {
        !self.expiry.is_zero()
    }

    /// Whether entries are reloaded in the background.
    pub fn reload_enabled(&self) -> bool {
        self.caching_enabled() && self.refresh.is_some()
    }

    /// The cadence of the maintenance timer.
    pub(crate) fn timer_period(&self) -> Duration {
        match self.refresh {
            Some(refresh) => self.expiry.min(refresh),
            None => std::cmp::max(self.expiry / 2, Duration::from_millis(1)),
        }
    }

    /// Checks the parameter combination; `has_loader` says whether the cache
    /// was handed a loader at construction.
    pub(crate) fn validate(&self, has_loader: bool) -> CacheResult<()> {
        if !self.caching_enabled() {
            // Disabled caching ignores every other knob.
            return Ok(());
        }
        if self.max_size == 0 {
            return Err(CacheError::Configuration(
                "caching is enabled but max_size is zero",
            ));
        }
        match self.refresh {
            Some(refresh) if refresh.is_zero() => Err(CacheError::Configuration(
                "caching is enabled but the refresh period is zero",
            )),
            Some(_) if !has_loader => Err(CacheError::Configuration(
                "background reload requires a loader",
            )),
            _ => Ok(()),
        }
    }
}
