//! The time source for all age and recency decisions.
//!
//! Everything in this crate measures time with [`tokio::time::Instant`]: it
//! is monotonic, cheap to read, and can be paused and advanced from tests,
//! which makes expiry and refresh behavior fully deterministic under
//! `tokio::time::pause`.

pub(crate) use tokio::time::Instant;

/// Returns the current instant on the cache clock.
pub(crate) fn now() -> Instant {
    Instant::now()
}
