use thiserror::Error;

/// Result alias used throughout the cache.
pub type CacheResult<T> = Result<T, CacheError>;

/// An error produced by the cache itself or forwarded from a loader.
///
/// The enum is `Clone` because a single loader failure is broadcast to every
/// requester that joined the same in-flight load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The parameter combination passed at construction is unusable.
    #[error("invalid cache configuration: {0}")]
    Configuration(&'static str),

    /// A freshly loaded value is bigger than the whole cache.
    ///
    /// The loaded value is discarded and nothing is inserted.
    #[error("entry of size {size} exceeds the cache capacity of {max_size}")]
    EntryTooBig {
        /// Size of the rejected value, as reported by the entry weight.
        size: u64,
        /// The configured upper bound on the summed entry sizes.
        max_size: u64,
    },

    /// The requested key has no materialized entry.
    #[error("entry not found")]
    NotFound,

    /// The loader failed.
    ///
    /// The attached string carries the loader's own error message.
    #[error("load failed: {0}")]
    LoadFailed(String),

    /// The in-flight load was dropped before it produced a value.
    #[error("load was cancelled")]
    Cancelled,
}

impl CacheError {
    /// Wraps an arbitrary displayable loader error.
    pub fn load_failed(err: impl std::fmt::Display) -> Self {
        CacheError::LoadFailed(err.to_string())
    }
}
