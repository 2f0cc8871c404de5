//! Error types for the cache store.

/// Errors surfaced by [`PixelpipeCache::new`](crate::PixelpipeCache::new)
/// and the aligned allocation primitive.
///
/// Lookups never return these: a failed allocation inside
/// [`PixelpipeCache::get`](crate::PixelpipeCache::get) degrades to an
/// empty cacheline instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// Cache configuration is invalid.
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),

    /// The allocator refused a buffer of the given size.
    #[error("failed to allocate {bytes} bytes for a cacheline")]
    Allocation {
        /// Requested allocation size in bytes.
        bytes: usize,
    },
}
