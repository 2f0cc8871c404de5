//! Cache sizing configuration.

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Sizing of a [`PixelpipeCache`](crate::PixelpipeCache).
///
/// Interactive pipes use many lazily grown lines under a memory limit.
/// Export and thumbnail pipes use exactly two preallocated lines that
/// alternate on every query and never search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of cachelines. At least 2.
    pub entries: usize,

    /// Bytes to preallocate per line, or 0 to grow lines on first use.
    pub line_size: usize,

    /// Upper bound on allocated bytes enforced by
    /// [`reclaim_memory`](crate::PixelpipeCache::reclaim_memory), or 0
    /// for no limit.
    pub memory_limit: usize,
}

impl CacheConfig {
    /// Default number of lines for interactive pipes.
    pub const DEFAULT_ENTRIES: usize = 64;

    /// Default memory limit for interactive pipes (1 GiB).
    pub const DEFAULT_MEMORY_LIMIT: usize = 1 << 30;

    /// Lines of the small interactive preview pipe.
    pub const PREVIEW_ENTRIES: usize = 12;

    /// Two preallocated alternating lines for an export pipe.
    #[must_use]
    pub const fn export(line_size: usize) -> Self {
        Self {
            entries: 2,
            line_size,
            memory_limit: 0,
        }
    }

    /// Two preallocated alternating lines for a thumbnail pipe.
    #[must_use]
    pub const fn thumbnail(line_size: usize) -> Self {
        Self::export(line_size)
    }

    /// Lazily grown lines for the preview pipe, bounded by the default
    /// limit.
    #[must_use]
    pub const fn preview() -> Self {
        Self {
            entries: Self::PREVIEW_ENTRIES,
            line_size: 0,
            memory_limit: Self::DEFAULT_MEMORY_LIMIT,
        }
    }

    /// Lazily grown lines for the full-resolution pipe with the given
    /// memory limit.
    #[must_use]
    pub const fn full(memory_limit: usize) -> Self {
        Self {
            entries: Self::DEFAULT_ENTRIES,
            line_size: 0,
            memory_limit,
        }
    }

    /// The same configuration without preallocation, used as a fallback
    /// when preallocating fails.
    #[must_use]
    pub const fn lazy(&self) -> Self {
        Self {
            entries: self.entries,
            line_size: 0,
            memory_limit: self.memory_limit,
        }
    }

    /// Whether lines alternate instead of being searched.
    #[must_use]
    pub const fn is_alternating(&self) -> bool {
        self.entries == 2
    }

    /// Check invariants.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfig`] if `entries < 2`.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.entries < 2 {
            return Err(CacheError::InvalidConfig(format!(
                "a cache needs at least 2 lines, got {}",
                self.entries
            )));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::full(Self::DEFAULT_MEMORY_LIMIT)
    }
}
