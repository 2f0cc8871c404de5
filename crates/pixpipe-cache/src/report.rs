//! Human- and machine-readable cache statistics.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Bytes to mebibytes, rounded to nearest.
#[must_use]
pub const fn to_mb(bytes: usize) -> usize {
    bytes.saturating_add(0x80000) / (1 << 20)
}

/// Snapshot of a cache's usage and effectiveness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheReport {
    /// Number of cachelines.
    pub entries: usize,
    /// Lookups since construction or the last flush.
    pub queries: u64,
    /// Lookups that needed a fresh buffer.
    pub misses: u64,
    /// `(queries - misses) / queries`, or 0 without queries.
    pub hit_rate: f64,
    /// Bytes currently allocated across all lines.
    pub bytes_used: usize,
    /// Configured limit, 0 for none.
    pub memory_limit: usize,
    /// Lines below zero weight.
    pub important_lines: usize,
    /// Lines holding an allocation.
    pub used_lines: usize,
}

impl CacheReport {
    /// Hit rate for the given counters.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(queries: u64, misses: u64) -> f64 {
        if queries == 0 {
            return 0.0;
        }
        queries.saturating_sub(misses) as f64 / queries as f64
    }
}

impl fmt::Display for CacheReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} lines (important={}, used={}). Used {}MB, limit={}MB. Hitrate={:.2}",
            self.entries,
            self.important_lines,
            self.used_lines,
            to_mb(self.bytes_used),
            to_mb(self.memory_limit),
            self.hit_rate,
        )
    }
}

/// What one [`reclaim_memory`](crate::PixelpipeCache::reclaim_memory)
/// pass released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimStats {
    /// Bytes released.
    pub freed_bytes: usize,
    /// Quarantined lines freed unconditionally.
    pub hit_error_lines: usize,
    /// Cold lines freed to meet the limit.
    pub cold_lines: usize,
    /// Important lines freed to meet the limit.
    pub important_lines: usize,
}

impl ReclaimStats {
    /// Total lines freed.
    #[must_use]
    pub const fn lines(&self) -> usize {
        self.hit_error_lines + self.cold_lines + self.important_lines
    }
}
