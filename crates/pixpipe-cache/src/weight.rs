//! Age and importance of a cacheline.
//!
//! Every line carries a [`LineWeight`]. Replacement and reclamation
//! compare lines through [`LineWeight::value`], a single signed scale
//! on which larger means colder:
//!
//! ```text
//! HitError      Important(d)   Fresh(a)        Stale(t)
//! -1_000_000 ... -d  ...  -1 | 0  1  2  ... | 1000 + t ...
//! ```
//!
//! Each [`get`](crate::PixelpipeCache::get) ages all lines by one step,
//! so importance decays into freshness and freshness into coldness
//! unless a line is re-pinned.

use serde::{Deserialize, Serialize};

/// Scale value of a line that must not be reused opportunistically.
pub const STALE_WEIGHT: i64 = 1000;

/// Scale value of a line quarantined after a hash/size mismatch.
pub const HIT_ERROR_WEIGHT: i64 = -1_000_000;

/// Age/importance state of one cacheline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineWeight {
    /// Pinned against ordinary eviction; larger depth is more important.
    Important(u32),
    /// Turns since last use.
    Fresh(u32),
    /// Content is flushed, invalidated or ephemeral; turns since then.
    Stale(u32),
    /// Hashes matched with a different size; freed on the next
    /// reclamation pass regardless of memory pressure.
    HitError,
}

impl LineWeight {
    /// Weight of a freshly pinned line in a cache of `entries` lines.
    #[must_use]
    pub fn important(entries: usize) -> Self {
        Self::Important(u32::try_from(entries).unwrap_or(u32::MAX))
    }

    /// Position on the coldness scale.
    #[must_use]
    pub fn value(self) -> i64 {
        match self {
            Self::Important(depth) => -i64::from(depth),
            Self::Fresh(age) => i64::from(age),
            Self::Stale(turns) => STALE_WEIGHT + i64::from(turns),
            Self::HitError => HIT_ERROR_WEIGHT,
        }
    }

    /// The weight one query later.
    #[must_use]
    pub const fn aged(self) -> Self {
        match self {
            Self::Important(0 | 1) => Self::Fresh(0),
            Self::Important(depth) => Self::Important(depth - 1),
            Self::Fresh(age) => Self::Fresh(age.saturating_add(1)),
            Self::Stale(turns) => Self::Stale(turns.saturating_add(1)),
            Self::HitError => Self::HitError,
        }
    }

    /// Below zero on the scale: pinned or quarantined.
    #[must_use]
    pub fn is_important(self) -> bool {
        self.value() < 0
    }

    /// Strictly below `-entries`, so a freshly pinned line (exactly
    /// `-entries`) is never mistaken for a quarantined one.
    #[must_use]
    pub fn is_hit_error(self, entries: usize) -> bool {
        self.value() < -i64::try_from(entries).unwrap_or(i64::MAX)
    }
}
