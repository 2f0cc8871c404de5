//! Pipe type and mask display tags folded into every basic hash.

use serde::{Deserialize, Serialize};

/// Which pipeline instance a cache belongs to.
///
/// Different pipe types never share cache keys: the type is part of
/// the hash seed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipeType {
    /// Full-resolution interactive pipe for the center view.
    #[default]
    Full,
    /// Downscaled interactive preview of the whole image.
    Preview,
    /// Second preview window.
    Preview2,
    /// File export.
    Export,
    /// Thumbnail generation.
    Thumbnail,
}

impl PipeType {
    /// Stable tag value hashed into the seed.
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::Full => 1 << 0,
            Self::Preview => 1 << 1,
            Self::Export => 1 << 2,
            Self::Thumbnail => 1 << 3,
            Self::Preview2 => 1 << 4,
        }
    }

    /// Whether this pipe type runs with the two-line alternating cache.
    #[must_use]
    pub const fn is_alternating(self) -> bool {
        matches!(self, Self::Export | Self::Thumbnail)
    }
}

/// Debug overlay state of a pipe, as a set of flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaskDisplay(u32);

impl MaskDisplay {
    /// Regular output, no overlay.
    pub const NONE: Self = Self(0);
    /// Drawn mask shown on top of the image.
    pub const MASK: Self = Self(1 << 0);
    /// A single channel is displayed instead of the image.
    pub const CHANNEL: Self = Self(1 << 1);
    /// Channel display shows the module output rather than its input.
    pub const OUTPUT: Self = Self(1 << 2);
    /// Any of the per-channel display modes.
    pub const ANY: Self = Self(0xff << 2);
    /// Modules pass the mask through to the display untouched.
    pub const PASSTHRU: Self = Self(1 << 16);

    /// Raw flag bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Union of two flag sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether any flag of `other` is set in `self`.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Buffers written in this mode are ephemeral debug output and get
    /// the stale weight instead of being kept for reuse.
    #[must_use]
    pub const fn avoids_caching(self) -> bool {
        self.intersects(Self::PASSTHRU.union(Self::ANY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_type_bits_are_distinct() {
        let all = [
            PipeType::Full,
            PipeType::Preview,
            PipeType::Preview2,
            PipeType::Export,
            PipeType::Thumbnail,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.bits(), b.bits());
            }
        }
    }

    #[test]
    fn plain_mask_overlay_still_caches() {
        assert!(!MaskDisplay::NONE.avoids_caching());
        assert!(!MaskDisplay::MASK.avoids_caching());
    }

    #[test]
    fn channel_and_passthru_avoid_caching() {
        assert!(
            MaskDisplay::CHANNEL
                .union(MaskDisplay::OUTPUT)
                .avoids_caching()
        );
        assert!(MaskDisplay::PASSTHRU.avoids_caching());
        assert!(
            MaskDisplay::MASK
                .union(MaskDisplay::PASSTHRU)
                .avoids_caching()
        );
    }
}
