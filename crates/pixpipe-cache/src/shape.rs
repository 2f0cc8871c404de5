//! Buffer shape descriptor stored alongside every cacheline.

use serde::{Deserialize, Serialize};

/// Storage type of a single channel value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelType {
    /// 8-bit unsigned integer.
    U8,
    /// 16-bit unsigned integer.
    U16,
    /// 16-bit IEEE float.
    F16,
    /// 32-bit IEEE float.
    #[default]
    F32,
}

impl PixelType {
    /// Size of one channel value in bytes.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 | Self::F16 => 2,
            Self::F32 => 4,
        }
    }
}

/// Layout of a cached pixel buffer.
///
/// Copied by value into the cacheline when a buffer is produced, so
/// downstream consumers can read it after the producer's copy is gone.
/// Two requests are shape-compatible only when both the byte size and
/// this descriptor match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferShape {
    /// Interleaved channels per pixel.
    pub channels: u8,
    /// Storage type of each channel value.
    pub datatype: PixelType,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Default for BufferShape {
    fn default() -> Self {
        Self::rgba_f32(0, 0)
    }
}

impl BufferShape {
    /// Four interleaved `f32` channels, the working format of most
    /// pipeline stages.
    #[must_use]
    pub const fn rgba_f32(width: u32, height: u32) -> Self {
        Self {
            channels: 4,
            datatype: PixelType::F32,
            width,
            height,
        }
    }

    /// Bytes occupied by one pixel.
    #[must_use]
    pub const fn bytes_per_pixel(&self) -> usize {
        self.channels as usize * self.datatype.bytes()
    }

    /// Bytes per row. Rows are tightly packed.
    #[must_use]
    pub const fn row_stride(&self) -> usize {
        self.bytes_per_pixel() * self.width as usize
    }

    /// Total buffer size in bytes, or `None` on overflow.
    #[must_use]
    pub fn byte_size(&self) -> Option<usize> {
        self.row_stride().checked_mul(usize::try_from(self.height).ok()?)
    }

    /// Whether a buffer of `byte_size` bytes described by `self` can
    /// stand in for one described by `other`.
    #[must_use]
    pub fn is_compatible(&self, byte_size: usize, other: &Self) -> bool {
        self == other && self.byte_size() == Some(byte_size)
    }
}
