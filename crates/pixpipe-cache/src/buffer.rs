//! 64-byte aligned heap buffers backing each cacheline.
//!
//! Pixel stages read cached buffers with SIMD loads, so every buffer
//! starts on a 64-byte boundary. The allocation is a `Vec` of aligned
//! blocks viewed as bytes through [`bytemuck`], which keeps the crate
//! free of `unsafe`.
//!
//! Allocation is fallible: [`AlignedBuffer::try_new`] reports an
//! exhausted allocator as [`CacheError::Allocation`] instead of
//! aborting the process.

use std::fmt;

use crate::error::CacheError;

/// Alignment of every cacheline buffer in bytes.
pub const ALIGNMENT: usize = 64;

/// Byte written over fresh allocations in debug builds so reads of
/// pixels nobody wrote are easy to spot.
pub const POISON: u8 = 0x5d;

#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C, align(64))]
struct Block([u8; ALIGNMENT]);

/// Identity of a buffer allocation, used to find a cacheline from a
/// buffer handed out earlier by [`get`](crate::PixelpipeCache::get).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferAddr(usize);

/// An owned, 64-byte aligned byte buffer of a fixed length.
pub struct AlignedBuffer {
    blocks: Vec<Block>,
    len: usize,
}

impl AlignedBuffer {
    /// Allocate `len` bytes.
    ///
    /// Debug builds fill the buffer with [`POISON`]; release builds
    /// zero it.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Allocation`] if the allocator cannot
    /// satisfy the request.
    pub fn try_new(len: usize) -> Result<Self, CacheError> {
        let count = len.div_ceil(ALIGNMENT);
        let mut blocks = Vec::new();
        blocks
            .try_reserve_exact(count)
            .map_err(|_| CacheError::Allocation { bytes: len })?;
        let fill = if cfg!(debug_assertions) { POISON } else { 0 };
        blocks.resize(count, Block([fill; ALIGNMENT]));
        Ok(Self { blocks, len })
    }

    /// Length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for a zero-length buffer.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The buffer contents.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &bytemuck::cast_slice::<Block, u8>(&self.blocks)[..self.len]
    }

    /// The buffer contents, mutably.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<Block, u8>(&mut self.blocks)[..self.len]
    }

    /// Identity of this allocation.
    #[must_use]
    pub fn addr(&self) -> BufferAddr {
        BufferAddr(self.blocks.as_ptr().addr())
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("addr", &self.addr())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn start_is_64_byte_aligned() {
        for len in [1, 63, 64, 65, 1000, 4096] {
            let buf = AlignedBuffer::try_new(len).unwrap();
            assert_eq!(buf.as_slice().as_ptr().addr() % ALIGNMENT, 0, "len {len}");
        }
    }

    #[test]
    fn slice_length_is_exact() {
        let mut buf = AlignedBuffer::try_new(100).unwrap();
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.as_slice().len(), 100);
        assert_eq!(buf.as_mut_slice().len(), 100);
    }

    #[test]
    fn writes_are_visible() {
        let mut buf = AlignedBuffer::try_new(8).unwrap();
        buf.as_mut_slice().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    #[cfg(debug_assertions)]
    fn debug_builds_poison_fresh_memory() {
        let buf = AlignedBuffer::try_new(70).unwrap();
        assert!(buf.as_slice().iter().all(|&b| b == POISON));
    }

    #[test]
    fn zero_length_buffer() {
        let buf = AlignedBuffer::try_new(0).unwrap();
        assert!(buf.is_empty());
        assert!(buf.as_slice().is_empty());
    }

    #[test]
    fn oversized_request_fails_without_aborting() {
        let result = AlignedBuffer::try_new(usize::MAX - 1);
        assert_eq!(
            result.map(|b| b.len()),
            Err(CacheError::Allocation {
                bytes: usize::MAX - 1
            })
        );
    }

    #[test]
    fn distinct_buffers_have_distinct_addrs() {
        let a = AlignedBuffer::try_new(64).unwrap();
        let b = AlignedBuffer::try_new(64).unwrap();
        assert_ne!(a.addr(), b.addr());
    }
}
