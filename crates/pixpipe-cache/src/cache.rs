//! The cacheline store.
//!
//! A [`PixelpipeCache`] owns a fixed number of cachelines. Each line
//! holds one 64-byte aligned buffer together with the hashes of the
//! node output it contains, the buffer's shape, a [`LineWeight`], and
//! the name of the node that wrote it.
//!
//! # Replacement
//!
//! Every [`get`](PixelpipeCache::get) ages all lines by one step. Caches
//! with more than two lines search for a full-hash hit first; on a miss
//! they reuse, in order of preference:
//!
//! 1. the coldest line without a buffer,
//! 2. the coldest line with a buffer older than two queries,
//! 3. the coldest line overall, never one used by the previous query.
//!
//! Two-line caches skip the search and alternate on the query counter,
//! growing (never shrinking) their buffers as needed.
//!
//! # Ownership
//!
//! The store is not synchronized. Each pipe owns its own cache and the
//! driver serializes access to it.

use tracing::{debug, trace, warn};

use crate::buffer::{AlignedBuffer, BufferAddr};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::hash::HASH_UNASSIGNED;
use crate::mode::MaskDisplay;
use crate::report::{CacheReport, ReclaimStats, to_mb};
use crate::shape::BufferShape;
use crate::weight::LineWeight;

/// Index of a cacheline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineId(usize);

impl LineId {
    /// Position of the line in the store.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// One slot of the store.
#[derive(Debug)]
pub struct CacheLine {
    buffer: Option<AlignedBuffer>,
    size: usize,
    len: usize,
    shape: BufferShape,
    basic_hash: u64,
    full_hash: u64,
    weight: LineWeight,
    label: Option<&'static str>,
}

impl CacheLine {
    const fn empty() -> Self {
        Self {
            buffer: None,
            size: 0,
            len: 0,
            shape: BufferShape::rgba_f32(0, 0),
            basic_hash: HASH_UNASSIGNED,
            full_hash: HASH_UNASSIGNED,
            weight: LineWeight::Fresh(1),
            label: None,
        }
    }

    /// Allocated bytes, 0 without a buffer.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Whether the line holds an allocation.
    #[must_use]
    pub const fn is_allocated(&self) -> bool {
        self.buffer.is_some()
    }

    /// Hash of the content, independent of region of interest.
    #[must_use]
    pub const fn basic_hash(&self) -> u64 {
        self.basic_hash
    }

    /// Hash of the content at its region of interest.
    #[must_use]
    pub const fn full_hash(&self) -> u64 {
        self.full_hash
    }

    /// Current age/importance.
    #[must_use]
    pub const fn weight(&self) -> LineWeight {
        self.weight
    }

    /// Name of the node that last wrote the line.
    #[must_use]
    pub const fn label(&self) -> Option<&'static str> {
        self.label
    }

    /// Identity of the line's allocation.
    #[must_use]
    pub fn addr(&self) -> Option<BufferAddr> {
        self.buffer.as_ref().map(AlignedBuffer::addr)
    }

    const fn forget_content(&mut self) {
        self.basic_hash = HASH_UNASSIGNED;
        self.full_hash = HASH_UNASSIGNED;
        self.weight = LineWeight::Stale(0);
    }

    fn label_str(&self) -> &'static str {
        self.label.unwrap_or("-")
    }
}

/// Parameters of one [`PixelpipeCache::get`] call.
#[derive(Debug, Clone, Copy)]
pub struct CacheRequest {
    /// Basic hash of the node output.
    pub basic_hash: u64,
    /// Full hash of the node output; the lookup key.
    pub full_hash: u64,
    /// Required buffer size in bytes.
    pub byte_size: usize,
    /// Shape stored with the buffer on a miss.
    pub shape: BufferShape,
    /// Pin the line against ordinary eviction.
    pub important: bool,
    /// Name of the requesting node, for diagnostics.
    pub label: &'static str,
}

/// Outcome of [`PixelpipeCache::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheGet {
    /// The line holding the buffer.
    pub line: LineId,
    /// The line already held the requested content.
    pub hit: bool,
    /// The line's buffer was (re)allocated by this call.
    pub reallocated: bool,
}

impl CacheGet {
    /// The caller must compute the buffer's content.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        !self.hit
    }
}

/// Fixed-capacity, content-addressed store of pixel buffers.
#[derive(Debug)]
pub struct PixelpipeCache {
    lines: Vec<CacheLine>,
    bytes_used: usize,
    memory_limit: usize,
    queries: u64,
    misses: u64,
    mask_display: MaskDisplay,
}

impl PixelpipeCache {
    /// Build a cache.
    ///
    /// With a nonzero `line_size` every line is allocated up front.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidConfig`] for fewer than two lines.
    /// Returns [`CacheError::Allocation`] if a preallocation fails; all
    /// lines allocated so far are released. Callers should continue
    /// with [`CacheConfig::lazy`] rather than give up on the pipe.
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        let mut cache = Self {
            lines: (0..config.entries).map(|_| CacheLine::empty()).collect(),
            bytes_used: 0,
            memory_limit: config.memory_limit,
            queries: 0,
            misses: 0,
            mask_display: MaskDisplay::NONE,
        };
        if config.line_size == 0 {
            return Ok(cache);
        }

        for line in &mut cache.lines {
            let buffer = AlignedBuffer::try_new(config.line_size)?;
            line.size = buffer.len();
            line.buffer = Some(buffer);
            cache.bytes_used += config.line_size;
        }
        Ok(cache)
    }

    /// Number of lines.
    #[must_use]
    pub const fn entries(&self) -> usize {
        self.lines.len()
    }

    /// Bytes allocated across all lines.
    #[must_use]
    pub const fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Configured memory limit, 0 for none.
    #[must_use]
    pub const fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    /// Change the memory limit enforced by the next reclamation pass.
    pub const fn set_memory_limit(&mut self, limit: usize) {
        self.memory_limit = limit;
    }

    /// Lookups counted since construction or the last flush.
    #[must_use]
    pub const fn queries(&self) -> u64 {
        self.queries
    }

    /// Misses counted since construction or the last flush.
    #[must_use]
    pub const fn misses(&self) -> u64 {
        self.misses
    }

    /// Mask display mode of the owning pipe.
    #[must_use]
    pub const fn mask_display(&self) -> MaskDisplay {
        self.mask_display
    }

    /// Set the mask display mode of the owning pipe. Buffers written
    /// while the mode avoids caching are neither pinned nor reweighted.
    pub const fn set_mask_display(&mut self, mask_display: MaskDisplay) {
        self.mask_display = mask_display;
    }

    /// Read-only view of a line.
    ///
    /// # Panics
    ///
    /// Panics if `line` was not handed out by this cache.
    #[must_use]
    pub fn line(&self, line: LineId) -> &CacheLine {
        &self.lines[line.0]
    }

    /// All lines in index order.
    pub fn lines(&self) -> impl ExactSizeIterator<Item = (LineId, &CacheLine)> {
        self.lines.iter().enumerate().map(|(k, l)| (LineId(k), l))
    }

    /// Shape stored with a line.
    ///
    /// # Panics
    ///
    /// Panics if `line` was not handed out by this cache.
    #[must_use]
    pub fn shape(&self, line: LineId) -> &BufferShape {
        &self.lines[line.0].shape
    }

    /// The buffer of a line, exactly as long as last requested.
    ///
    /// `None` if the line has no allocation or `line` is out of range.
    #[must_use]
    pub fn buffer(&self, line: LineId) -> Option<&[u8]> {
        let l = self.lines.get(line.0)?;
        l.buffer.as_ref().map(|b| &b.as_slice()[..l.len])
    }

    /// The buffer of a line, mutably.
    #[must_use]
    pub fn buffer_mut(&mut self, line: LineId) -> Option<&mut [u8]> {
        let l = self.lines.get_mut(line.0)?;
        let len = l.len;
        l.buffer.as_mut().map(|b| &mut b.as_mut_slice()[..len])
    }

    /// Borrow an upstream line for reading and a downstream line for
    /// writing at the same time.
    ///
    /// Returns `None` if both ids name the same line, either id is out of
    /// range, or either line has no buffer.
    #[must_use]
    pub fn buffers_mut(&mut self, input: LineId, output: LineId) -> Option<(&[u8], &mut [u8])> {
        let [i, o] = self.lines.get_disjoint_mut([input.0, output.0]).ok()?;
        let (i_len, o_len) = (i.len, o.len);
        let src = i.buffer.as_ref()?;
        let dst = o.buffer.as_mut()?;
        Some((&src.as_slice()[..i_len], &mut dst.as_mut_slice()[..o_len]))
    }

    /// Whether some line holds `full_hash` with exactly `byte_size`
    /// allocated bytes.
    #[must_use]
    pub fn available(&self, full_hash: u64, byte_size: usize) -> bool {
        self.lines
            .iter()
            .any(|l| l.full_hash == full_hash && l.size == byte_size)
    }

    /// Get a buffer for a node's output.
    ///
    /// On a hit the existing line is returned and pinned as important.
    /// On a miss a line is chosen for reuse, its buffer resized as
    /// needed, and the request's hashes and shape recorded; the caller
    /// then writes the pixels. If the allocation fails the returned line
    /// has no buffer.
    pub fn get(&mut self, request: &CacheRequest) -> CacheGet {
        self.queries += 1;
        for line in &mut self.lines {
            line.weight = line.weight.aged();
        }

        if self.lines.len() > 2
            && let Some(line) = self.get_by_hash(request)
        {
            return CacheGet {
                line,
                hit: true,
                reallocated: false,
            };
        }

        let entries = self.lines.len();
        let k = self.select_line();
        let line = &mut self.lines[k];

        let needs_alloc = if entries == 2 {
            line.size < request.byte_size
        } else {
            line.size != request.byte_size
        };
        if needs_alloc {
            self.bytes_used -= line.size;
            line.buffer = None;
            line.size = 0;
            match AlignedBuffer::try_new(request.byte_size) {
                Ok(buffer) => {
                    line.size = buffer.len();
                    line.buffer = Some(buffer);
                    self.bytes_used += request.byte_size;
                }
                Err(e) => warn!(line = k, label = request.label, "{e}"),
            }
        }
        line.len = request.byte_size.min(line.size);
        line.shape = request.shape;

        trace!(
            line = k,
            age = line.weight.value(),
            label = request.label,
            new = needs_alloc,
            important = request.important,
            previous = line.label_str(),
            "cache miss, hash {:#018x}, basic {:#018x}",
            request.full_hash,
            request.basic_hash,
        );

        line.basic_hash = request.basic_hash;
        line.full_hash = request.full_hash;
        line.weight = if self.mask_display.avoids_caching() {
            LineWeight::Stale(0)
        } else if request.important {
            LineWeight::important(entries)
        } else {
            LineWeight::Fresh(0)
        };
        line.label = Some(request.label);
        self.misses += 1;

        CacheGet {
            line: LineId(k),
            hit: false,
            reallocated: needs_alloc,
        }
    }

    fn get_by_hash(&mut self, request: &CacheRequest) -> Option<LineId> {
        let entries = self.lines.len();
        for (k, line) in self.lines.iter_mut().enumerate() {
            if line.full_hash != request.full_hash {
                continue;
            }
            if line.size != request.byte_size {
                // Same hash, different size: a hash overlap or a hash
                // that misses some state. The buffer may still be read
                // elsewhere in this pass, so leave it alone and let the
                // next reclamation free it.
                warn!(
                    line = k,
                    age = line.weight.value(),
                    label = request.label,
                    "hit error: size {}MB, requested {}MB",
                    to_mb(line.size),
                    to_mb(request.byte_size),
                );
                line.basic_hash = HASH_UNASSIGNED;
                line.full_hash = HASH_UNASSIGNED;
                line.weight = LineWeight::HitError;
                continue;
            }

            debug!(
                line = k,
                age = line.weight.value(),
                label = request.label,
                important = line.weight.is_important(),
                "cache hit, hash {:#018x}, basic {:#018x}",
                line.full_hash,
                line.basic_hash,
            );
            line.len = request.byte_size;
            line.weight = LineWeight::important(entries);
            return Some(LineId(k));
        }
        None
    }

    fn select_line(&self) -> usize {
        if self.lines.len() == 2 {
            return usize::from(self.queries & 1 == 1);
        }
        self.oldest_free()
            .or_else(|| self.oldest_used(2))
            .unwrap_or_else(|| self.oldest())
    }

    /// Coldest line without a buffer, skipping lines used by the last
    /// query.
    fn oldest_free(&self) -> Option<usize> {
        coldest(
            self.lines
                .iter()
                .enumerate()
                .filter(|(_, l)| l.buffer.is_none()),
            1,
        )
    }

    /// Coldest line with a buffer and weight above `age`.
    fn oldest_used(&self, age: i64) -> Option<usize> {
        coldest(
            self.lines
                .iter()
                .enumerate()
                .filter(|(_, l)| l.buffer.is_some()),
            age.max(0),
        )
    }

    /// Coldest line overall, never one used by the last query; falls
    /// back to line 0 when every line is that recent or important.
    fn oldest(&self) -> usize {
        coldest(self.lines.iter().enumerate(), 1).unwrap_or(0)
    }

    /// Least important of the important lines that hold a buffer.
    fn oldest_important(&self) -> Option<usize> {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.buffer.is_some() && l.weight.value() < 0)
            .fold(None, |best: Option<(usize, i64)>, (k, l)| {
                let w = l.weight.value();
                match best {
                    Some((_, bw)) if bw >= w => best,
                    _ => Some((k, w)),
                }
            })
            .map(|(k, _)| k)
    }

    /// Mark a previously returned buffer as important again, e.g. when
    /// an overlay needs it on screen.
    ///
    /// No-op while the mask display avoids caching.
    pub fn reweight(&mut self, addr: BufferAddr, byte_size: usize) {
        if self.mask_display.avoids_caching() {
            return;
        }
        let entries = self.lines.len();
        for (k, line) in self.lines.iter_mut().enumerate() {
            if line.addr() == Some(addr) && line.size == byte_size {
                line.weight = LineWeight::important(entries);
                trace!(
                    line = k,
                    label = line.label_str(),
                    "reweight, hash {:#018x}, basic {:#018x}",
                    line.full_hash,
                    line.basic_hash,
                );
            }
        }
    }

    /// Forget the content of the line(s) owning `addr`, keeping the
    /// allocation for reuse.
    pub fn invalidate(&mut self, addr: BufferAddr) {
        for (k, line) in self.lines.iter_mut().enumerate() {
            if line.addr() == Some(addr) {
                trace!(line = k, label = line.label_str(), "invalidate");
                line.forget_content();
            }
        }
    }

    /// Forget the content of every line, keeping allocations.
    ///
    /// The counters restart from the parity of the query count so
    /// two-line caches keep alternating from where they were.
    pub fn flush(&mut self) {
        self.queries &= 1;
        self.misses = self.queries;
        for line in &mut self.lines {
            line.forget_content();
        }
        debug!(entries = self.lines.len(), "cache flushed");
    }

    /// Forget the content of every line whose basic hash differs from
    /// `basic_hash`. Lines holding the same content at another region of
    /// interest survive.
    pub fn flush_all_but(&mut self, basic_hash: u64) {
        for line in &mut self.lines {
            if line.basic_hash != basic_hash {
                line.forget_content();
            }
        }
        debug!(
            entries = self.lines.len(),
            "cache flushed except basic {basic_hash:#018x}"
        );
    }

    fn free_line(&mut self, k: usize) -> usize {
        let line = &mut self.lines[k];
        let removed = line.size;
        trace!(
            line = k,
            age = line.weight.value(),
            label = line.label_str(),
            "free cacheline, size {}MB",
            to_mb(removed),
        );
        line.buffer = None;
        line.size = 0;
        line.len = 0;
        line.label = None;
        line.forget_content();
        self.bytes_used -= removed;
        removed
    }

    /// Release memory.
    ///
    /// Always frees lines quarantined by a hit error. Then, while over
    /// the memory limit, frees the coldest lines older than
    /// `max(2, entries / 8)` queries, and after those the least
    /// important of the important lines. The limit is best effort: the
    /// pass stops when no candidate is left.
    ///
    /// Two-line caches are never reclaimed.
    pub fn reclaim_memory(&mut self) -> ReclaimStats {
        let entries = self.lines.len();
        let mut stats = ReclaimStats::default();
        if entries == 2 {
            return stats;
        }

        for k in 0..entries {
            if self.lines[k].weight.is_hit_error(entries) {
                stats.freed_bytes += self.free_line(k);
                stats.hit_error_lines += 1;
            }
        }

        if self.memory_limit != 0 {
            let old_limit = i64::try_from((entries / 8).max(2)).unwrap_or(i64::MAX);
            while self.bytes_used > self.memory_limit {
                let Some(k) = self.oldest_used(old_limit) else {
                    break;
                };
                stats.freed_bytes += self.free_line(k);
                stats.cold_lines += 1;
            }
            while self.bytes_used > self.memory_limit {
                let Some(k) = self.oldest_important() else {
                    break;
                };
                stats.freed_bytes += self.free_line(k);
                stats.important_lines += 1;
            }
        }

        debug!(
            entries,
            important = self.important_lines(),
            used = self.used_lines(),
            "reclaimed {}MB (bad={} low={} high={}), now using {}MB, limit={}MB",
            to_mb(stats.freed_bytes),
            stats.hit_error_lines,
            stats.cold_lines,
            stats.important_lines,
            to_mb(self.bytes_used),
            to_mb(self.memory_limit),
        );
        stats
    }

    fn important_lines(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| l.weight.is_important())
            .count()
    }

    fn used_lines(&self) -> usize {
        self.lines.iter().filter(|l| l.buffer.is_some()).count()
    }

    /// Usage and hit statistics. Also logged at debug level.
    #[must_use]
    pub fn report(&self) -> CacheReport {
        let report = CacheReport {
            entries: self.lines.len(),
            queries: self.queries,
            misses: self.misses,
            hit_rate: CacheReport::hit_rate(self.queries, self.misses),
            bytes_used: self.bytes_used,
            memory_limit: self.memory_limit,
            important_lines: self.important_lines(),
            used_lines: self.used_lines(),
        };
        debug!("cache report: {report}");
        report
    }
}

/// The line with the largest weight strictly above `floor`; the first
/// such line wins ties.
fn coldest<'a>(
    lines: impl Iterator<Item = (usize, &'a CacheLine)>,
    floor: i64,
) -> Option<usize> {
    let mut best = None;
    let mut weight = floor;
    for (k, line) in lines {
        let w = line.weight.value();
        if w > weight {
            weight = w;
            best = Some(k);
        }
    }
    best
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn lazy(entries: usize, memory_limit: usize) -> PixelpipeCache {
        PixelpipeCache::new(&CacheConfig {
            entries,
            line_size: 0,
            memory_limit,
        })
        .unwrap()
    }

    fn request(full_hash: u64, basic_hash: u64, byte_size: usize, important: bool) -> CacheRequest {
        CacheRequest {
            basic_hash,
            full_hash,
            byte_size,
            shape: BufferShape::rgba_f32(1, 1),
            important,
            label: "test",
        }
    }

    fn weights(cache: &PixelpipeCache) -> Vec<i64> {
        cache.lines().map(|(_, l)| l.weight().value()).collect()
    }

    #[test]
    fn rejects_single_line() {
        let result = PixelpipeCache::new(&CacheConfig {
            entries: 1,
            line_size: 0,
            memory_limit: 0,
        });
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn preallocates_fixed_lines() {
        let cache = PixelpipeCache::new(&CacheConfig::export(4096)).unwrap();
        assert_eq!(cache.bytes_used(), 8192);
        assert!(cache.lines().all(|(_, l)| l.size() == 4096 && l.is_allocated()));
    }

    #[test]
    fn failed_preallocation_is_an_error() {
        let result = PixelpipeCache::new(&CacheConfig::export(usize::MAX - 1));
        assert!(matches!(result, Err(CacheError::Allocation { .. })));
    }

    #[test]
    fn failed_line_allocation_degrades() {
        let mut cache = lazy(4, 0);
        cache.get(&request(1, 1, 64, false));
        assert_eq!(cache.bytes_used(), 64);

        let bad = cache.get(&request(2, 2, usize::MAX - 1, false));
        assert!(bad.is_new());
        let line = cache.line(bad.line);
        assert!(!line.is_allocated());
        assert_eq!(line.size(), 0);
        assert_eq!(line.full_hash(), 2);
        assert_eq!(cache.buffer(bad.line), None);
        assert_eq!(cache.bytes_used(), 64);
        assert_eq!(cache.misses(), 2);

        // Asking for the same content again finds a zero-size line with
        // the right hash: it is quarantined and a fresh line serves the
        // request.
        let retry = cache.get(&request(2, 2, 64, false));
        assert!(retry.is_new());
        assert_ne!(retry.line, bad.line);
        assert_eq!(cache.line(bad.line).weight(), LineWeight::HitError);
        assert!(cache.available(2, 64));

        let stats = cache.reclaim_memory();
        assert_eq!(stats.hit_error_lines, 1);
        assert_eq!(stats.freed_bytes, 0);
        assert_eq!(cache.line(bad.line).full_hash(), HASH_UNASSIGNED);
        assert_eq!(cache.bytes_used(), 128);
    }

    #[test]
    fn out_of_range_line_has_no_buffer() {
        let mut big = lazy(8, 0);
        let first = big.get(&request(1, 1, 64, false)).line;
        let far = LineId(7);
        assert_eq!(big.buffer(far), None, "never allocated");

        let mut small = lazy(2, 0);
        small.get(&request(1, 1, 64, false));
        assert_eq!(small.buffer(far), None);
        assert_eq!(small.buffer_mut(far), None);
        assert!(small.buffers_mut(first, far).is_none());
    }

    #[test]
    fn lazy_lines_start_empty() {
        let cache = lazy(4, 0);
        assert_eq!(cache.bytes_used(), 0);
        assert!(cache.lines().all(|(_, l)| !l.is_allocated()));
        assert!(
            cache
                .lines()
                .all(|(_, l)| l.full_hash() == HASH_UNASSIGNED)
        );
    }

    #[test]
    fn miss_then_hit() {
        let mut cache = lazy(4, 0);
        let first = cache.get(&request(100, 10, 1024, false));
        assert!(first.is_new());
        assert!(first.reallocated);
        assert_eq!(cache.buffer(first.line).unwrap().len(), 1024);
        let addr = cache.line(first.line).addr();

        let second = cache.get(&request(100, 10, 1024, false));
        assert!(second.hit);
        assert!(!second.reallocated);
        assert_eq!(second.line, first.line);
        assert_eq!(cache.line(second.line).addr(), addr);
        assert_eq!(cache.line(second.line).weight(), LineWeight::Important(4));
        assert_eq!(cache.queries(), 2);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn hit_pins_regardless_of_age() {
        let mut cache = lazy(5, 0);
        let line = cache.get(&request(1, 1, 64, false)).line;
        for h in 2..5 {
            cache.get(&request(h, h, 64, false));
        }
        assert_eq!(cache.line(line).weight(), LineWeight::Fresh(3));
        cache.get(&request(1, 1, 64, false));
        assert_eq!(cache.line(line).weight().value(), -5);
    }

    #[test]
    fn buffers_are_aligned() {
        let mut cache = lazy(3, 0);
        let got = cache.get(&request(1, 1, 100, false));
        let ptr = cache.buffer(got.line).unwrap().as_ptr();
        assert_eq!(ptr.addr() % crate::buffer::ALIGNMENT, 0);
    }

    #[test]
    fn shape_is_copied_into_line() {
        let mut cache = lazy(3, 0);
        let mut req = request(1, 1, 256, false);
        req.shape = BufferShape::rgba_f32(4, 4);
        let got = cache.get(&req);
        assert_eq!(*cache.shape(got.line), BufferShape::rgba_f32(4, 4));

        // A hit returns the stored shape, not the caller's.
        req.shape = BufferShape::rgba_f32(16, 1);
        let hit = cache.get(&req);
        assert!(hit.hit);
        assert_eq!(*cache.shape(hit.line), BufferShape::rgba_f32(4, 4));
    }

    #[test]
    fn available_requires_hash_and_size() {
        let mut cache = lazy(3, 0);
        cache.get(&request(7, 1, 128, false));
        assert!(cache.available(7, 128));
        assert!(!cache.available(7, 64));
        assert!(!cache.available(8, 128));
    }

    #[test]
    fn two_line_cache_alternates() {
        let mut cache = lazy(2, 0);
        for h in 0..6_u64 {
            let got = cache.get(&request(1000 + h, h, 64, false));
            assert!(got.is_new());
            assert_eq!(
                u64::try_from(got.line.index()).unwrap(),
                cache.queries() & 1
            );
        }
    }

    #[test]
    fn two_line_cache_never_hits() {
        let mut cache = lazy(2, 0);
        cache.get(&request(5, 5, 64, false));
        let again = cache.get(&request(5, 5, 64, false));
        assert!(again.is_new());
        assert_eq!(cache.misses(), 2);
    }

    #[test]
    fn two_line_cache_grows_but_never_shrinks() {
        let mut cache = PixelpipeCache::new(&CacheConfig::export(1024)).unwrap();
        // queries=1 -> line 1
        let got = cache.get(&request(1, 1, 512, false));
        assert_eq!(got.line.index(), 1);
        assert!(!got.reallocated);
        assert_eq!(cache.line(got.line).size(), 1024);
        assert_eq!(cache.buffer(got.line).unwrap().len(), 512);

        // queries=2 -> line 0
        let got = cache.get(&request(2, 2, 4096, false));
        assert_eq!(got.line.index(), 0);
        assert!(got.reallocated);
        assert_eq!(cache.line(got.line).size(), 4096);
        assert_eq!(cache.bytes_used(), 4096 + 1024);

        // queries=3 -> line 1, smaller request reuses the buffer.
        let addr = cache.line(LineId(1)).addr();
        let got = cache.get(&request(3, 3, 16, false));
        assert!(!got.reallocated);
        assert_eq!(cache.line(got.line).addr(), addr);
        assert_eq!(cache.line(got.line).size(), 1024);
    }

    #[test]
    fn many_line_cache_resizes_exactly() {
        let mut cache = lazy(3, 0);
        let got = cache.get(&request(1, 1, 1024, false));
        assert_eq!(cache.line(got.line).size(), 1024);
        cache.flush();
        // All lines are now stale; line 0 is the coldest free-or-used
        // candidate and gets shrunk to the new size.
        let mut line = None;
        for h in 10..13 {
            let got = cache.get(&request(h, h, 256, false));
            if got.line == LineId(0) {
                line = Some(got);
            }
        }
        let got = line.unwrap();
        assert!(got.reallocated);
        assert_eq!(cache.line(got.line).size(), 256);
        assert_eq!(cache.bytes_used(), 3 * 256);
    }

    #[test]
    fn prefers_free_lines() {
        let mut cache = lazy(4, 0);
        let lines: Vec<_> = (0..4).map(|h| cache.get(&request(h, h, 64, false)).line).collect();
        let mut indices: Vec<_> = lines.iter().map(|l| l.index()).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn collision_with_other_size_quarantines_line() {
        let mut cache = lazy(4, 0);
        let first = cache.get(&request(77, 7, 1024, false));
        let other = cache.get(&request(77, 7, 2048, false));
        assert!(other.is_new());
        assert_ne!(other.line, first.line);

        let quarantined = cache.line(first.line);
        assert_eq!(quarantined.weight(), LineWeight::HitError);
        assert!(quarantined.weight().is_hit_error(4));
        assert_eq!(quarantined.full_hash(), HASH_UNASSIGNED);
        // The buffer itself is untouched until reclamation.
        assert!(quarantined.is_allocated());
        assert_eq!(quarantined.size(), 1024);

        let stats = cache.reclaim_memory();
        assert_eq!(stats.hit_error_lines, 1);
        assert_eq!(stats.lines(), 1);
        assert_eq!(stats.freed_bytes, 1024);
        assert!(!cache.line(first.line).is_allocated());
        assert!(cache.line(other.line).is_allocated());
        assert_eq!(cache.bytes_used(), 2048);
    }

    #[test]
    fn end_to_end_scenario() {
        let mut cache = lazy(4, 0);
        let l0 = cache.get(&request(100, 10, 1024, false));
        assert!(l0.is_new() && l0.reallocated);
        assert_eq!(cache.line(l0.line).weight(), LineWeight::Fresh(0));
        let addr = cache.line(l0.line).addr();

        let hit = cache.get(&request(100, 10, 1024, false));
        assert!(hit.hit);
        assert_eq!(cache.line(hit.line).addr(), addr);
        assert_eq!(cache.line(l0.line).weight().value(), -4);

        let l1 = cache.get(&request(200, 20, 2048, true)).line;
        let l2 = cache.get(&request(300, 30, 2048, false)).line;
        let l3 = cache.get(&request(400, 40, 2048, false)).line;
        let mut used = vec![l0.line.index(), l1.index(), l2.index(), l3.index()];
        used.sort_unstable();
        assert_eq!(used, vec![0, 1, 2, 3]);
        assert_eq!(weights(&cache), vec![-1, -2, 1, 0]);

        // Every line has a buffer; the coldest unpinned line goes.
        let evict = cache.get(&request(500, 50, 2048, false));
        assert_eq!(evict.line, l2);
        assert_eq!(cache.line(l0.line).full_hash(), 100);
        assert_eq!(cache.misses(), 5);
        assert_eq!(cache.queries(), 6);
        assert!(!cache.available(300, 2048));
        assert!(cache.available(500, 2048));
    }

    #[test]
    fn last_resort_skips_just_used_line() {
        let mut cache = lazy(3, 0);
        for h in 0..3 {
            cache.get(&request(h, h, 64, true));
        }
        // Weights before the next query: [-1, -2, -3]. After aging all
        // are <= 0, nothing qualifies, line 0 is the fallback.
        let got = cache.get(&request(9, 9, 64, false));
        assert_eq!(got.line.index(), 0);
    }

    #[test]
    fn important_request_pins() {
        let mut cache = lazy(6, 0);
        let got = cache.get(&request(1, 1, 64, true));
        assert_eq!(cache.line(got.line).weight(), LineWeight::Important(6));
    }

    #[test]
    fn mask_display_marks_lines_stale() {
        let mut cache = lazy(4, 0);
        cache.set_mask_display(MaskDisplay::PASSTHRU);
        assert_eq!(cache.mask_display(), MaskDisplay::PASSTHRU);
        let got = cache.get(&request(1, 1, 64, true));
        assert_eq!(cache.line(got.line).weight(), LineWeight::Stale(0));

        // Reweight is ignored in this mode.
        let addr = cache.line(got.line).addr().unwrap();
        cache.reweight(addr, 64);
        assert_eq!(cache.line(got.line).weight(), LineWeight::Stale(0));
    }

    #[test]
    fn reweight_matches_pointer_and_size() {
        let mut cache = lazy(4, 0);
        let got = cache.get(&request(1, 1, 64, false));
        let addr = cache.line(got.line).addr().unwrap();
        cache.reweight(addr, 128);
        assert_eq!(cache.line(got.line).weight(), LineWeight::Fresh(0));
        cache.reweight(addr, 64);
        assert_eq!(cache.line(got.line).weight(), LineWeight::Important(4));
        assert_eq!(cache.line(got.line).full_hash(), 1);
    }

    #[test]
    fn invalidate_keeps_allocation() {
        let mut cache = lazy(4, 0);
        let got = cache.get(&request(1, 1, 64, true));
        let addr = cache.line(got.line).addr().unwrap();
        cache.invalidate(addr);
        let line = cache.line(got.line);
        assert_eq!(line.full_hash(), HASH_UNASSIGNED);
        assert_eq!(line.basic_hash(), HASH_UNASSIGNED);
        assert_eq!(line.weight(), LineWeight::Stale(0));
        assert!(line.is_allocated());
        assert!(!cache.available(1, 64));
    }

    #[test]
    fn flush_keeps_allocations_and_parity() {
        let mut cache = lazy(4, 0);
        for h in 0..3 {
            cache.get(&request(h, h, 64, false));
        }
        cache.flush();
        assert_eq!(cache.queries(), 1);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.bytes_used(), 3 * 64);
        assert!(
            cache
                .lines()
                .all(|(_, l)| l.full_hash() == HASH_UNASSIGNED
                    && l.weight() == LineWeight::Stale(0))
        );
    }

    #[test]
    fn flush_all_but_keeps_matching_basic_hash() {
        let mut cache = lazy(4, 0);
        let requests = [
            request(100, 10, 64, false),
            request(200, 20, 64, false),
            request(300, 30, 64, false),
            request(400, 40, 64, false),
        ];
        for r in &requests {
            cache.get(r);
        }
        cache.flush_all_but(20);
        assert!(cache.available(200, 64));
        for r in [&requests[0], &requests[2], &requests[3]] {
            assert!(!cache.available(r.full_hash, 64));
        }
        let kept = cache.lines().filter(|(_, l)| l.basic_hash() == 20).count();
        assert_eq!(kept, 1);
    }

    #[test]
    fn reclaim_enforces_budget() {
        let mut cache = lazy(8, 3000);
        for h in 0..8 {
            cache.get(&request(h, h, 1000, false));
        }
        // Age everything past the cold floor without allocating.
        for _ in 0..3 {
            cache.get(&request(0, 0, 1000, false));
        }
        assert!(cache.bytes_used() > 3000);
        let before = cache.bytes_used();
        let stats = cache.reclaim_memory();
        assert!(cache.bytes_used() < before);
        assert!(cache.bytes_used() <= 3000);
        assert_eq!(stats.freed_bytes, before - cache.bytes_used());
        // The line just hit is pinned and survives.
        assert!(cache.available(0, 1000));
    }

    #[test]
    fn reclaim_frees_cold_before_important() {
        let mut cache = lazy(8, 1000);
        let pinned = cache.get(&request(1, 1, 1000, true)).line;
        for h in 2..5 {
            cache.get(&request(h, h, 1000, false));
        }
        for _ in 0..3 {
            assert!(cache.get(&request(1, 1, 1000, false)).hit);
        }
        let stats = cache.reclaim_memory();
        assert_eq!(stats.cold_lines, 3);
        assert_eq!(stats.important_lines, 0);
        assert_eq!(cache.bytes_used(), 1000);
        assert!(cache.line(pinned).is_allocated());
    }

    #[test]
    fn reclaim_falls_back_to_important_lines() {
        let mut cache = lazy(8, 1500);
        let a = cache.get(&request(1, 1, 1000, true)).line;
        let b = cache.get(&request(2, 2, 1000, true)).line;
        // a: Important(7), b: Important(8); nothing is cold.
        let stats = cache.reclaim_memory();
        assert_eq!(stats.cold_lines, 0);
        assert_eq!(stats.important_lines, 1);
        assert!(!cache.line(a).is_allocated());
        assert!(cache.line(b).is_allocated());
        assert_eq!(cache.bytes_used(), 1000);
    }

    #[test]
    fn reclaim_is_monotonic_without_gets() {
        let mut cache = lazy(6, 100);
        for h in 0..6 {
            cache.get(&request(h, h, 1000, h % 2 == 0));
        }
        let mut last = cache.bytes_used();
        loop {
            cache.reclaim_memory();
            let now = cache.bytes_used();
            if now == last {
                break;
            }
            assert!(now < last);
            last = now;
        }
        // What is left is either within budget or too recent to evict.
        assert!(
            cache.bytes_used() <= 100
                || cache
                    .lines()
                    .filter(|(_, l)| l.is_allocated())
                    .all(|(_, l)| l.weight().value() <= 2)
        );
    }

    #[test]
    fn unlimited_cache_only_frees_hit_errors() {
        let mut cache = lazy(4, 0);
        for h in 0..4 {
            cache.get(&request(h, h, 1000, false));
        }
        let stats = cache.reclaim_memory();
        assert_eq!(stats, ReclaimStats::default());
        assert_eq!(cache.bytes_used(), 4000);
    }

    #[test]
    fn two_line_cache_is_never_reclaimed() {
        let mut cache = PixelpipeCache::new(&CacheConfig {
            entries: 2,
            line_size: 1000,
            memory_limit: 1,
        })
        .unwrap();
        assert_eq!(cache.reclaim_memory(), ReclaimStats::default());
        assert_eq!(cache.bytes_used(), 2000);
    }

    #[test]
    fn disjoint_borrow_of_two_lines() {
        let mut cache = lazy(3, 0);
        let a = cache.get(&request(1, 1, 4, false)).line;
        cache.buffer_mut(a).unwrap().copy_from_slice(&[1, 2, 3, 4]);
        let b = cache.get(&request(2, 2, 4, false)).line;
        let (src, dst) = cache.buffers_mut(a, b).unwrap();
        dst.copy_from_slice(src);
        assert_eq!(cache.buffer(b).unwrap(), &[1, 2, 3, 4]);
        assert!(cache.buffers_mut(a, a).is_none());
    }

    #[test]
    fn report_counts() {
        let mut cache = lazy(4, 1 << 20);
        cache.get(&request(1, 1, 64, true));
        cache.get(&request(1, 1, 64, false));
        cache.get(&request(2, 2, 64, false));
        let report = cache.report();
        assert_eq!(report.entries, 4);
        assert_eq!(report.queries, 3);
        assert_eq!(report.misses, 2);
        assert!((report.hit_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.bytes_used, 128);
        assert_eq!(report.used_lines, 2);
        assert_eq!(report.important_lines, 1);
    }
}
