//! pixpipe-cache: content-addressed buffer cache for pixel pipelines (sans-IO).
//!
//! An image-processing pipe evaluates a sequence of nodes over an image.
//! Re-running every node whenever one parameter changes is too slow for
//! interactive editing, so each node's output is stored in a cacheline
//! keyed by a hash of everything that produced it. When a slider moves,
//! only the nodes downstream of the change miss.
//!
//! The crate has two halves:
//!
//! - [`hash`]: derives the *basic* hash (content) and *full* hash
//!   (content plus region of interest) of a node's output from a
//!   [`HashContext`].
//! - [`cache`]: a fixed array of cachelines with lookup, replacement,
//!   invalidation, memory reclamation, and reporting.
//!
//! ```rust
//! # use pixpipe_cache::{BufferShape, CacheConfig, CacheError, CacheRequest, PixelpipeCache};
//! # fn run() -> Result<(), CacheError> {
//! let mut cache = PixelpipeCache::new(&CacheConfig::preview())?;
//! let shape = BufferShape::rgba_f32(32, 32);
//! let request = CacheRequest {
//!     basic_hash: 10,
//!     full_hash: 100,
//!     byte_size: shape.byte_size().unwrap_or(0),
//!     shape,
//!     important: false,
//!     label: "exposure",
//! };
//! let got = cache.get(&request);
//! if got.is_new() {
//!     if let Some(pixels) = cache.buffer_mut(got.line) {
//!         pixels.fill(0);
//!     }
//! }
//! assert!(cache.get(&request).hit);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod hash;
pub mod mode;
pub mod report;
pub mod shape;
pub mod weight;

pub use buffer::{ALIGNMENT, AlignedBuffer, BufferAddr};
pub use cache::{CacheGet, CacheLine, CacheRequest, LineId, PixelpipeCache};
pub use config::CacheConfig;
pub use error::CacheError;
pub use hash::{
    AllVisible, FocusFilter, HASH_UNASSIGNED, HashContext, HashNode, ModuleId, OperationTags,
    PickerSample, Roi, Visibility,
};
pub use mode::{MaskDisplay, PipeType};
pub use report::{CacheReport, ReclaimStats};
pub use shape::{BufferShape, PixelType};
pub use weight::LineWeight;
