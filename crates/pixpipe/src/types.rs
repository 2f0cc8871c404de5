//! Shared types for the pixpipe driver.

use serde::Serialize;

use pixpipe_cache::{CacheError, ReclaimStats, Roi};

/// Re-export `Rgba32FImage` so downstream crates can hold pipe input
/// and output without depending on `image` directly.
pub use image::Rgba32FImage;

/// Errors that can occur while building or processing a pipe.
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    /// Failed to decode the source image.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// The source image bytes were empty.
    #[error("input image data is empty")]
    EmptyInput,

    /// The cache could not be built.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The region of interest is empty or too large to buffer.
    #[error("invalid region of interest {0:?}")]
    InvalidRoi(Roi),

    /// A cacheline came back without a buffer (allocation failed).
    #[error("no buffer available for node `{node}`")]
    NoBuffer {
        /// Label of the node whose output could not be stored.
        node: &'static str,
    },

    /// A node had nothing to read from.
    #[error("node `{node}` has no input buffer")]
    MissingInput {
        /// Label of the node.
        node: &'static str,
    },

    /// A cached buffer could not be viewed as `f32` pixels.
    #[error("buffer layout mismatch for node `{node}`: {reason}")]
    BufferLayout {
        /// Label of the node.
        node: &'static str,
        /// What was wrong with the buffer.
        reason: String,
    },

    /// A node index is out of range.
    #[error("no node at index {0}")]
    NoSuchNode(usize),
}

/// Cache traffic of one [`Pipe::process`](crate::Pipe::process) pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassStats {
    /// Stages served from the cache.
    pub hits: usize,
    /// Stages computed into a fresh or reused line.
    pub misses: usize,
    /// Labels of the computed stages, in evaluation order.
    pub computed: Vec<&'static str>,
    /// What the end-of-pass reclamation released.
    pub reclaimed: ReclaimStats,
}

/// Result of processing a pipe at one region of interest.
#[derive(Debug, Clone)]
pub struct PipeOutput {
    /// Final pixels, RGBA `f32`.
    pub image: Rgba32FImage,
    /// Basic hash of the final stage.
    pub basic_hash: u64,
    /// Full hash of the final stage.
    pub full_hash: u64,
    /// Mean RGBA under the color picker, when a picking node ran.
    pub picked: Option<[f32; 4]>,
    /// Cache traffic of the pass.
    pub stats: PassStats,
}
