//! Cache keys: basic and full hashes of a pipeline node's output.
//!
//! The *basic hash* of node `k` covers everything that determines the
//! content of its output: the image, the pipe type, the mask display
//! mode, and the content hash of every node before it (plus the color
//! picker sample for nodes that pick). The *full hash* additionally
//! covers the region of interest, so two lines with the same basic hash
//! hold the same content at different crops or scales.
//!
//! Both are folded with djb2 (`h = h * 33 ^ x`, seed 5381). Structured
//! inputs are fed field by field as little-endian bytes in a fixed
//! order, never as raw memory. The hashes are in-process cache keys and
//! are not stable across versions.

use std::hash::Hasher;

use serde::{Deserialize, Serialize};

use crate::mode::{MaskDisplay, PipeType};

/// Hash value of a cacheline that holds no content.
pub const HASH_UNASSIGNED: u64 = u64::MAX;

/// Bernstein's multiplicative string hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Djb2(u64);

impl Djb2 {
    /// Initial state.
    pub const SEED: u64 = 5381;

    /// A hasher in its initial state.
    #[must_use]
    pub const fn new() -> Self {
        Self(Self::SEED)
    }

    /// Continue folding from an existing hash value.
    #[must_use]
    pub const fn resume(hash: u64) -> Self {
        Self(hash)
    }

    /// Fold a whole 64-bit value in a single step.
    pub const fn mix(&mut self, value: u64) {
        self.0 = self.0.wrapping_mul(33) ^ value;
    }
}

impl Default for Djb2 {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for Djb2 {
    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.mix(u64::from(b));
        }
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

/// Identity of an image operation module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleId(pub u32);

/// Capability bits a module declares about the operation it performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationTags(u32);

impl OperationTags {
    /// No declared capability.
    pub const NONE: Self = Self(0);
    /// Moves pixels (lens correction, rotation, liquify).
    pub const DISTORT: Self = Self(1 << 0);
    /// Draws on top of the image (frames, watermarks).
    pub const DECORATE: Self = Self(1 << 1);
    /// Crops or clips the image.
    pub const CLIPPING: Self = Self(1 << 2);

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Union of two tag sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether the sets share any tag.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

/// What the hash engine needs to know about one pipeline node.
pub trait HashNode {
    /// Module this node instantiates.
    fn module(&self) -> ModuleId;

    /// Whether the node runs at all.
    fn is_enabled(&self) -> bool;

    /// Opaque hash of the node's parameters, supplied by the module
    /// layer.
    fn content_hash(&self) -> u64;

    /// Capabilities of the node's operation.
    fn operation_tags(&self) -> OperationTags;

    /// Whether the node currently samples the color picker.
    fn requests_color_pick(&self) -> bool;
}

/// Decides whether a node is excluded from hashing.
pub trait Visibility<N: ?Sized> {
    /// `true` when `node` must not contribute to the hash.
    fn is_hidden(&self, node: &N) -> bool;
}

impl<N: ?Sized, F: Fn(&N) -> bool> Visibility<N> for F {
    fn is_hidden(&self, node: &N) -> bool {
        self(node)
    }
}

/// Every node contributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllVisible;

impl<N: ?Sized> Visibility<N> for AllVisible {
    fn is_hidden(&self, _node: &N) -> bool {
        false
    }
}

/// The module focused for editing hides other modules whose operation
/// tags intersect its filter, so its live preview is not polluted by
/// them (e.g. a cropping module shows the uncropped image while
/// focused).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FocusFilter {
    /// The focused module.
    pub module: ModuleId,
    /// Tags of other modules to hide while focused.
    pub tags_filter: OperationTags,
}

impl<N: HashNode + ?Sized> Visibility<N> for FocusFilter {
    fn is_hidden(&self, node: &N) -> bool {
        node.module() != self.module && self.tags_filter.intersects(node.operation_tags())
    }
}

/// The active color picker sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PickerSample {
    /// Area sample: `[x0, y0, x1, y1]` in relative image coordinates.
    Box([f32; 4]),
    /// Point sample: `[x, y]` in relative image coordinates.
    Point([f32; 2]),
}

impl PickerSample {
    fn fold_into(&self, hasher: &mut Djb2) {
        let values: &[f32] = match self {
            Self::Box(b) => b,
            Self::Point(p) => p,
        };
        for v in values {
            hasher.write(&v.to_le_bytes());
        }
    }
}

/// Region of interest: the crop and scale a node is evaluated at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    /// Left edge in scaled pixels.
    pub x: i32,
    /// Top edge in scaled pixels.
    pub y: i32,
    /// Width in pixels.
    pub width: i32,
    /// Height in pixels.
    pub height: i32,
    /// Scale relative to the full-resolution input.
    pub scale: f64,
}

impl Roi {
    /// The whole image at `scale`, rounded down to whole pixels.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn full(width: u32, height: u32, scale: f64) -> Self {
        Self {
            x: 0,
            y: 0,
            width: (f64::from(width) * scale) as i32,
            height: (f64::from(height) * scale) as i32,
            scale,
        }
    }

    /// Fold the geometry in the order `x, y, width, height, scale`.
    fn fold_into(&self, hasher: &mut Djb2) {
        hasher.write(&self.x.to_le_bytes());
        hasher.write(&self.y.to_le_bytes());
        hasher.write(&self.width.to_le_bytes());
        hasher.write(&self.height.to_le_bytes());
        hasher.write(&self.scale.to_le_bytes());
    }
}

/// Everything the hash of a node's output depends on.
///
/// Borrowed from the pipeline driver for the duration of one call;
/// the hash engine keeps no state of its own.
#[derive(Debug, Clone, Copy)]
pub struct HashContext<'a, N, V = AllVisible> {
    /// Stable identifier of the source image.
    pub image_id: i32,
    /// Pipe type of the evaluating pipe.
    pub pipe_type: PipeType,
    /// Mask display mode of the evaluating pipe.
    pub mask_display: MaskDisplay,
    /// Nodes in evaluation order.
    pub nodes: &'a [N],
    /// Which nodes are excluded from hashing.
    pub visibility: V,
    /// The picker sample folded in after every picking node.
    pub picker: Option<PickerSample>,
}

impl<'a, N: HashNode> HashContext<'a, N> {
    /// A context where every node is visible and no picker is active.
    #[must_use]
    pub const fn new(
        image_id: i32,
        pipe_type: PipeType,
        mask_display: MaskDisplay,
        nodes: &'a [N],
    ) -> Self {
        Self {
            image_id,
            pipe_type,
            mask_display,
            nodes,
            visibility: AllVisible,
            picker: None,
        }
    }
}

impl<'a, N: HashNode, V: Visibility<N>> HashContext<'a, N, V> {
    /// Replace the visibility predicate.
    #[must_use]
    pub fn with_visibility<W: Visibility<N>>(self, visibility: W) -> HashContext<'a, N, W> {
        HashContext {
            image_id: self.image_id,
            pipe_type: self.pipe_type,
            mask_display: self.mask_display,
            nodes: self.nodes,
            visibility,
            picker: self.picker,
        }
    }

    /// Set the active picker sample.
    #[must_use]
    pub fn with_picker(mut self, picker: Option<PickerSample>) -> Self {
        self.picker = picker;
        self
    }

    /// Hash of the content produced by the first `up_to` nodes.
    ///
    /// Folding follows node order, so the same nodes in a different
    /// order hash differently. `up_to` past the end covers all nodes.
    #[must_use]
    pub fn basic_hash(&self, up_to: usize) -> u64 {
        let mut hasher = Djb2::new();
        hasher.write(&self.image_id.to_le_bytes());
        hasher.write(&self.pipe_type.bits().to_le_bytes());
        hasher.write(&self.mask_display.bits().to_le_bytes());

        for node in self.nodes.iter().take(up_to) {
            if self.visibility.is_hidden(node) {
                continue;
            }
            hasher.mix(node.content_hash());
            if node.requests_color_pick()
                && let Some(sample) = &self.picker
            {
                sample.fold_into(&mut hasher);
            }
        }
        hasher.finish()
    }

    /// Basic hash of the input to the node of module `target`: the
    /// output of the last enabled, visible node before it.
    ///
    /// Returns [`HASH_UNASSIGNED`] when no such node exists.
    #[must_use]
    pub fn basic_hash_prior(&self, target: ModuleId) -> u64 {
        let mut last = None;
        for (k, node) in self.nodes.iter().enumerate() {
            if node.module() == target {
                break;
            }
            if node.is_enabled() && !self.visibility.is_hidden(node) {
                last = Some(k + 1);
            }
        }
        last.map_or(HASH_UNASSIGNED, |up_to| self.basic_hash(up_to))
    }

    /// `(basic, full)` hashes of the first `up_to` nodes evaluated at
    /// `roi`.
    #[must_use]
    pub fn full_hash(&self, roi: &Roi, up_to: usize) -> (u64, u64) {
        let basic = self.basic_hash(up_to);
        let mut hasher = Djb2::resume(basic);
        roi.fold_into(&mut hasher);
        (basic, hasher.finish())
    }

    /// Just the full hash.
    #[must_use]
    pub fn hash(&self, roi: &Roi, up_to: usize) -> u64 {
        self.full_hash(roi, up_to).1
    }
}
