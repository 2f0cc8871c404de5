//! The pipe: evaluates nodes over a region of interest through the cache.
//!
//! Stage 0 is the source cropped and scaled to the region of interest;
//! stage `k + 1` is the output of node `k`. Disabled nodes and nodes
//! hidden by the focus filter produce no stage. Each stage is keyed by
//! the hashes of everything before it, so a parameter edit only misses
//! from the edited node onwards.

use image::Rgba32FImage;
use pixpipe_cache::{
    BufferShape, CacheConfig, CacheError, CacheGet, CacheReport, CacheRequest, FocusFilter,
    HashContext, LineId, MaskDisplay, ModuleId, PickerSample, PipeType, PixelpipeCache, Roi,
    Visibility,
};
use tracing::{debug, trace, warn};

use crate::input;
use crate::node::Node;
use crate::ops::Operator;
use crate::picker::sample_mean;
use crate::types::{PassStats, PipeError, PipeOutput};

/// Cache preset for a pipe of type `kind` over a source of `source`
/// pixels.
#[must_use]
pub fn preset_for(kind: PipeType, source: (u32, u32), memory_limit: usize) -> CacheConfig {
    if kind.is_alternating() {
        return CacheConfig::export(
            BufferShape::rgba_f32(source.0, source.1)
                .byte_size()
                .unwrap_or(0),
        );
    }
    match kind {
        PipeType::Preview | PipeType::Preview2 => CacheConfig {
            memory_limit,
            ..CacheConfig::preview()
        },
        _ => CacheConfig::full(memory_limit),
    }
}

#[derive(Debug, Clone, Copy)]
struct Stage {
    node: Option<usize>,
    label: &'static str,
    basic_hash: u64,
    full_hash: u64,
    picks: bool,
}

/// A sequence of nodes over one source image, with its own cache.
#[derive(Debug)]
pub struct Pipe {
    kind: PipeType,
    cache: PixelpipeCache,
    nodes: Vec<Node>,
    source: Rgba32FImage,
    image_id: i32,
    mask_display: MaskDisplay,
    focus: Option<FocusFilter>,
    picker: Option<PickerSample>,
}

impl Pipe {
    /// Build an empty pipe.
    ///
    /// If preallocating the cache fails, the pipe continues with lines
    /// that grow on first use.
    ///
    /// # Errors
    ///
    /// Returns [`PipeError::Cache`] for an invalid configuration.
    pub fn new(
        kind: PipeType,
        config: &CacheConfig,
        source: Rgba32FImage,
        image_id: i32,
    ) -> Result<Self, PipeError> {
        let cache = match PixelpipeCache::new(config) {
            Ok(cache) => cache,
            Err(CacheError::Allocation { bytes }) => {
                warn!(
                    ?kind,
                    bytes, "cache preallocation failed, growing lines on demand"
                );
                PixelpipeCache::new(&config.lazy())?
            }
            Err(e) => return Err(e.into()),
        };
        debug!(
            ?kind,
            entries = cache.entries(),
            image_id,
            "pipe created"
        );
        Ok(Self {
            kind,
            cache,
            nodes: Vec::new(),
            source,
            image_id,
            mask_display: MaskDisplay::NONE,
            focus: None,
            picker: None,
        })
    }

    /// Build a pipe with the cache preset of its type.
    ///
    /// # Errors
    ///
    /// As [`Pipe::new`].
    pub fn with_preset(
        kind: PipeType,
        source: Rgba32FImage,
        image_id: i32,
        memory_limit: usize,
    ) -> Result<Self, PipeError> {
        let config = preset_for(kind, source.dimensions(), memory_limit);
        Self::new(kind, &config, source, image_id)
    }

    /// Append a node.
    pub fn push(&mut self, node: Node) {
        self.nodes.push(node);
    }

    /// Builder form of [`Pipe::push`].
    #[must_use]
    pub fn with_node(mut self, node: Node) -> Self {
        self.push(node);
        self
    }

    /// Pipe type.
    #[must_use]
    pub const fn kind(&self) -> PipeType {
        self.kind
    }

    /// The pipe's cache.
    #[must_use]
    pub const fn cache(&self) -> &PixelpipeCache {
        &self.cache
    }

    /// Nodes in evaluation order.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Source image dimensions.
    #[must_use]
    pub fn source_dimensions(&self) -> (u32, u32) {
        self.source.dimensions()
    }

    fn node_mut(&mut self, index: usize) -> Result<&mut Node, PipeError> {
        self.nodes
            .get_mut(index)
            .ok_or(PipeError::NoSuchNode(index))
    }

    /// Replace the operator of node `index`.
    ///
    /// # Errors
    ///
    /// Returns [`PipeError::NoSuchNode`] for an index out of range.
    pub fn set_params(&mut self, index: usize, op: Operator) -> Result<(), PipeError> {
        self.node_mut(index)?.op = op;
        Ok(())
    }

    /// Enable or disable node `index`.
    ///
    /// # Errors
    ///
    /// Returns [`PipeError::NoSuchNode`] for an index out of range.
    pub fn set_enabled(&mut self, index: usize, enabled: bool) -> Result<(), PipeError> {
        self.node_mut(index)?.enabled = enabled;
        Ok(())
    }

    /// Make node `index` the color picking node, or stop it picking.
    ///
    /// # Errors
    ///
    /// Returns [`PipeError::NoSuchNode`] for an index out of range.
    pub fn set_color_pick(&mut self, index: usize, pick: bool) -> Result<(), PipeError> {
        self.node_mut(index)?.color_pick = pick;
        Ok(())
    }

    /// Focus a module for editing, or clear the focus.
    pub const fn set_focus(&mut self, focus: Option<FocusFilter>) {
        self.focus = focus;
    }

    /// Set or clear the picker sample.
    pub const fn set_picker(&mut self, picker: Option<PickerSample>) {
        self.picker = picker;
    }

    /// Change the mask display mode.
    pub const fn set_mask_display(&mut self, mask_display: MaskDisplay) {
        self.mask_display = mask_display;
    }

    /// Change the cache's memory limit.
    pub const fn set_memory_limit(&mut self, limit: usize) {
        self.cache.set_memory_limit(limit);
    }

    /// Replace the source image. Every cached buffer is forgotten.
    pub fn set_image(&mut self, source: Rgba32FImage, image_id: i32) {
        self.source = source;
        self.image_id = image_id;
        self.cache.flush();
    }

    /// Forget every cached buffer except those holding the pipe's
    /// current output, at any region of interest.
    pub fn keep_only_output(&mut self) {
        let basic = self.context().basic_hash(self.output_up_to());
        self.cache.flush_all_but(basic);
    }

    /// Basic hash of the input to the node of `module`.
    #[must_use]
    pub fn input_hash_of(&self, module: ModuleId) -> u64 {
        self.context().basic_hash_prior(module)
    }

    /// Cache statistics.
    #[must_use]
    pub fn report(&self) -> CacheReport {
        self.cache.report()
    }

    fn context(&self) -> HashContext<'_, Node, impl Visibility<Node>> {
        let focus = self.focus;
        HashContext::new(self.image_id, self.kind, self.mask_display, &self.nodes)
            .with_visibility(move |node: &Node| focus.is_some_and(|f| f.is_hidden(node)))
            .with_picker(self.picker)
    }

    fn is_active(&self, node: &Node) -> bool {
        node.enabled && !self.focus.is_some_and(|f| f.is_hidden(node))
    }

    /// Number of leading nodes covered by the output stage.
    fn output_up_to(&self) -> usize {
        self.nodes
            .iter()
            .rposition(|n| self.is_active(n))
            .map_or(0, |k| k + 1)
    }

    fn stages(&self, roi: &Roi) -> Vec<Stage> {
        let ctx = self.context();
        let (basic_hash, full_hash) = ctx.full_hash(roi, 0);
        let input = Stage {
            node: None,
            label: "input",
            basic_hash,
            full_hash,
            picks: false,
        };
        std::iter::once(input)
            .chain(
                self.nodes
                    .iter()
                    .enumerate()
                    .filter(|(_, n)| self.is_active(n))
                    .map(|(k, n)| {
                        let (basic_hash, full_hash) = ctx.full_hash(roi, k + 1);
                        Stage {
                            node: Some(k),
                            label: n.name,
                            basic_hash,
                            full_hash,
                            picks: n.color_pick,
                        }
                    }),
            )
            .collect()
    }

    /// Evaluate the pipe at `roi`.
    ///
    /// Starts from the latest stage already in the cache, or from the
    /// picking node's stage if that comes earlier, and computes every
    /// missing stage after it. Memory is reclaimed at the end of the
    /// pass.
    ///
    /// # Errors
    ///
    /// Returns [`PipeError::InvalidRoi`] for an empty or out-of-bounds
    /// region. Returns [`PipeError::NoBuffer`] if a cacheline could not
    /// be allocated. A stage that fails leaves its line invalidated.
    #[allow(clippy::cast_sign_loss)]
    pub fn process(&mut self, roi: &Roi) -> Result<PipeOutput, PipeError> {
        input::source_window(self.source.dimensions(), roi)?;
        let (width, height) = (roi.width as u32, roi.height as u32);
        let shape = BufferShape::rgba_f32(width, height);
        let byte_size = shape.byte_size().ok_or(PipeError::InvalidRoi(*roi))?;
        self.cache.set_mask_display(self.mask_display);

        let stages = self.stages(roi);
        let picking = self
            .picker
            .and_then(|_| stages.iter().position(|s| s.picks));
        let limit = picking.unwrap_or(stages.len() - 1);
        let start = if self.cache.entries() == 2 {
            0
        } else {
            stages[..=limit]
                .iter()
                .rposition(|s| self.cache.available(s.full_hash, byte_size))
                .unwrap_or(0)
        };
        trace!(stages = stages.len(), start, ?picking, "pipe pass");

        let mut stats = PassStats::default();
        let mut picked = None;
        let mut previous: Option<LineId> = None;
        for (k, stage) in stages.iter().enumerate().skip(start) {
            let got = self.cache.get(&CacheRequest {
                basic_hash: stage.basic_hash,
                full_hash: stage.full_hash,
                byte_size,
                shape,
                important: picking == Some(k),
                label: stage.label,
            });
            if got.hit {
                stats.hits += 1;
            } else {
                stats.misses += 1;
                stats.computed.push(stage.label);
                if let Err(e) = self.compute(stage, previous, got, roi, &shape) {
                    warn!(node = stage.label, "{e}");
                    if let Some(addr) = self.cache.line(got.line).addr() {
                        self.cache.invalidate(addr);
                    }
                    return Err(e);
                }
            }
            if picking == Some(k) {
                picked = self.pick(got.line, &shape, byte_size);
            }
            previous = Some(got.line);
        }

        let last = stages[stages.len() - 1];
        let line = previous.ok_or(PipeError::MissingInput { node: last.label })?;
        let bytes = self
            .cache
            .buffer(line)
            .ok_or(PipeError::NoBuffer { node: last.label })?;
        let pixels = as_pixels(bytes, last.label)?.to_vec();
        let image = Rgba32FImage::from_raw(width, height, pixels).ok_or_else(|| {
            PipeError::BufferLayout {
                node: last.label,
                reason: format!("buffer does not hold {width}x{height} pixels"),
            }
        })?;

        stats.reclaimed = self.cache.reclaim_memory();
        debug!(
            hits = stats.hits,
            misses = stats.misses,
            freed = stats.reclaimed.freed_bytes,
            "pipe processed {width}x{height} at scale {}",
            roi.scale,
        );

        Ok(PipeOutput {
            image,
            basic_hash: last.basic_hash,
            full_hash: last.full_hash,
            picked,
            stats,
        })
    }

    fn compute(
        &mut self,
        stage: &Stage,
        input: Option<LineId>,
        output: CacheGet,
        roi: &Roi,
        shape: &BufferShape,
    ) -> Result<(), PipeError> {
        let node = stage.label;
        let Some(index) = stage.node else {
            if self.cache.buffer(output.line).is_none() {
                return Err(PipeError::NoBuffer { node });
            }
            let pixels = input::render_roi(&self.source, roi)?;
            let dst = self
                .cache
                .buffer_mut(output.line)
                .ok_or(PipeError::NoBuffer { node })?;
            let dst = as_pixels_mut(dst, node)?;
            if dst.len() != pixels.as_raw().len() {
                return Err(PipeError::BufferLayout {
                    node,
                    reason: format!("{} values for {} pixels", dst.len(), pixels.len() / 4),
                });
            }
            dst.copy_from_slice(pixels.as_raw());
            return Ok(());
        };

        let op = self.nodes[index].op;
        let input = input.ok_or(PipeError::MissingInput { node })?;
        if input == output.line {
            // Every line was in use; the output reuses the input's line.
            if output.reallocated {
                return Err(PipeError::MissingInput { node });
            }
            let dst = self
                .cache
                .buffer_mut(output.line)
                .ok_or(PipeError::NoBuffer { node })?;
            let dst = as_pixels_mut(dst, node)?;
            let src = dst.to_vec();
            op.apply(shape, &src, dst);
        } else {
            let (src, dst) = self
                .cache
                .buffers_mut(input, output.line)
                .ok_or(PipeError::NoBuffer { node })?;
            op.apply(shape, as_pixels(src, node)?, as_pixels_mut(dst, node)?);
        }
        Ok(())
    }

    /// Sample the picker on a line and pin the line.
    fn pick(&mut self, line: LineId, shape: &BufferShape, byte_size: usize) -> Option<[f32; 4]> {
        let sample = self.picker?;
        let color = self
            .cache
            .buffer(line)
            .and_then(|b| bytemuck::try_cast_slice::<u8, f32>(b).ok())
            .and_then(|px| sample_mean(shape, px, &sample));
        if let Some(addr) = self.cache.line(line).addr() {
            self.cache.reweight(addr, byte_size);
        }
        color
    }
}

fn as_pixels<'a>(bytes: &'a [u8], node: &'static str) -> Result<&'a [f32], PipeError> {
    bytemuck::try_cast_slice(bytes).map_err(|e| PipeError::BufferLayout {
        node,
        reason: e.to_string(),
    })
}

fn as_pixels_mut<'a>(bytes: &'a mut [u8], node: &'static str) -> Result<&'a mut [f32], PipeError> {
    bytemuck::try_cast_slice_mut(bytes).map_err(|e| PipeError::BufferLayout {
        node,
        reason: e.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pixpipe_cache::{LineWeight, OperationTags};

    use super::*;
    use crate::input::test_card;

    fn pipe(config: &CacheConfig) -> Pipe {
        Pipe::new(PipeType::Full, config, test_card(32, 24), 7)
            .unwrap()
            .with_node(Node::new(1, "exposure", Operator::Exposure { ev: 0.5 }))
            .with_node(Node::new(2, "invert", Operator::Invert))
            .with_node(Node::new(3, "vignette", Operator::Vignette { strength: 0.4 }))
    }

    fn roi() -> Roi {
        Roi::full(32, 24, 1.0)
    }

    #[test]
    fn first_pass_computes_every_stage() {
        let mut p = pipe(&CacheConfig::full(0));
        let out = p.process(&roi()).unwrap();
        assert_eq!(out.stats.computed, ["input", "exposure", "invert", "vignette"]);
        assert_eq!(out.stats.hits, 0);
        assert_eq!(out.image.dimensions(), (32, 24));
    }

    #[test]
    fn second_pass_hits_the_output() {
        let mut p = pipe(&CacheConfig::full(0));
        let first = p.process(&roi()).unwrap();
        let second = p.process(&roi()).unwrap();
        assert_eq!(second.stats.hits, 1);
        assert_eq!(second.stats.misses, 0);
        assert_eq!(first.image.as_raw(), second.image.as_raw());
        assert_eq!(first.full_hash, second.full_hash);
    }

    #[test]
    fn edit_recomputes_from_the_edited_node() {
        let mut p = pipe(&CacheConfig::full(0));
        p.process(&roi()).unwrap();
        p.set_params(1, Operator::Exposure { ev: -1.0 }).unwrap();
        let out = p.process(&roi()).unwrap();
        assert_eq!(out.stats.hits, 1, "exposure output is reused");
        assert_eq!(out.stats.computed, ["invert", "vignette"]);
    }

    #[test]
    fn disabled_nodes_are_skipped() {
        let mut p = pipe(&CacheConfig::full(0));
        p.set_enabled(1, false).unwrap();
        let out = p.process(&roi()).unwrap();
        assert_eq!(out.stats.computed, ["input", "exposure", "vignette"]);
    }

    #[test]
    fn focus_hides_decorations() {
        let mut p = pipe(&CacheConfig::full(0));
        p.set_focus(Some(FocusFilter {
            module: ModuleId(1),
            tags_filter: OperationTags::DECORATE,
        }));
        let out = p.process(&roi()).unwrap();
        assert_eq!(out.stats.computed, ["input", "exposure", "invert"]);
    }

    #[test]
    fn alternating_cache_recomputes_everything() {
        let config = preset_for(PipeType::Export, (32, 24), 0);
        let mut p = Pipe::new(PipeType::Export, &config, test_card(32, 24), 7)
            .unwrap()
            .with_node(Node::new(1, "invert", Operator::Invert));
        let a = p.process(&roi()).unwrap();
        let b = p.process(&roi()).unwrap();
        assert_eq!(b.stats.misses, 2);
        assert_eq!(a.image.as_raw(), b.image.as_raw());
    }

    #[test]
    fn picker_pins_its_stage() {
        let mut p = pipe(&CacheConfig::full(0));
        p.set_color_pick(0, true).unwrap();
        p.set_picker(Some(PickerSample::Box([0.0, 0.0, 1.0, 1.0])));
        let out = p.process(&roi()).unwrap();
        assert!(out.picked.is_some());

        let pinned = p
            .cache()
            .lines()
            .filter(|(_, l)| l.label() == Some("exposure"))
            .map(|(_, l)| l.weight())
            .next()
            .unwrap();
        assert!(pinned.is_important(), "got {pinned:?}");
    }

    #[test]
    fn picker_moves_change_downstream_hashes() {
        let mut p = pipe(&CacheConfig::full(0));
        p.set_color_pick(0, true).unwrap();
        p.set_picker(Some(PickerSample::Point([0.2, 0.2])));
        let a = p.process(&roi()).unwrap();
        p.set_picker(Some(PickerSample::Point([0.8, 0.8])));
        let b = p.process(&roi()).unwrap();
        assert_ne!(a.full_hash, b.full_hash);
        assert_eq!(b.stats.hits, 1, "input stage is reused");
    }

    #[test]
    fn set_image_flushes() {
        let mut p = pipe(&CacheConfig::full(0));
        p.process(&roi()).unwrap();
        p.set_image(test_card(32, 24), 8);
        assert_eq!(p.cache().queries(), 0);
        assert!(
            p.cache()
                .lines()
                .all(|(_, l)| l.weight() == LineWeight::Stale(0))
        );
        let out = p.process(&roi()).unwrap();
        assert_eq!(out.stats.hits, 0);
    }

    #[test]
    fn keep_only_output_survives_roi_change() {
        let mut p = pipe(&CacheConfig::full(0));
        let full = p.process(&roi()).unwrap();
        p.keep_only_output();
        let kept: Vec<u64> = p
            .cache()
            .lines()
            .filter(|(_, l)| l.basic_hash() != pixpipe_cache::HASH_UNASSIGNED)
            .map(|(_, l)| l.basic_hash())
            .collect();
        assert_eq!(kept, [full.basic_hash]);
    }

    #[test]
    fn input_hash_matches_upstream_stage() {
        let mut p = pipe(&CacheConfig::full(0));
        p.set_enabled(1, false).unwrap();
        let ctx_hash = p.input_hash_of(ModuleId(3));
        let expected = p.context().basic_hash(1);
        assert_eq!(ctx_hash, expected);
    }

    #[test]
    fn invalid_roi_is_rejected_without_queries() {
        let mut p = pipe(&CacheConfig::full(0));
        let bad = Roi {
            x: 0,
            y: 0,
            width: 0,
            height: 10,
            scale: 1.0,
        };
        assert!(matches!(p.process(&bad), Err(PipeError::InvalidRoi(_))));
        assert_eq!(p.cache().queries(), 0);
    }

    #[test]
    fn presets_follow_pipe_type() {
        for kind in [PipeType::Export, PipeType::Thumbnail] {
            let config = preset_for(kind, (32, 24), 1 << 20);
            assert_eq!(config.entries, 2);
            assert_eq!(config.line_size, 32 * 24 * 16);
        }
        assert_eq!(
            preset_for(PipeType::Preview2, (32, 24), 5).entries,
            CacheConfig::PREVIEW_ENTRIES
        );
        assert_eq!(preset_for(PipeType::Full, (32, 24), 5).memory_limit, 5);
    }

    #[test]
    fn lowered_memory_limit_applies_on_next_pass() {
        let line = 32 * 24 * 16;
        let mut p = pipe(&CacheConfig {
            entries: 8,
            line_size: 0,
            memory_limit: 0,
        });
        let first = p.process(&roi()).unwrap();
        assert_eq!(first.stats.reclaimed.lines(), 0);
        assert_eq!(p.cache().bytes_used(), 4 * line);

        p.set_memory_limit(line);
        let second = p.process(&roi()).unwrap();
        assert_eq!(second.stats.hits, 1);
        assert_eq!(second.stats.reclaimed.cold_lines, 2);
        assert_eq!(second.stats.reclaimed.important_lines, 1);
        assert_eq!(p.cache().bytes_used(), line);
        assert_eq!(first.image.as_raw(), second.image.as_raw());
    }

    #[test]
    fn overflowing_roi_edge_is_rejected() {
        let mut p = pipe(&CacheConfig::full(0));
        let wide = Roi {
            x: 1,
            y: 0,
            width: i32::MAX,
            height: 4,
            scale: 1.0,
        };
        assert!(matches!(p.process(&wide), Err(PipeError::InvalidRoi(_))));
        assert_eq!(p.cache().queries(), 0);
    }

    #[test]
    fn unknown_node_index() {
        let mut p = pipe(&CacheConfig::full(0));
        assert!(matches!(
            p.set_enabled(9, false),
            Err(PipeError::NoSuchNode(9))
        ));
    }

    #[test]
    fn mask_display_changes_keys() {
        let mut p = pipe(&CacheConfig::full(0));
        let a = p.process(&roi()).unwrap();
        p.set_mask_display(MaskDisplay::MASK);
        let b = p.process(&roi()).unwrap();
        assert_ne!(a.basic_hash, b.basic_hash);
        assert_eq!(b.stats.hits, 0);
    }
}
