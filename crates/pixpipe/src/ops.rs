//! Pixel operators evaluated by pipeline nodes.
//!
//! Every operator maps an RGBA `f32` buffer to another of the same
//! shape. Parameters are folded into the node's content hash through
//! [`Operator::hash_params`], so any parameter change changes the
//! cache key of the node and everything after it.

use std::hash::Hasher;

use image::Rgba32FImage;
use pixpipe_cache::{BufferShape, OperationTags};
use serde::{Deserialize, Serialize};

/// An image operation and its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Operator {
    /// Multiply RGB by `2^ev`.
    Exposure {
        /// Exposure change in stops.
        ev: f32,
    },
    /// Per-channel RGB gains.
    ColorBalance {
        /// Red, green, and blue multipliers.
        gains: [f32; 3],
    },
    /// Replace RGB with Rec. 709 luminance.
    Grayscale,
    /// `1 - x` on RGB.
    Invert,
    /// Gaussian blur of all four channels.
    GaussianBlur {
        /// Standard deviation in pixels. Non-positive values copy.
        sigma: f32,
    },
    /// Darken towards the corners.
    Vignette {
        /// Darkening at the corners, 0 to 1.
        strength: f32,
    },
}

impl Operator {
    /// Capability tags of the operation.
    #[must_use]
    pub const fn tags(&self) -> OperationTags {
        match self {
            Self::Vignette { .. } => OperationTags::DECORATE,
            Self::GaussianBlur { .. } => OperationTags::DISTORT,
            _ => OperationTags::NONE,
        }
    }

    /// Fold the operator kind and parameters into `hasher`.
    pub fn hash_params<H: Hasher>(&self, hasher: &mut H) {
        match self {
            Self::Exposure { ev } => {
                hasher.write_u8(0);
                hasher.write_u32(ev.to_bits());
            }
            Self::ColorBalance { gains } => {
                hasher.write_u8(1);
                for g in gains {
                    hasher.write_u32(g.to_bits());
                }
            }
            Self::Grayscale => hasher.write_u8(2),
            Self::Invert => hasher.write_u8(3),
            Self::GaussianBlur { sigma } => {
                hasher.write_u8(4);
                hasher.write_u32(sigma.to_bits());
            }
            Self::Vignette { strength } => {
                hasher.write_u8(5);
                hasher.write_u32(strength.to_bits());
            }
        }
    }

    /// Compute `dst` from `src`. Both hold `shape` as RGBA `f32`.
    pub fn apply(&self, shape: &BufferShape, src: &[f32], dst: &mut [f32]) {
        match *self {
            Self::Exposure { ev } => {
                let gain = ev.exp2();
                map_rgb(src, dst, |c, _| c * gain);
            }
            Self::ColorBalance { gains } => map_rgb(src, dst, |c, k| c * gains[k]),
            Self::Grayscale => {
                for (s, d) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
                    let y = 0.0722f32.mul_add(s[2], 0.2126f32.mul_add(s[0], 0.7152 * s[1]));
                    d.copy_from_slice(&[y, y, y, s[3]]);
                }
            }
            Self::Invert => map_rgb(src, dst, |c, _| 1.0 - c),
            Self::GaussianBlur { sigma } => gaussian_blur(shape, sigma, src, dst),
            Self::Vignette { strength } => vignette(shape, strength, src, dst),
        }
    }
}

fn map_rgb(src: &[f32], dst: &mut [f32], f: impl Fn(f32, usize) -> f32) {
    for (s, d) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
        for k in 0..3 {
            d[k] = f(s[k], k);
        }
        d[3] = s[3];
    }
}

/// Blur through `image::imageops::blur`, which handles `f32` pixels
/// directly. Non-positive sigma copies the input unchanged.
fn gaussian_blur(shape: &BufferShape, sigma: f32, src: &[f32], dst: &mut [f32]) {
    let source = (sigma > 0.0)
        .then(|| Rgba32FImage::from_raw(shape.width, shape.height, src.to_vec()))
        .flatten();
    match source {
        Some(image) => {
            let blurred = image::imageops::blur(&image, sigma);
            dst.copy_from_slice(blurred.as_raw());
        }
        None => dst.copy_from_slice(src),
    }
}

#[allow(clippy::cast_precision_loss)]
fn vignette(shape: &BufferShape, strength: f32, src: &[f32], dst: &mut [f32]) {
    let (w, h) = (shape.width as f32, shape.height as f32);
    let (cx, cy) = (w / 2.0, h / 2.0);
    let max_r2 = cx.mul_add(cx, cy * cy).max(f32::EPSILON);
    let width = shape.width as usize;
    for (i, (s, d)) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)).enumerate() {
        let x = (i % width.max(1)) as f32 + 0.5 - cx;
        let y = (i / width.max(1)) as f32 + 0.5 - cy;
        let falloff = strength.clamp(0.0, 1.0).mul_add(-(x.mul_add(x, y * y) / max_r2), 1.0);
        for k in 0..3 {
            d[k] = s[k] * falloff;
        }
        d[3] = s[3];
    }
}
