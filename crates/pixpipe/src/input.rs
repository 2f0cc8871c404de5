//! Source images: decoding, a synthetic test card, and the input stage
//! that crops and scales the source to a region of interest.

use image::imageops::FilterType;
use image::{DynamicImage, Rgba, Rgba32FImage, RgbaImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
use imageproc::rect::Rect;
use pixpipe_cache::Roi;

use crate::types::PipeError;

/// Decode raw image bytes into linear-range RGBA `f32`.
///
/// Supports whatever the `image` crate was built to decode (PNG, JPEG,
/// BMP, WebP).
///
/// # Errors
///
/// Returns [`PipeError::EmptyInput`] if `bytes` is empty.
/// Returns [`PipeError::ImageDecode`] if the format is unrecognized or
/// the data is corrupt.
#[must_use = "returns the decoded image"]
pub fn decode_source(bytes: &[u8]) -> Result<Rgba32FImage, PipeError> {
    if bytes.is_empty() {
        return Err(PipeError::EmptyInput);
    }

    let img = image::load_from_memory(bytes)?;
    Ok(img.to_rgba32f())
}

/// A deterministic test card: gradient background, colored bars, and
/// a disc, so every operator has something visible to act on.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn test_card(width: u32, height: u32) -> Rgba32FImage {
    let mut img = RgbaImage::from_fn(width, height, |x, y| {
        let r = (x * 255 / width.max(1)) as u8;
        let g = (y * 255 / height.max(1)) as u8;
        Rgba([r, g, 96, 255])
    });

    let bars = [
        Rgba([230, 40, 40, 255]),
        Rgba([40, 200, 60, 255]),
        Rgba([40, 80, 230, 255]),
        Rgba([240, 240, 240, 255]),
    ];
    let bar_w = (width / 8).max(1);
    let bar_h = (height / 4).max(1);
    for (k, color) in bars.into_iter().enumerate() {
        let x = (width / 16 + k as u32 * bar_w) as i32;
        draw_filled_rect_mut(
            &mut img,
            Rect::at(x, (height / 16) as i32).of_size(bar_w, bar_h),
            color,
        );
    }

    let radius = (width.min(height) / 5) as i32;
    let center = ((width * 2 / 3) as i32, (height * 3 / 5) as i32);
    draw_filled_circle_mut(&mut img, center, radius, Rgba([250, 210, 40, 255]));

    DynamicImage::ImageRgba8(img).to_rgba32f()
}

/// The part of the full-resolution source covered by `roi`, as
/// `(x, y, width, height)` in source pixels.
///
/// # Errors
///
/// Returns [`PipeError::InvalidRoi`] if the region is empty, has a
/// non-positive scale, lies outside the scaled source, or its far edge
/// overflows `i32`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn source_window(source: (u32, u32), roi: &Roi) -> Result<(u32, u32, u32, u32), PipeError> {
    let invalid = || PipeError::InvalidRoi(*roi);
    if roi.width <= 0 || roi.height <= 0 || roi.x < 0 || roi.y < 0 || !(roi.scale > 0.0) {
        return Err(invalid());
    }

    let to_source = |v: i32| (f64::from(v) / roi.scale).floor().max(0.0) as u64;
    let x0 = to_source(roi.x);
    let y0 = to_source(roi.y);
    if x0 >= u64::from(source.0) || y0 >= u64::from(source.1) {
        return Err(invalid());
    }
    let x_end = roi.x.checked_add(roi.width).ok_or_else(invalid)?;
    let y_end = roi.y.checked_add(roi.height).ok_or_else(invalid)?;
    let x1 = to_source(x_end).clamp(x0 + 1, u64::from(source.0));
    let y1 = to_source(y_end).clamp(y0 + 1, u64::from(source.1));

    Ok((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
}

/// Crop and scale `source` to `roi`.
///
/// # Errors
///
/// Returns [`PipeError::InvalidRoi`] as [`source_window`] does.
#[allow(clippy::cast_sign_loss)]
pub fn render_roi(source: &Rgba32FImage, roi: &Roi) -> Result<Rgba32FImage, PipeError> {
    let (x, y, w, h) = source_window(source.dimensions(), roi)?;
    let window = image::imageops::crop_imm(source, x, y, w, h).to_image();
    let (out_w, out_h) = (roi.width as u32, roi.height as u32);
    if window.dimensions() == (out_w, out_h) {
        return Ok(window);
    }
    Ok(image::imageops::resize(
        &window,
        out_w,
        out_h,
        FilterType::Triangle,
    ))
}
