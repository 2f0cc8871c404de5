//! Color picker sampling over a node's output.

use pixpipe_cache::{BufferShape, PickerSample};

/// Mean RGBA of `pixels` under `sample`.
///
/// Sample coordinates are relative to the buffer, `0.0..=1.0` on both
/// axes. Returns `None` for an empty buffer.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn sample_mean(shape: &BufferShape, pixels: &[f32], sample: &PickerSample) -> Option<[f32; 4]> {
    let (w, h) = (shape.width as usize, shape.height as usize);
    if w == 0 || h == 0 || pixels.len() < w * h * 4 {
        return None;
    }
    let to_px = |v: f32, n: usize| ((v.clamp(0.0, 1.0) * n as f32) as usize).min(n - 1);

    let (x0, y0, x1, y1) = match *sample {
        PickerSample::Point([x, y]) => {
            let (px, py) = (to_px(x, w), to_px(y, h));
            (px, py, px, py)
        }
        PickerSample::Box([ax, ay, bx, by]) => (
            to_px(ax.min(bx), w),
            to_px(ay.min(by), h),
            to_px(ax.max(bx), w),
            to_px(ay.max(by), h),
        ),
    };

    let mut sum = [0.0f64; 4];
    let mut count = 0usize;
    for y in y0..=y1 {
        let row = &pixels[(y * w + x0) * 4..(y * w + x1 + 1) * 4];
        for px in row.chunks_exact(4) {
            for (s, v) in sum.iter_mut().zip(px) {
                *s += f64::from(*v);
            }
            count += 1;
        }
    }
    let n = count as f64;
    Some(sum.map(|s| (s / n) as f32))
}
