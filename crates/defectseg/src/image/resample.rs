//! Separable bilinear resize with corner-aligned sampling.
//!
//! Target column `c` samples source coordinate `c * (src_w - 1) / (dst_w - 1)`
//! (rows likewise), so the first and last samples of each axis land exactly on
//! the first and last source samples. The horizontal pass writes an
//! intermediate `dst_w x src_h` buffer; the vertical pass blends its rows.
//!
//! The arithmetic is single-precision and ordered exactly as the network was
//! calibrated with. The last column is copied from the last source column and
//! the last row takes only the `(1 - dy)` term, so neither pass reads past the
//! source edge. A single-sample target takes the last source column or row on
//! both axes.

use super::PixelBuffer;

/// Resize every channel of `src` to `width x height`.
///
/// A source or target extent of 1 degenerates to copy semantics on that axis.
/// Zero-area inputs or targets yield an all-zero buffer of the target shape;
/// callers reject zero-area images before they reach this stage.
pub fn resize_bilinear(src: &PixelBuffer, width: usize, height: usize) -> PixelBuffer {
    let (sw, sh, channels) = (src.width(), src.height(), src.channels());
    if sw == 0 || sh == 0 || width == 0 || height == 0 {
        return PixelBuffer::new(width, height, channels);
    }

    let w_scale = axis_scale(sw, width);
    let h_scale = axis_scale(sh, height);

    let mut part = PixelBuffer::new(width, sh, channels);
    for k in 0..channels {
        for r in 0..sh {
            let src_row = src.row(k, r);
            let dst_row = part.row_mut(k, r);
            for (c, dst) in dst_row.iter_mut().enumerate() {
                *dst = if c == width - 1 || sw == 1 {
                    src_row[sw - 1]
                } else {
                    let sx = c as f32 * w_scale;
                    let ix = (sx as usize).min(sw - 2);
                    let dx = sx - ix as f32;
                    (1.0 - dx) * src_row[ix] + dx * src_row[ix + 1]
                };
            }
        }
    }

    let mut out = PixelBuffer::new(width, height, channels);
    for k in 0..channels {
        for r in 0..height {
            let sy = if height == 1 {
                (sh - 1) as f32
            } else {
                r as f32 * h_scale
            };
            let iy = (sy as usize).min(sh - 1);
            let dy = sy - iy as f32;

            let dst_row = out.row_mut(k, r);
            for (dst, &v) in dst_row.iter_mut().zip(part.row(k, iy)) {
                *dst = (1.0 - dy) * v;
            }
            if r == height - 1 || sh == 1 {
                continue;
            }
            let next = (iy + 1).min(sh - 1);
            for (dst, &v) in dst_row.iter_mut().zip(part.row(k, next)) {
                *dst += dy * v;
            }
        }
    }
    out
}

/// Source step per target sample; a single-sample target never steps.
fn axis_scale(src: usize, dst: usize) -> f32 {
    if dst <= 1 {
        0.0
    } else {
        (src - 1) as f32 / (dst - 1) as f32
    }
}
