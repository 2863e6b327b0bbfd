//! Aspect-preserving embed of an image into a fixed network canvas.

use super::{resize_bilinear, PixelBuffer};

/// Neutral padding written around letterboxed content.
pub const LETTERBOX_PAD_VALUE: f32 = 0.5;

/// Placement of scaled content inside a letterbox canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LetterboxGeometry {
    pub source: [usize; 2],
    pub canvas: [usize; 2],
    /// Content size after scaling.
    pub scaled: [usize; 2],
    /// Top-left corner of the content inside the canvas.
    pub offset: [usize; 2],
}

impl LetterboxGeometry {
    /// Fit a `src_w x src_h` image into a `canvas_w x canvas_h` canvas.
    ///
    /// When `canvas_w / src_w < canvas_h / src_h` width is the binding axis:
    /// `scaled = (canvas_w, src_h * canvas_w / src_w)`; otherwise height binds
    /// and `scaled = (src_w * canvas_h / src_h, canvas_h)`. Divisions truncate.
    /// The ratio comparison is done by integer cross-multiplication. A scaled
    /// extent that truncates to zero is bumped to one pixel.
    pub fn fit(src_w: usize, src_h: usize, canvas_w: usize, canvas_h: usize) -> Self {
        let (sw, sh) = (src_w.max(1) as u64, src_h.max(1) as u64);
        let (cw, ch) = (canvas_w as u64, canvas_h as u64);

        let (new_w, new_h) = if cw * sh < ch * sw {
            (cw, sh * cw / sw)
        } else {
            (sw * ch / sh, ch)
        };
        let new_w = (new_w as usize).clamp(1.min(canvas_w), canvas_w);
        let new_h = (new_h as usize).clamp(1.min(canvas_h), canvas_h);

        Self {
            source: [src_w, src_h],
            canvas: [canvas_w, canvas_h],
            scaled: [new_w, new_h],
            offset: [(canvas_w - new_w) / 2, (canvas_h - new_h) / 2],
        }
    }

    /// Uniform scale applied to the source.
    pub fn scale(&self) -> f64 {
        if self.source[0] == 0 {
            return 0.0;
        }
        self.scaled[0] as f64 / self.source[0] as f64
    }

    /// Map a canvas pixel back to source pixel coordinates.
    ///
    /// Returns `None` for canvas pixels in the padding band.
    pub fn canvas_to_source(&self, x: usize, y: usize) -> Option<[f64; 2]> {
        let [ox, oy] = self.offset;
        let [nw, nh] = self.scaled;
        if x < ox || y < oy || x >= ox + nw || y >= oy + nh {
            return None;
        }
        let sx = if nw > 1 {
            (x - ox) as f64 * (self.source[0] as f64 - 1.0) / (nw as f64 - 1.0)
        } else {
            self.source[0] as f64 - 1.0
        };
        let sy = if nh > 1 {
            (y - oy) as f64 * (self.source[1] as f64 - 1.0) / (nh as f64 - 1.0)
        } else {
            0.0
        };
        Some([sx, sy])
    }
}

/// Scale `src` to fit a `width x height` canvas without distortion and centre
/// it on a canvas filled with `pad_value`.
///
/// The canvas always has exactly `width x height` pixels and the source's
/// channel count.
pub fn letterbox(src: &PixelBuffer, width: usize, height: usize, pad_value: f32) -> PixelBuffer {
    let geometry = LetterboxGeometry::fit(src.width(), src.height(), width, height);
    letterbox_with(src, &geometry, pad_value)
}

pub(crate) fn letterbox_with(
    src: &PixelBuffer,
    geometry: &LetterboxGeometry,
    pad_value: f32,
) -> PixelBuffer {
    let [width, height] = geometry.canvas;
    let [new_w, new_h] = geometry.scaled;
    let [ox, oy] = geometry.offset;

    let resized = resize_bilinear(src, new_w, new_h);
    let mut boxed = PixelBuffer::filled(width, height, src.channels(), pad_value);
    for k in 0..src.channels() {
        for y in 0..new_h {
            let dst = &mut boxed.row_mut(k, oy + y)[ox..ox + new_w];
            dst.copy_from_slice(resized.row(k, y));
        }
    }
    boxed
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn wide_image_gets_vertical_bands() {
        let src = PixelBuffer::filled(100, 50, 3, 200.0);
        let boxed = letterbox(&src, 100, 100, LETTERBOX_PAD_VALUE);
        assert_eq!((boxed.width(), boxed.height(), boxed.channels()), (100, 100, 3));

        let geometry = LetterboxGeometry::fit(100, 50, 100, 100);
        assert_eq!(geometry.scaled, [100, 50]);
        assert_eq!(geometry.offset, [0, 25]);
        assert_eq!(geometry.scale(), 1.0);

        for k in 0..3 {
            for y in 0..100 {
                let expected = if (25..75).contains(&y) { 200.0 } else { 0.5 };
                assert!(
                    boxed.row(k, y).iter().all(|&v| v == expected),
                    "row {y} of channel {k} should be {expected}"
                );
            }
        }
    }

    #[test]
    fn tall_image_gets_horizontal_bands() {
        let geometry = LetterboxGeometry::fit(30, 90, 224, 224);
        assert_eq!(geometry.scaled, [74, 224]);
        assert_eq!(geometry.offset, [75, 0]);
    }

    #[test]
    fn square_source_fills_canvas() {
        let src = PixelBuffer::filled(448, 448, 1, 9.0);
        let boxed = letterbox(&src, 224, 224, LETTERBOX_PAD_VALUE);
        assert!(boxed.data().iter().all(|&v| v == 9.0));
    }

    #[test]
    fn preserves_aspect_ratio() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let (sw, sh) = (rng.gen_range(1..2000), rng.gen_range(1..2000));
            let (cw, ch) = (rng.gen_range(8..512), rng.gen_range(8..512));
            let g = LetterboxGeometry::fit(sw, sh, cw, ch);
            let [nw, nh] = g.scaled;
            assert!(nw <= cw && nh <= ch);
            assert!(nw == cw || nh == ch, "one axis must bind: {g:?}");
            // The non-binding axis is within one pixel of its ideal extent.
            let ideal_h = sh as f64 * nw as f64 / sw as f64;
            let ideal_w = sw as f64 * nh as f64 / sh as f64;
            assert!(
                (nh as f64 - ideal_h).abs() < 1.0 || (nw as f64 - ideal_w).abs() < 1.0,
                "aspect drift for {g:?}"
            );
        }
    }

    #[test]
    fn content_is_centered() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let g = LetterboxGeometry::fit(
                rng.gen_range(1..900),
                rng.gen_range(1..900),
                rng.gen_range(1..300),
                rng.gen_range(1..300),
            );
            let left = g.offset[0];
            let right = g.canvas[0] - g.scaled[0] - g.offset[0];
            let top = g.offset[1];
            let bottom = g.canvas[1] - g.scaled[1] - g.offset[1];
            assert!(right == left || right == left + 1);
            assert!(bottom == top || bottom == top + 1);
        }
    }

    #[test]
    fn canvas_to_source_skips_padding() {
        let g = LetterboxGeometry::fit(100, 50, 100, 100);
        assert_eq!(g.canvas_to_source(10, 10), None);
        assert_eq!(g.canvas_to_source(0, 25), Some([0.0, 0.0]));
        assert_eq!(g.canvas_to_source(99, 74), Some([99.0, 49.0]));
    }
}
