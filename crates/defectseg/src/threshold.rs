//! Probability map to binary mask.

use serde::{Deserialize, Serialize};

use crate::image::{PixelBuffer, Shape};

/// Sentinel values written into a mask.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskValues {
    pub background: f32,
    pub foreground: f32,
}

impl Default for MaskValues {
    fn default() -> Self {
        Self {
            background: 0.0,
            foreground: 255.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ThresholdError {
    /// Probability map does not have the network's output shape.
    ShapeMismatch { expected: Shape, actual: Shape },
}

impl std::fmt::Display for ThresholdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeMismatch { expected, actual } => write!(
                f,
                "probability map is {actual}, expected network output {expected}"
            ),
        }
    }
}

impl std::error::Error for ThresholdError {}

/// Single-channel buffer holding only the two sentinel values.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    buffer: PixelBuffer,
    values: MaskValues,
}

impl Mask {
    pub fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    pub fn into_buffer(self) -> PixelBuffer {
        self.buffer
    }

    pub fn values(&self) -> MaskValues {
        self.values
    }

    pub fn width(&self) -> usize {
        self.buffer.width()
    }

    pub fn height(&self) -> usize {
        self.buffer.height()
    }

    pub fn foreground_count(&self) -> usize {
        self.buffer
            .data()
            .iter()
            .filter(|&&v| v == self.values.foreground)
            .count()
    }

    /// Share of foreground samples in `[0, 1]`.
    pub fn coverage(&self) -> f64 {
        let n = self.buffer.data().len();
        if n == 0 {
            return 0.0;
        }
        self.foreground_count() as f64 / n as f64
    }
}

/// Map `probabilities` to a mask: samples strictly below `threshold` become
/// background, everything else (ties and NaN included) foreground.
///
/// `expected` is the network output contract; any other shape means the engine
/// and topology disagree and is rejected.
pub fn threshold(
    probabilities: &PixelBuffer,
    expected: Shape,
    threshold: f32,
    values: MaskValues,
) -> Result<Mask, ThresholdError> {
    if probabilities.shape() != expected {
        return Err(ThresholdError::ShapeMismatch {
            expected,
            actual: probabilities.shape(),
        });
    }
    let mut buffer = PixelBuffer::new(expected.width, expected.height, expected.channels);
    for (dst, &p) in buffer.data_mut().iter_mut().zip(probabilities.data()) {
        *dst = if p < threshold {
            values.background
        } else {
            values.foreground
        };
    }
    Ok(Mask { buffer, values })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const OUT: Shape = Shape::new(4, 2, 1);

    fn probs(values: &[f32]) -> PixelBuffer {
        PixelBuffer::from_vec(4, 2, 1, values.to_vec()).unwrap()
    }

    #[test]
    fn boundary_is_inclusive_on_high_side() {
        let p = probs(&[0.0, 0.15, 0.1499, 0.9, 1.0, 0.5, 0.15, 0.2]);
        let mask = threshold(&p, OUT, 0.15, MaskValues::default()).unwrap();
        assert_eq!(
            mask.buffer().data(),
            &[0.0, 255.0, 0.0, 255.0, 255.0, 255.0, 255.0, 255.0]
        );
        assert_eq!(mask.foreground_count(), 6);
        assert_eq!(mask.coverage(), 0.75);
    }

    #[test]
    fn output_only_contains_sentinels() {
        let mut rng = StdRng::seed_from_u64(5);
        let values = MaskValues {
            background: -1.0,
            foreground: 7.0,
        };
        for _ in 0..100 {
            let data: Vec<f32> = (0..8).map(|_| rng.gen_range(-0.5..1.5)).collect();
            let t = rng.gen_range(-0.1..1.1);
            let mask = threshold(&probs(&data), OUT, t, values).unwrap();
            for (&m, &p) in mask.buffer().data().iter().zip(&data) {
                assert_eq!(m, if p < t { -1.0 } else { 7.0 });
            }
        }
    }

    #[test]
    fn threshold_extremes() {
        let p = probs(&[0.0, 0.2, 0.4, 0.6, 0.8, 1.0, 0.5, 0.5]);
        let none = threshold(&p, OUT, 1.5, MaskValues::default()).unwrap();
        assert_eq!(none.foreground_count(), 0);
        let all = threshold(&p, OUT, -0.5, MaskValues::default()).unwrap();
        assert_eq!(all.coverage(), 1.0);
    }

    #[test]
    fn rejects_shape_mismatch() {
        let p = PixelBuffer::new(224, 224, 2);
        let err = threshold(&p, Shape::new(224, 224, 1), 0.5, MaskValues::default()).unwrap_err();
        assert_eq!(
            err,
            ThresholdError::ShapeMismatch {
                expected: Shape::new(224, 224, 1),
                actual: Shape::new(224, 224, 2),
            }
        );
    }
}
