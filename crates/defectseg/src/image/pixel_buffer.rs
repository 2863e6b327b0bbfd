//! Planar `f32` image shared by every pipeline stage.
//!
//! Samples are stored channel-major: all of channel 0 (row-major), then all of
//! channel 1, and so on. A `PixelBuffer` also serves as the activation tensor
//! of the compute engine (batch size is always 1).

use super::ImageError;

/// Width, height and channel count of a planar buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Shape {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
}

impl Shape {
    pub const fn new(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// Samples in one channel plane.
    pub fn plane_len(&self) -> usize {
        self.width * self.height
    }

    /// Total number of samples.
    pub fn len(&self) -> usize {
        self.plane_len() * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn spatial(&self) -> (usize, usize) {
        (self.width, self.height)
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.channels)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PixelBuffer {
    shape: Shape,
    data: Vec<f32>,
}

impl PixelBuffer {
    /// Zero-initialized buffer.
    pub fn new(width: usize, height: usize, channels: usize) -> Self {
        Self::filled(width, height, channels, 0.0)
    }

    /// Buffer with every sample set to `value`.
    pub fn filled(width: usize, height: usize, channels: usize, value: f32) -> Self {
        let shape = Shape::new(width, height, channels);
        Self {
            shape,
            data: vec![value; shape.len()],
        }
    }

    /// Wrap planar samples; `data.len()` must equal `width * height * channels`.
    pub fn from_vec(
        width: usize,
        height: usize,
        channels: usize,
        data: Vec<f32>,
    ) -> Result<Self, ImageError> {
        let shape = Shape::new(width, height, channels);
        let expected = width
            .checked_mul(height)
            .and_then(|v| v.checked_mul(channels))
            .ok_or(ImageError::SizeMismatch {
                expected: usize::MAX,
                actual: data.len(),
            })?;
        if data.len() != expected {
            return Err(ImageError::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// Convert packed interleaved bytes (`RGBRGB...`) into planar floats in `[0, 255]`.
    pub fn from_interleaved_u8(
        width: usize,
        height: usize,
        channels: usize,
        packed: &[u8],
    ) -> Result<Self, ImageError> {
        let shape = Shape::new(width, height, channels);
        if packed.len() != shape.len() {
            return Err(ImageError::SizeMismatch {
                expected: shape.len(),
                actual: packed.len(),
            });
        }
        let plane = shape.plane_len();
        let mut data = vec![0.0f32; shape.len()];
        for (i, px) in packed.chunks_exact(channels.max(1)).enumerate() {
            for (k, &v) in px.iter().enumerate() {
                data[k * plane + i] = v as f32;
            }
        }
        Ok(Self { shape, data })
    }

    /// Interleave planes back into packed bytes, clamping to `[0, 255]` and truncating.
    pub fn to_interleaved_u8(&self) -> Vec<u8> {
        let plane = self.shape.plane_len();
        let c = self.shape.channels;
        let mut out = vec![0u8; self.data.len()];
        for k in 0..c {
            let src = &self.data[k * plane..(k + 1) * plane];
            for (i, &v) in src.iter().enumerate() {
                out[i * c + k] = v.clamp(0.0, 255.0) as u8;
            }
        }
        out
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn width(&self) -> usize {
        self.shape.width
    }

    pub fn height(&self) -> usize {
        self.shape.height
    }

    pub fn channels(&self) -> usize {
        self.shape.channels
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    fn index(&self, x: usize, y: usize, channel: usize) -> Result<usize, ImageError> {
        let s = self.shape;
        if x >= s.width || y >= s.height || channel >= s.channels {
            return Err(ImageError::OutOfBounds {
                x,
                y,
                channel,
                shape: s,
            });
        }
        Ok(channel * s.plane_len() + y * s.width + x)
    }

    pub fn get(&self, x: usize, y: usize, channel: usize) -> Result<f32, ImageError> {
        self.index(x, y, channel).map(|i| self.data[i])
    }

    pub fn set(&mut self, x: usize, y: usize, channel: usize, value: f32) -> Result<(), ImageError> {
        let i = self.index(x, y, channel)?;
        self.data[i] = value;
        Ok(())
    }

    pub fn add(&mut self, x: usize, y: usize, channel: usize, value: f32) -> Result<(), ImageError> {
        let i = self.index(x, y, channel)?;
        self.data[i] += value;
        Ok(())
    }

    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    /// One channel plane (row-major).
    ///
    /// Panics if `channel >= channels()`.
    pub fn plane(&self, channel: usize) -> &[f32] {
        let n = self.shape.plane_len();
        &self.data[channel * n..(channel + 1) * n]
    }

    pub fn plane_mut(&mut self, channel: usize) -> &mut [f32] {
        let n = self.shape.plane_len();
        &mut self.data[channel * n..(channel + 1) * n]
    }

    /// Row `y` of `channel`.
    pub fn row(&self, channel: usize, y: usize) -> &[f32] {
        let w = self.shape.width;
        let start = channel * self.shape.plane_len() + y * w;
        &self.data[start..start + w]
    }

    pub fn row_mut(&mut self, channel: usize, y: usize) -> &mut [f32] {
        let w = self.shape.width;
        let start = channel * self.shape.plane_len() + y * w;
        &mut self.data[start..start + w]
    }

    /// Multiply every sample by `factor`, returning a fresh buffer.
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            shape: self.shape,
            data: self.data.iter().map(|v| v * factor).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_major_layout() {
        let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let img = PixelBuffer::from_vec(2, 2, 3, data).expect("valid buffer");
        assert_eq!(img.get(0, 0, 0).unwrap(), 0.0);
        assert_eq!(img.get(1, 0, 0).unwrap(), 1.0);
        assert_eq!(img.get(0, 1, 0).unwrap(), 2.0);
        assert_eq!(img.get(0, 0, 1).unwrap(), 4.0);
        assert_eq!(img.get(1, 1, 2).unwrap(), 11.0);
        assert_eq!(img.plane(1), &[4.0, 5.0, 6.0, 7.0]);
        assert_eq!(img.row(2, 1), &[10.0, 11.0]);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = PixelBuffer::from_vec(3, 2, 1, vec![0.0; 5]).unwrap_err();
        assert!(matches!(
            err,
            ImageError::SizeMismatch {
                expected: 6,
                actual: 5
            }
        ));
    }

    #[test]
    fn accessors_reject_out_of_range() {
        let mut img = PixelBuffer::new(4, 3, 2);
        assert!(img.get(4, 0, 0).is_err());
        assert!(img.get(0, 3, 0).is_err());
        assert!(img.get(0, 0, 2).is_err());
        assert!(img.set(3, 2, 1, 7.0).is_ok());
        assert!(img.add(3, 2, 1, 1.0).is_ok());
        assert_eq!(img.get(3, 2, 1).unwrap(), 8.0);
        assert!(img.set(5, 5, 5, 1.0).is_err());
    }

    #[test]
    fn interleaved_conversion_roundtrip() {
        let packed = [10u8, 20, 30, 40, 50, 60];
        let img = PixelBuffer::from_interleaved_u8(2, 1, 3, &packed).unwrap();
        assert_eq!(img.plane(0), &[10.0, 40.0]);
        assert_eq!(img.plane(2), &[30.0, 60.0]);
        assert_eq!(img.to_interleaved_u8(), packed.to_vec());
    }

    #[test]
    fn interleave_clamps_out_of_range_samples() {
        let img = PixelBuffer::from_vec(3, 1, 1, vec![-4.0, 127.9, 300.0]).unwrap();
        assert_eq!(img.to_interleaved_u8(), vec![0, 127, 255]);
    }
}
