//! Planar image model and the geometry-preserving input pipeline.
//!
//! - [`PixelBuffer`]: channel-major `f32` samples, shared by every stage.
//! - [`resize_bilinear`]: two-pass separable bilinear scaling.
//! - [`letterbox`]: aspect-preserving embed into a fixed canvas.
//! - [`io`]: decode to `[0, 255]` planar RGB and JPEG encode.

pub mod io;
mod letterbox;
mod pixel_buffer;
mod resample;

use std::path::PathBuf;

pub use letterbox::{letterbox, LetterboxGeometry, LETTERBOX_PAD_VALUE};
pub use pixel_buffer::{PixelBuffer, Shape};
pub use resample::resize_bilinear;

/// Errors raised by buffer construction, accessors and image I/O.
#[derive(Debug)]
pub enum ImageError {
    /// Sample count does not match `width * height * channels`.
    SizeMismatch { expected: usize, actual: usize },
    /// Coordinate outside the buffer.
    OutOfBounds {
        x: usize,
        y: usize,
        channel: usize,
        shape: Shape,
    },
    /// Decoded image has zero width or height.
    ZeroArea { path: PathBuf },
    /// Decoder failed or the file is missing.
    Decode { path: PathBuf, message: String },
    /// Encoder or filesystem failed while writing.
    Encode { path: PathBuf, message: String },
    /// Buffer cannot be encoded with the requested format.
    UnsupportedChannels { channels: usize },
}

impl std::fmt::Display for ImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch: expected {expected} samples, got {actual}")
            }
            Self::OutOfBounds {
                x,
                y,
                channel,
                shape,
            } => write!(
                f,
                "pixel ({x}, {y}, c={channel}) is outside a {shape} buffer"
            ),
            Self::ZeroArea { path } => {
                write!(f, "image {} has zero width or height", path.display())
            }
            Self::Decode { path, message } => {
                write!(f, "failed to load image {}: {message}", path.display())
            }
            Self::Encode { path, message } => {
                write!(f, "failed to save image {}: {message}", path.display())
            }
            Self::UnsupportedChannels { channels } => {
                write!(f, "cannot encode a buffer with {channels} channels")
            }
        }
    }
}

impl std::error::Error for ImageError {}
