//! Image file collaborators.
//!
//! - `load_rgb`: decode any supported format to planar RGB in `[0, 255]`.
//! - `save_jpeg`: interleave planes and write a lossy JPEG.

use std::fs;
use std::io::BufWriter;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use super::{ImageError, PixelBuffer};

/// Decode `path` into a 3-channel planar buffer with samples in `[0, 255]`.
///
/// Grayscale and alpha inputs are expanded/flattened to RGB. Zero-area images
/// are rejected here so they never reach resampling.
pub fn load_rgb(path: &Path) -> Result<PixelBuffer, ImageError> {
    let img = image::open(path)
        .map_err(|e| ImageError::Decode {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
        .into_rgb8();
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Err(ImageError::ZeroArea {
            path: path.to_path_buf(),
        });
    }
    PixelBuffer::from_interleaved_u8(w as usize, h as usize, 3, img.as_raw())
}

/// Write `buffer` (1 or 3 channels, samples in `[0, 255]`) as a JPEG.
///
/// Samples are clamped and truncated to bytes. Parent directories are created
/// as needed.
pub fn save_jpeg(buffer: &PixelBuffer, path: &Path, quality: u8) -> Result<(), ImageError> {
    let color = match buffer.channels() {
        1 => ExtendedColorType::L8,
        3 => ExtendedColorType::Rgb8,
        channels => return Err(ImageError::UnsupportedChannels { channels }),
    };
    let encode_err = |message: String| ImageError::Encode {
        path: path.to_path_buf(),
        message,
    };

    ensure_parent_dir(path).map_err(|e| encode_err(e.to_string()))?;
    let file = fs::File::create(path).map_err(|e| encode_err(e.to_string()))?;
    let mut encoder = JpegEncoder::new_with_quality(BufWriter::new(file), quality.clamp(1, 100));
    encoder
        .encode(
            &buffer.to_interleaved_u8(),
            buffer.width() as u32,
            buffer.height() as u32,
            color,
        )
        .map_err(|e| encode_err(e.to_string()))
}

fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn load_rgb_is_planar_and_unscaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("px.png");
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([10, 20, 30]));
        img.put_pixel(1, 0, Rgb([40, 50, 60]));
        img.save(&path).unwrap();

        let buf = load_rgb(&path).unwrap();
        assert_eq!((buf.width(), buf.height(), buf.channels()), (2, 1, 3));
        assert_eq!(buf.plane(0), &[10.0, 40.0]);
        assert_eq!(buf.plane(1), &[20.0, 50.0]);
        assert_eq!(buf.plane(2), &[30.0, 60.0]);
    }

    #[test]
    fn missing_file_is_a_decode_error() {
        let err = load_rgb(Path::new("/definitely/not/here.png")).unwrap_err();
        assert!(matches!(err, ImageError::Decode { .. }));
    }

    #[test]
    fn save_jpeg_writes_decodable_mask() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mask.jpg");
        let mask = PixelBuffer::filled(16, 8, 1, 255.0);
        save_jpeg(&mask, &path, 80).unwrap();

        let back = image::open(&path).unwrap().into_luma8();
        assert_eq!(back.dimensions(), (16, 8));
        assert!(back.pixels().all(|p| p[0] > 240));
    }

    #[test]
    fn save_jpeg_rejects_two_channels() {
        let dir = tempfile::tempdir().unwrap();
        let buf = PixelBuffer::new(2, 2, 2);
        let err = save_jpeg(&buf, &dir.path().join("x.jpg"), 80).unwrap_err();
        assert!(matches!(err, ImageError::UnsupportedChannels { channels: 2 }));
    }
}
