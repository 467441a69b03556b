//! Raw frame type, pixel conversion, dark detection and still encoding.

use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use rollcall_core::{ImageFormat, StillImage};
use serde::Deserialize;

/// Default JPEG quality for stills sent to the resolver.
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Pixels at or below this level count as dark.
pub const DARK_PIXEL_LEVEL: u8 = 31;
/// A frame whose dark-pixel share exceeds this is treated as unlit.
pub const DARK_FRAME_SHARE: f32 = 0.95;

/// One 8-bit luma frame as delivered by a camera backend.
#[derive(Clone)]
pub struct Frame {
    /// `width * height` luma bytes, row-major.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Wrap a luma plane, classifying it as dark or lit.
    pub fn from_luma(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        let is_dark = is_dark(&data);
        Self {
            data,
            width,
            height,
            sequence,
            is_dark,
        }
    }
}

/// Fixed still-image encoding; not negotiated at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StillEncoding {
    pub format: ImageFormat,
    /// 1–100, only used for JPEG.
    pub jpeg_quality: u8,
}

impl Default for StillEncoding {
    fn default() -> Self {
        Self {
            format: ImageFormat::Jpeg,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Pull the luma plane out of a packed buffer.
///
/// Each pixel occupies `bytes_per_pixel` bytes and its luma is the byte at
/// `luma_offset`: `(2, 0)` for YUYV, `(2, 1)` for little-endian Y16 (high
/// byte), `(1, 0)` for GREY. Trailing bytes past the frame are ignored.
pub fn luma_plane(
    buf: &[u8],
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
    luma_offset: usize,
) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height) as usize * bytes_per_pixel;
    let packed = buf.get(..expected).ok_or(FrameError::InvalidLength {
        expected,
        actual: buf.len(),
    })?;
    Ok(packed
        .chunks_exact(bytes_per_pixel)
        .map(|px| px[luma_offset])
        .collect())
}

/// True when nearly every pixel is at or below [`DARK_PIXEL_LEVEL`]. An
/// empty plane is dark.
pub fn is_dark(luma: &[u8]) -> bool {
    if luma.is_empty() {
        return true;
    }
    let dark = luma.iter().filter(|&&p| p <= DARK_PIXEL_LEVEL).count();
    dark as f32 / luma.len() as f32 > DARK_FRAME_SHARE
}

/// Encode a grayscale frame into the configured still format.
pub fn encode_still(frame: &Frame, encoding: StillEncoding) -> Result<StillImage, FrameError> {
    let pixels = (frame.width * frame.height) as usize;
    if frame.data.len() < pixels {
        return Err(FrameError::InvalidLength {
            expected: pixels,
            actual: frame.data.len(),
        });
    }
    let raw = &frame.data[..pixels];

    let mut data = Vec::new();
    match encoding.format {
        ImageFormat::Jpeg => {
            let quality = encoding.jpeg_quality.clamp(1, 100);
            JpegEncoder::new_with_quality(&mut data, quality).write_image(
                raw,
                frame.width,
                frame.height,
                ExtendedColorType::L8,
            )?;
        }
        ImageFormat::Png => {
            PngEncoder::new(&mut data).write_image(
                raw,
                frame.width,
                frame.height,
                ExtendedColorType::L8,
            )?;
        }
    }

    Ok(StillImage {
        data,
        format: encoding.format,
        width: frame.width,
        height: frame.height,
        captured_at: Utc::now(),
        sequence: frame.sequence,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("still encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}
