//! Decoding uploaded bytes and encoding results.
//!
//! Images cross the storage boundary as bytes. The output format is chosen
//! from the key's extension so a result keeps the format of its input.
//!
//! | Extension | Format | Notes |
//! |---|---|---|
//! | `png` | PNG | any 8-bit color type |
//! | `jpg`, `jpeg` | JPEG | alpha dropped, [`Quality`] applies |
//! | `webp` | WebP | lossless, RGBA |
//! | `tif`, `tiff` | TIFF | |

use super::params::Quality;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::tiff::TiffEncoder;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ImageFormat, ImageReader};
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to decode image: {0}")]
    Decode(String),
    #[error("Failed to encode image: {0}")]
    Encode(String),
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),
}

const FORMATS: &[(&str, ImageFormat)] = &[
    ("png", ImageFormat::Png),
    ("jpg", ImageFormat::Jpeg),
    ("jpeg", ImageFormat::Jpeg),
    ("webp", ImageFormat::WebP),
    ("tif", ImageFormat::Tiff),
    ("tiff", ImageFormat::Tiff),
];

/// Result of an identify operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    /// `"WxH"`, the form stored on upload records.
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Extensions accepted for uploads and outputs.
pub fn supported_extensions() -> impl Iterator<Item = &'static str> {
    FORMATS.iter().map(|(ext, _)| *ext)
}

/// Output format for a storage key, from its extension.
pub fn format_for_key(key: &str) -> Result<ImageFormat, CodecError> {
    let ext = Path::new(key)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    FORMATS
        .iter()
        .find(|(candidate, _)| *candidate == ext)
        .map(|(_, fmt)| *fmt)
        .ok_or(CodecError::UnsupportedFormat(ext))
}

/// Decode an image from bytes, sniffing the format from content.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, CodecError> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| CodecError::Decode(e.to_string()))?
        .decode()
        .map_err(|e| CodecError::Decode(e.to_string()))
}

/// Read dimensions from the header without a full decode.
pub fn identify(bytes: &[u8]) -> Result<Dimensions, CodecError> {
    let (width, height) = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| CodecError::Decode(e.to_string()))?
        .into_dimensions()
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    Ok(Dimensions { width, height })
}

/// Encode `img` in `format`.
pub fn encode(
    img: &DynamicImage,
    format: ImageFormat,
    quality: Quality,
) -> Result<Vec<u8>, CodecError> {
    let mut buf = Cursor::new(Vec::new());
    let result = match format {
        ImageFormat::Png => img.write_with_encoder(PngEncoder::new(&mut buf)),
        ImageFormat::Jpeg => {
            let encoder = JpegEncoder::new_with_quality(&mut buf, quality.value() as u8);
            match img {
                DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => {
                    img.write_with_encoder(encoder)
                }
                other if other.color().has_color() => {
                    DynamicImage::ImageRgb8(other.to_rgb8()).write_with_encoder(encoder)
                }
                other => DynamicImage::ImageLuma8(other.to_luma8()).write_with_encoder(encoder),
            }
        }
        ImageFormat::WebP => DynamicImage::ImageRgba8(img.to_rgba8())
            .write_with_encoder(WebPEncoder::new_lossless(&mut buf)),
        ImageFormat::Tiff => img.write_with_encoder(TiffEncoder::new(&mut buf)),
        other => return Err(CodecError::UnsupportedFormat(format!("{other:?}"))),
    };
    result.map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf.into_inner())
}

/// Encode for the format implied by `key`.
pub fn encode_for_key(
    img: &DynamicImage,
    key: &str,
    quality: Quality,
) -> Result<Vec<u8>, CodecError> {
    encode(img, format_for_key(key)?, quality)
}
