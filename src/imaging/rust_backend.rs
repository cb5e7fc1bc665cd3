//! Pure Rust transform backend on the `image` crate.
//!
//! ## Crate mapping
//!
//! | Operation | Implementation |
//! |---|---|
//! | Rotate (quarter turns) | `rotate90` / `rotate180` / `rotate270`, lossless |
//! | Rotate (any angle) | bilinear inverse mapping onto an RGBA canvas |
//! | Blur | `DynamicImage::blur` (Gaussian) |
//! | Resize | `resize_exact` with `Lanczos3` |
//! | Upscale | [`scaled_dimensions`] + `resize_exact` with `Lanczos3` |
//! | Grayscale | `DynamicImage::grayscale` |
//! | Flip | `fliph` / `flipv` |
//!
//! Every operation is deterministic: the same input and parameters always
//! produce the same pixels.

use super::backend::{TransformBackend, TransformError};
use super::calculations::{quarter_turns, rotated_bounds, scaled_dimensions};
use super::operation::{FlipAxis, Operation, OperationKind};
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};

/// Resampling filter for resize and upscale.
const FILTER: FilterType = FilterType::Lanczos3;

/// Pure Rust backend using the `image` crate.
///
/// See the [module docs](self) for the operation mapping.
pub struct RustBackend;

impl RustBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RustBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformBackend for RustBackend {
    fn apply(&self, image: &DynamicImage, op: &Operation) -> Result<DynamicImage, TransformError> {
        op.validate()?;
        let out = match *op {
            Operation::Rotate { angle, expand } => rotate(image, angle, expand)?,
            Operation::Blur { radius } if radius == 0.0 => image.clone(),
            Operation::Blur { radius } => image.blur(radius),
            Operation::Resize { width, height } => image.resize_exact(width, height, FILTER),
            Operation::Upscale { factor } => {
                let (w, h) = scaled_dimensions((image.width(), image.height()), factor)
                    .ok_or_else(|| {
                        TransformError::invalid(OperationKind::Upscale, "result would be too large")
                    })?;
                image.resize_exact(w, h, FILTER)
            }
            Operation::Grayscale => image.grayscale(),
            Operation::Flip {
                axis: FlipAxis::Horizontal,
            } => image.fliph(),
            Operation::Flip {
                axis: FlipAxis::Vertical,
            } => image.flipv(),
        };
        Ok(out)
    }
}

/// Rotate counter-clockwise by `angle` degrees.
///
/// With `expand`, exact quarter turns permute pixels losslessly and other
/// angles grow the canvas to [`rotated_bounds`]. Without it the canvas keeps
/// its size and the corners are cropped. Uncovered pixels are transparent.
fn rotate(image: &DynamicImage, angle: f32, expand: bool) -> Result<DynamicImage, TransformError> {
    match quarter_turns(angle) {
        Some(0) => return Ok(image.clone()),
        Some(2) => return Ok(image.rotate180()),
        Some(1) if expand => return Ok(image.rotate270()),
        Some(3) if expand => return Ok(image.rotate90()),
        _ => {}
    }

    let (w, h) = (image.width(), image.height());
    let (out_w, out_h) = if expand {
        rotated_bounds((w, h), angle).ok_or_else(|| {
            TransformError::invalid(OperationKind::Rotate, "result would be too large")
        })?
    } else {
        (w, h)
    };
    let src = image.to_rgba8();

    let (sin, cos) = (angle as f64).to_radians().sin_cos();
    let (src_cx, src_cy) = (w as f64 / 2.0, h as f64 / 2.0);
    let (dst_cx, dst_cy) = (out_w as f64 / 2.0, out_h as f64 / 2.0);

    let mut out = RgbaImage::new(out_w, out_h);
    for (x, y, px) in out.enumerate_pixels_mut() {
        // Inverse-map the destination pixel centre back into the source.
        // y grows downwards, so a visual counter-clockwise turn maps back as:
        let dx = x as f64 + 0.5 - dst_cx;
        let dy = y as f64 + 0.5 - dst_cy;
        let sx = cos * dx - sin * dy + src_cx - 0.5;
        let sy = sin * dx + cos * dy + src_cy - 0.5;
        *px = sample_bilinear(&src, sx, sy);
    }
    Ok(DynamicImage::ImageRgba8(out))
}

/// Bilinear sample at fractional `(x, y)`; neighbours outside the image
/// count as transparent black.
fn sample_bilinear(src: &RgbaImage, x: f64, y: f64) -> Rgba<u8> {
    let (w, h) = (src.width() as i64, src.height() as i64);
    let x0 = x.floor();
    let y0 = y.floor();
    let (fx, fy) = (x - x0, y - y0);
    let (x0, y0) = (x0 as i64, y0 as i64);

    if x0 < -1 || y0 < -1 || x0 >= w || y0 >= h {
        return Rgba([0, 0, 0, 0]);
    }

    let fetch = |px: i64, py: i64| -> [f64; 4] {
        if px < 0 || py < 0 || px >= w || py >= h {
            [0.0; 4]
        } else {
            let p = src.get_pixel(px as u32, py as u32).0;
            [p[0] as f64, p[1] as f64, p[2] as f64, p[3] as f64]
        }
    };

    let tl = fetch(x0, y0);
    let tr = fetch(x0 + 1, y0);
    let bl = fetch(x0, y0 + 1);
    let br = fetch(x0 + 1, y0 + 1);

    let mut out = [0u8; 4];
    for c in 0..4 {
        let top = tl[c] + (tr[c] - tl[c]) * fx;
        let bottom = bl[c] + (br[c] - bl[c]) * fx;
        out[c] = (top + (bottom - top) * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgba(out)
}
