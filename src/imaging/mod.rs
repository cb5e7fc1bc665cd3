//! Image operations in pure Rust on the `image` crate.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Rotate** | quarter-turn permutation, or bilinear resampling |
//! | **Blur** | `DynamicImage::blur` |
//! | **Resize / Upscale** | `resize_exact` + Lanczos3 |
//! | **Grayscale / Flip** | `grayscale`, `fliph`, `flipv` |
//! | **Decode / Encode** | `ImageReader`, PNG/JPEG/WebP/TIFF encoders |
//!
//! The module is split into:
//! - **Operation**: [`Operation`] and the canonical-order [`OperationSet`],
//!   parsed and validated once at the request boundary
//! - **Calculations**: Pure functions for geometry math (unit testable)
//! - **Parameters**: Encoding quality and the stress [`Mutation`]
//! - **Backend**: [`TransformBackend`] trait + [`RustBackend`]
//! - **Pipeline**: [`pipeline::run`], the single-shot canonical-order runner
//! - **Codec**: bytes ↔ [`image::DynamicImage`]

pub mod backend;
mod calculations;
pub mod codec;
pub mod operation;
mod params;
pub mod pipeline;
pub mod rust_backend;

pub use backend::{TransformBackend, TransformError};
pub use codec::{CodecError, Dimensions};
pub use operation::{FlipAxis, Operation, OperationKind, OperationSet};
pub use params::{Mutation, Quality};
pub use rust_backend::RustBackend;
