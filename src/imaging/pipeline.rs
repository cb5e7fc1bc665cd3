//! Single-shot operation pipeline.
//!
//! Applies every operation present in an [`OperationSet`] exactly once, in
//! canonical order. Absent operations are skipped; nothing is applied by
//! default. The first failure aborts the run and the partial image is dropped.

use super::backend::{TransformBackend, TransformError};
use super::operation::OperationSet;
use image::DynamicImage;
use tracing::debug;

/// Run `operations` over `image`, returning a new image.
///
/// An empty set returns a copy equal to the input.
pub fn run(
    backend: &impl TransformBackend,
    image: &DynamicImage,
    operations: &OperationSet,
) -> Result<DynamicImage, TransformError> {
    let mut current: Option<DynamicImage> = None;
    for op in operations.iter() {
        debug!(operation = %op.kind(), "applying");
        let input = current.as_ref().unwrap_or(image);
        current = Some(backend.apply(input, op)?);
    }
    Ok(current.unwrap_or_else(|| image.clone()))
}
