//! Transform backend trait and its error type.
//!
//! The [`TransformBackend`] trait is the single seam between "which
//! operation, with which parameters" and the pixel work. The production
//! implementation is [`RustBackend`](super::rust_backend::RustBackend);
//! tests swap in recording or failing mocks so pipeline and dispatcher
//! logic can be exercised without caring about pixels.

use super::operation::{Operation, OperationKind};
use image::DynamicImage;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("Invalid parameter for {operation}: {reason}")]
    InvalidParameter { operation: String, reason: String },
    #[error("{operation} failed: {reason}")]
    Failed {
        operation: OperationKind,
        reason: String,
    },
}

impl TransformError {
    pub fn invalid(kind: OperationKind, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            operation: kind.name().to_string(),
            reason: reason.into(),
        }
    }

    /// Name of the operation the error is about.
    pub fn operation(&self) -> &str {
        match self {
            Self::UnsupportedOperation(name) => name,
            Self::InvalidParameter { operation, .. } => operation,
            Self::Failed { operation, .. } => operation.name(),
        }
    }
}

/// Applies one operation to an in-memory image.
///
/// Implementations must treat `image` as read-only and return a new value.
/// `Sync` so one backend can be shared by every stress unit.
pub trait TransformBackend: Sync {
    fn apply(&self, image: &DynamicImage, op: &Operation) -> Result<DynamicImage, TransformError>;
}

impl<T: TransformBackend + ?Sized> TransformBackend for &T {
    fn apply(&self, image: &DynamicImage, op: &Operation) -> Result<DynamicImage, TransformError> {
        (**self).apply(image, op)
    }
}
