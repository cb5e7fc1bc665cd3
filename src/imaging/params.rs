//! Parameter types for encoding and stress workloads.
//!
//! ## Types
//!
//! - [`Quality`]: lossy encoding quality (1–100, default 90). Clamped on construction.
//! - [`Mutation`]: the fixed per-iteration mutation a stress unit applies:
//!   a small non-expanding rotation, a blur, and a horizontal mirror.

use super::operation::{FlipAxis, Operation};

/// Quality setting for lossy image encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quality(pub u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(90)
    }
}

/// Stress mutation parameters.
///
/// Rotation never expands the canvas here: an expanding rotation repeated
/// thousands of times would grow the image without bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mutation {
    /// Degrees, counter-clockwise.
    pub angle: f32,
    /// Blur sigma.
    pub radius: f32,
}

impl Mutation {
    /// The three operations of one mutation step, in application order.
    pub fn operations(&self) -> [Operation; 3] {
        [
            Operation::Rotate {
                angle: self.angle,
                expand: false,
            },
            Operation::Blur {
                radius: self.radius,
            },
            Operation::Flip {
                axis: FlipAxis::Horizontal,
            },
        ]
    }
}

impl Default for Mutation {
    fn default() -> Self {
        Self {
            angle: 15.0,
            radius: 2.0,
        }
    }
}
