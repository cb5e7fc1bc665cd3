//! Pure calculation functions for image geometry.
//!
//! All functions here are pure and testable without any I/O or images.

use super::operation::MAX_EDGE;

/// Tolerance when deciding whether an angle is an exact quarter turn.
const ANGLE_EPSILON: f64 = 1e-6;

/// Normalize an angle in degrees to `[0, 360)`.
pub fn normalize_degrees(angle: f32) -> f64 {
    (angle as f64).rem_euclid(360.0)
}

/// Number of counter-clockwise quarter turns if `angle` is a multiple of 90°.
///
/// ```text
/// 0 → Some(0), 90 → Some(1), -90 → Some(3), 450 → Some(1), 45 → None
/// ```
pub fn quarter_turns(angle: f32) -> Option<u8> {
    let deg = normalize_degrees(angle);
    let turns = (deg / 90.0).round();
    if (deg - turns * 90.0).abs() < ANGLE_EPSILON {
        Some((turns as u8) % 4)
    } else {
        None
    }
}

/// Canvas needed to hold a `(width, height)` image rotated by `angle`.
///
/// The bounding box of the rotated rectangle is
/// `|w·cos θ| + |h·sin θ|` by `|w·sin θ| + |h·cos θ|`, rounded up.
/// Float noise below `ANGLE_EPSILON` is ignored so 90° gives an exact swap.
/// Returns `None` if either edge would exceed [`MAX_EDGE`].
pub fn rotated_bounds(dims: (u32, u32), angle: f32) -> Option<(u32, u32)> {
    let (w, h) = (dims.0 as f64, dims.1 as f64);
    let (sin, cos) = (angle as f64).to_radians().sin_cos();
    let (sin, cos) = (sin.abs(), cos.abs());

    let bw = w * cos + h * sin;
    let bh = w * sin + h * cos;
    Some((ceil_edge(bw)?, ceil_edge(bh)?))
}

fn ceil_edge(v: f64) -> Option<u32> {
    let edge = (v - ANGLE_EPSILON).ceil().max(1.0);
    (edge <= MAX_EDGE as f64).then_some(edge as u32)
}

/// Dimensions after scaling both edges by `factor`.
///
/// Each edge is rounded and never drops below 1px. Returns `None` if either
/// edge would exceed [`MAX_EDGE`].
pub fn scaled_dimensions(dims: (u32, u32), factor: f32) -> Option<(u32, u32)> {
    let scale = |edge: u32| -> Option<u32> {
        let scaled = (edge as f64 * factor as f64).round().max(1.0);
        (scaled <= MAX_EDGE as f64).then_some(scaled as u32)
    };
    Some((scale(dims.0)?, scale(dims.1)?))
}
