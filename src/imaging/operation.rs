//! Typed image operations and the canonical-order [`OperationSet`].
//!
//! Requests arrive as loose JSON objects keyed by operation name. They are
//! parsed exactly once, here, into [`Operation`] values; nothing downstream
//! ever sees an unknown key or a malformed parameter.
//!
//! ## Wire format
//!
//! ```json
//! {
//!   "rotate": 45,
//!   "blur": 2.5,
//!   "resize": { "width": 640, "height": 480 },
//!   "upscale": 2,
//!   "grayscale": true,
//!   "flip": "horizontal"
//! }
//! ```
//!
//! `rotate` also accepts `{ "angle": 45, "expand": false }` to keep the
//! original canvas. `"grayscale": false` is the same as leaving it out.
//!
//! ## Canonical order
//!
//! Operations always run rotate → blur → resize → upscale → grayscale → flip,
//! whatever order the caller wrote them in. [`OperationKind`]'s `Ord` *is*
//! that order, so an [`OperationSet`] keyed by kind iterates canonically.

use super::backend::TransformError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Upper bound on any requested output edge, in pixels.
pub const MAX_EDGE: u32 = 16_384;

/// Upper bound on a blur radius (Gaussian sigma). The kernel grows with it.
pub const MAX_BLUR_RADIUS: f32 = 1_000.0;

/// The fixed vocabulary of operations, declared in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Rotate,
    Blur,
    Resize,
    Upscale,
    Grayscale,
    Flip,
}

impl OperationKind {
    pub const ALL: [OperationKind; 6] = [
        OperationKind::Rotate,
        OperationKind::Blur,
        OperationKind::Resize,
        OperationKind::Upscale,
        OperationKind::Grayscale,
        OperationKind::Flip,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OperationKind::Rotate => "rotate",
            OperationKind::Blur => "blur",
            OperationKind::Resize => "resize",
            OperationKind::Upscale => "upscale",
            OperationKind::Grayscale => "grayscale",
            OperationKind::Flip => "flip",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OperationKind {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| TransformError::UnsupportedOperation(s.to_string()))
    }
}

/// Mirror axis for [`Operation::Flip`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlipAxis {
    /// Mirror left ↔ right.
    Horizontal,
    /// Mirror top ↔ bottom.
    Vertical,
}

impl FlipAxis {
    pub fn name(self) -> &'static str {
        match self {
            FlipAxis::Horizontal => "horizontal",
            FlipAxis::Vertical => "vertical",
        }
    }
}

/// One image operation with its parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operation {
    /// Counter-clockwise rotation in degrees. With `expand` the canvas grows
    /// to hold the rotated bounds; without it the corners are cropped.
    Rotate { angle: f32, expand: bool },
    /// Gaussian blur; `radius` is the sigma.
    Blur { radius: f32 },
    /// Resize to exact dimensions.
    Resize { width: u32, height: u32 },
    /// Scale both edges by `factor`.
    Upscale { factor: f32 },
    Grayscale,
    Flip { axis: FlipAxis },
}

impl Operation {
    pub fn rotate(angle: f32) -> Self {
        Operation::Rotate {
            angle,
            expand: true,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Rotate { .. } => OperationKind::Rotate,
            Operation::Blur { .. } => OperationKind::Blur,
            Operation::Resize { .. } => OperationKind::Resize,
            Operation::Upscale { .. } => OperationKind::Upscale,
            Operation::Grayscale => OperationKind::Grayscale,
            Operation::Flip { .. } => OperationKind::Flip,
        }
    }

    /// Check the parameter invariants: finite floats, radius in
    /// `0..=MAX_BLUR_RADIUS`, positive factor, dimensions in `1..=MAX_EDGE`.
    pub fn validate(&self) -> Result<(), TransformError> {
        let kind = self.kind();
        match *self {
            Operation::Rotate { angle, .. } if !angle.is_finite() => {
                Err(TransformError::invalid(kind, "angle must be finite"))
            }
            Operation::Blur { radius }
                if !radius.is_finite() || !(0.0..=MAX_BLUR_RADIUS).contains(&radius) =>
            {
                Err(TransformError::invalid(
                    kind,
                    format!("radius must be between 0 and {MAX_BLUR_RADIUS}"),
                ))
            }
            Operation::Resize { width, height }
                if width == 0 || height == 0 || width > MAX_EDGE || height > MAX_EDGE =>
            {
                Err(TransformError::invalid(
                    kind,
                    format!("dimensions must be between 1 and {MAX_EDGE}"),
                ))
            }
            Operation::Upscale { factor } if !factor.is_finite() || factor <= 0.0 => Err(
                TransformError::invalid(kind, "factor must be a finite, positive number"),
            ),
            _ => Ok(()),
        }
    }

    /// Parse the JSON value for `kind`. `Ok(None)` means "explicitly off"
    /// (`"grayscale": false`).
    fn from_value(kind: OperationKind, value: &Value) -> Result<Option<Self>, TransformError> {
        let op = match kind {
            OperationKind::Rotate => match value {
                Value::Object(fields) => {
                    reject_unknown(kind, fields, &["angle", "expand"])?;
                    let angle = fields
                        .get("angle")
                        .ok_or_else(|| TransformError::invalid(kind, "missing angle"))
                        .and_then(|v| number(kind, v))?;
                    let expand = match fields.get("expand") {
                        None => true,
                        Some(v) => v
                            .as_bool()
                            .ok_or_else(|| TransformError::invalid(kind, "expand must be a bool"))?,
                    };
                    Operation::Rotate { angle, expand }
                }
                other => Operation::rotate(number(kind, other)?),
            },
            OperationKind::Blur => Operation::Blur {
                radius: number(kind, value)?,
            },
            OperationKind::Resize => {
                let fields = value.as_object().ok_or_else(|| {
                    TransformError::invalid(kind, "expected {\"width\": .., \"height\": ..}")
                })?;
                reject_unknown(kind, fields, &["width", "height"])?;
                Operation::Resize {
                    width: dimension(kind, fields.get("width"), "width")?,
                    height: dimension(kind, fields.get("height"), "height")?,
                }
            }
            OperationKind::Upscale => Operation::Upscale {
                factor: number(kind, value)?,
            },
            OperationKind::Grayscale => match value {
                Value::Bool(true) => Operation::Grayscale,
                Value::Bool(false) => return Ok(None),
                _ => return Err(TransformError::invalid(kind, "expected true or false")),
            },
            OperationKind::Flip => {
                let axis = match value.as_str() {
                    Some("horizontal") => FlipAxis::Horizontal,
                    Some("vertical") => FlipAxis::Vertical,
                    _ => {
                        return Err(TransformError::invalid(
                            kind,
                            "expected \"horizontal\" or \"vertical\"",
                        ));
                    }
                };
                Operation::Flip { axis }
            }
        };
        op.validate()?;
        Ok(Some(op))
    }

    fn to_value(self) -> Value {
        match self {
            Operation::Rotate {
                angle,
                expand: true,
            } => json!(angle),
            Operation::Rotate {
                angle,
                expand: false,
            } => json!({ "angle": angle, "expand": false }),
            Operation::Blur { radius } => json!(radius),
            Operation::Resize { width, height } => json!({ "width": width, "height": height }),
            Operation::Upscale { factor } => json!(factor),
            Operation::Grayscale => json!(true),
            Operation::Flip { axis } => json!(axis.name()),
        }
    }
}

fn number(kind: OperationKind, value: &Value) -> Result<f32, TransformError> {
    let n = value
        .as_f64()
        .ok_or_else(|| TransformError::invalid(kind, "expected a number"))?;
    let n = n as f32;
    if !n.is_finite() {
        return Err(TransformError::invalid(kind, "value out of range"));
    }
    Ok(n)
}

fn dimension(kind: OperationKind, value: Option<&Value>, field: &str) -> Result<u32, TransformError> {
    value
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| TransformError::invalid(kind, format!("{field} must be a positive integer")))
}

fn reject_unknown(
    kind: OperationKind,
    fields: &Map<String, Value>,
    allowed: &[&str],
) -> Result<(), TransformError> {
    match fields.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(key) => Err(TransformError::invalid(kind, format!("unknown field '{key}'"))),
        None => Ok(()),
    }
}

/// A set of operations with at most one per kind, iterated in canonical order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationSet {
    ops: BTreeMap<OperationKind, Operation>,
}

impl OperationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from operations in any order.
    ///
    /// Fails on the first invalid operation or on a second operation of a
    /// kind already present.
    pub fn from_operations(
        ops: impl IntoIterator<Item = Operation>,
    ) -> Result<Self, TransformError> {
        let mut set = Self::new();
        for op in ops {
            set.insert(op)?;
        }
        Ok(set)
    }

    pub fn insert(&mut self, op: Operation) -> Result<(), TransformError> {
        op.validate()?;
        let kind = op.kind();
        if self.ops.contains_key(&kind) {
            return Err(TransformError::invalid(kind, "given more than once"));
        }
        self.ops.insert(kind, op);
        Ok(())
    }

    pub fn get(&self, kind: OperationKind) -> Option<&Operation> {
        self.ops.get(&kind)
    }

    pub fn contains(&self, kind: OperationKind) -> bool {
        self.ops.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Operations in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.values()
    }

    pub fn kinds(&self) -> Vec<OperationKind> {
        self.ops.keys().copied().collect()
    }

    /// The same set with rotation held to the source canvas.
    pub fn without_expansion(&self) -> Self {
        let ops = self
            .ops
            .iter()
            .map(|(&kind, &op)| match op {
                Operation::Rotate { angle, .. } => (
                    kind,
                    Operation::Rotate {
                        angle,
                        expand: false,
                    },
                ),
                other => (kind, other),
            })
            .collect();
        Self { ops }
    }

    /// Parse and validate a JSON object of `name → parameters`.
    pub fn from_json(value: &Value) -> Result<Self, TransformError> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(fields) => Self::from_map(fields),
            _ => Err(TransformError::InvalidParameter {
                operation: "operations".to_string(),
                reason: "expected an object of operation name to parameters".to_string(),
            }),
        }
    }

    fn from_map(fields: &Map<String, Value>) -> Result<Self, TransformError> {
        let mut set = Self::new();
        for (name, value) in fields {
            let kind: OperationKind = name.parse()?;
            if let Some(op) = Operation::from_value(kind, value)? {
                set.insert(op)?;
            }
        }
        Ok(set)
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.ops
                .iter()
                .map(|(kind, op)| (kind.name().to_string(), op.to_value()))
                .collect(),
        )
    }
}

impl Serialize for OperationSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for OperationSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        OperationSet::from_json(&value).map_err(serde::de::Error::custom)
    }
}
