//! Numeric transforms and x-axis selection for export and plotting.
//!
//! A transform is chosen by name from a fixed set and configured with JSON:
//!
//! ```json
//! { "op": "norm", "path": ["accel"], "scale": 9.81, "offset": 0.0 }
//! ```
//!
//! A bare string (`"mean"`) is shorthand for `{ "op": "mean" }`.

use crate::error::{Result, SpoolError};
use crate::playback::Entry;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Every number in the value, flattened depth-first.
    Values,
    /// Length of a string, array or map.
    Len,
    Sum,
    Mean,
    Min,
    Max,
    /// Euclidean norm.
    Norm,
}

impl Op {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "values" => Ok(Op::Values),
            "len" => Ok(Op::Len),
            "sum" => Ok(Op::Sum),
            "mean" => Ok(Op::Mean),
            "min" => Ok(Op::Min),
            "max" => Ok(Op::Max),
            "norm" => Ok(Op::Norm),
            other => Err(SpoolError::Transform(format!("unknown transform op: {}", other))),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Op::Values => "values",
            Op::Len => "len",
            Op::Sum => "sum",
            Op::Mean => "mean",
            Op::Min => "min",
            Op::Max => "max",
            Op::Norm => "norm",
        }
    }
}

/// One step into a structured value.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(i) => write!(f, "[{}]", i),
            PathSegment::Key(k) => write!(f, ".{}", k),
        }
    }
}

/// Follow `path` into `value`.
pub fn navigate<'a>(value: &'a Value, path: &[PathSegment]) -> Result<&'a Value> {
    let mut current = value;
    for segment in path {
        let next = match (segment, current) {
            (PathSegment::Key(k), Value::Object(map)) => map.get(k),
            (PathSegment::Index(i), Value::Array(items)) => items.get(*i),
            // numeric keys in maps
            (PathSegment::Index(i), Value::Object(map)) => map.get(&i.to_string()),
            _ => None,
        };
        current = next.ok_or_else(|| {
            SpoolError::Transform(format!("path segment {} not found", segment))
        })?;
    }
    Ok(current)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TransformSpec {
    #[serde(default = "TransformSpec::default_op")]
    op: String,
    #[serde(default)]
    path: Vec<PathSegment>,
    scale: Option<f64>,
    offset: Option<f64>,
}

impl TransformSpec {
    fn default_op() -> String {
        "values".to_string()
    }
}

/// A validated transform, ready to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    op: Op,
    path: Vec<PathSegment>,
    scale: f64,
    offset: f64,
}

impl Default for Transform {
    fn default() -> Self {
        Self::new(Op::Values)
    }
}

impl Transform {
    pub fn new(op: Op) -> Self {
        Self {
            op,
            path: Vec::new(),
            scale: 1.0,
            offset: 0.0,
        }
    }

    /// Build from a JSON spec. Rejects unknown ops and non-finite scale
    /// or offset.
    pub fn from_value(spec: &Value) -> Result<Self> {
        if let Value::String(name) = spec {
            return Ok(Self::new(Op::parse(name)?));
        }

        let spec: TransformSpec = serde_json::from_value(spec.clone())
            .map_err(|e| SpoolError::Transform(format!("invalid transform spec: {}", e)))?;

        let scale = spec.scale.unwrap_or(1.0);
        let offset = spec.offset.unwrap_or(0.0);
        if !scale.is_finite() || !offset.is_finite() {
            return Err(SpoolError::Transform(
                "scale and offset must be finite".to_string(),
            ));
        }

        Ok(Self {
            op: Op::parse(&spec.op)?,
            path: spec.path,
            scale,
            offset,
        })
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn apply(&self, value: &Value) -> Result<Vec<f64>> {
        let target = navigate(value, &self.path)?;

        let raw = match self.op {
            Op::Values => flatten(target)?,
            Op::Len => vec![length(target)? as f64],
            Op::Sum => vec![flatten(target)?.iter().sum()],
            Op::Norm => vec![flatten(target)?.iter().map(|v| v * v).sum::<f64>().sqrt()],
            Op::Mean => {
                let values = nonempty(flatten(target)?, self.op)?;
                vec![values.iter().sum::<f64>() / values.len() as f64]
            }
            Op::Min => {
                let values = nonempty(flatten(target)?, self.op)?;
                vec![values.iter().copied().fold(f64::INFINITY, f64::min)]
            }
            Op::Max => {
                let values = nonempty(flatten(target)?, self.op)?;
                vec![values.iter().copied().fold(f64::NEG_INFINITY, f64::max)]
            }
        };

        Ok(raw.into_iter().map(|v| v * self.scale + self.offset).collect())
    }
}

fn nonempty(values: Vec<f64>, op: Op) -> Result<Vec<f64>> {
    if values.is_empty() {
        Err(SpoolError::Transform(format!("{} of an empty value", op.name())))
    } else {
        Ok(values)
    }
}

fn flatten(value: &Value) -> Result<Vec<f64>> {
    let mut out = Vec::new();
    flatten_into(value, &mut out)?;
    Ok(out)
}

fn flatten_into(value: &Value, out: &mut Vec<f64>) -> Result<()> {
    match value {
        Value::Number(n) => out.push(
            n.as_f64()
                .ok_or_else(|| SpoolError::Transform(format!("number {} not representable", n)))?,
        ),
        Value::Bool(b) => out.push(if *b { 1.0 } else { 0.0 }),
        Value::Array(items) => {
            for item in items {
                flatten_into(item, out)?;
            }
        }
        other => {
            return Err(SpoolError::Transform(format!(
                "cannot convert {} to numbers",
                kind(other)
            )))
        }
    }
    Ok(())
}

fn length(value: &Value) -> Result<usize> {
    match value {
        Value::String(s) => Ok(s.chars().count()),
        Value::Array(items) => Ok(items.len()),
        Value::Object(map) => Ok(map.len()),
        other => Err(SpoolError::Transform(format!("{} has no length", kind(other)))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}

/// Where each entry's x coordinate comes from.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum XSelector {
    /// Millisecond part of the entry id.
    #[default]
    Id,
    /// Ordinal position in the file.
    Index,
    /// A number inside a decoded field.
    Field { key: String, path: Vec<PathSegment> },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FieldSelector {
    field: String,
    #[serde(default)]
    path: Vec<PathSegment>,
}

impl XSelector {
    /// `"id"`, `"index"`, or `{ "field": key, "path": [...] }`.
    pub fn from_value(spec: &Value) -> Result<Self> {
        match spec {
            Value::Null => Ok(XSelector::Id),
            Value::String(s) if s == "id" => Ok(XSelector::Id),
            Value::String(s) if s == "index" => Ok(XSelector::Index),
            Value::Object(_) => {
                let sel: FieldSelector = serde_json::from_value(spec.clone())
                    .map_err(|e| SpoolError::Validation(format!("invalid x selector: {}", e)))?;
                Ok(XSelector::Field {
                    key: sel.field,
                    path: sel.path,
                })
            }
            other => Err(SpoolError::Validation(format!("invalid x selector: {}", other))),
        }
    }

    pub fn x_for(&self, entry: &Entry) -> Result<f64> {
        match self {
            XSelector::Id => {
                let prefix = entry.id.split('-').next().unwrap_or_default();
                prefix.parse::<f64>().map_err(|_| {
                    SpoolError::Transform(format!("entry id {:?} has no numeric prefix", entry.id))
                })
            }
            XSelector::Index => Ok(entry.index as f64),
            XSelector::Field { key, path } => {
                let field = entry.fields.get(key).ok_or_else(|| {
                    SpoolError::Transform(format!("x field {:?} missing from entry {}", key, entry.index))
                })?;
                let value = field.to_value();
                navigate(&value, path)?.as_f64().ok_or_else(|| {
                    SpoolError::Transform(format!(
                        "x field {:?} of entry {} is not a number",
                        key, entry.index
                    ))
                })
            }
        }
    }
}
