//! Safe Data Abstractions.
//!
//! Immutable numeric and tabular values with the same semantics as the
//! `SafeArray` / `SafeTable` classes bound into every execution scope. Every
//! transformation returns a new value.

mod array;
mod table;

pub use array::SafeArray;
pub use table::{AggFunc, Aggregation, Comparison, Row, SafeTable};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("expected an array of numbers")]
    NotAnArray,

    #[error("element {index} is not a number")]
    NotANumber { index: usize },

    #[error("expected an array of row objects")]
    NotATable,

    #[error("row {index} is not an object")]
    NotARow { index: usize },

    #[error("row {row} column '{column}' is not a scalar")]
    NotAScalar { row: usize, column: String },

    #[error("percentile must be between 0 and 100, got {0}")]
    InvalidPercentile(f64),

    #[error("aggregation '{0}' needs a column")]
    MissingColumn(AggFunc),
}

/// A table cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// `None` for arrays and objects.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Scalar::Null),
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Scalar::Int(i)),
                None => n.as_f64().map(Scalar::Float),
            },
            Value::String(s) => Some(Scalar::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Scalar::Null => Value::Null,
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Int(i) => Value::from(*i),
            Scalar::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Scalar::Text(s) => Value::String(s.clone()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Numeric value; booleans are not numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Equality across representations: `1 == 1.0`, but `true != 1`.
    pub fn same_value(&self, other: &Scalar) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self == other,
            _ => false,
        }
    }

    /// Ordering between comparable scalars (two numbers or two texts).
    pub fn partial_order(&self, other: &Scalar) -> Option<Ordering> {
        match (self, other) {
            (Scalar::Text(a), Scalar::Text(b)) => Some(a.cmp(b)),
            _ => self.as_f64()?.partial_cmp(&other.as_f64()?),
        }
    }

    /// Total order used for sorting non-null cells: numbers, then texts,
    /// then booleans.
    pub(crate) fn sort_cmp(&self, other: &Scalar) -> Ordering {
        fn rank(s: &Scalar) -> u8 {
            match s {
                Scalar::Int(_) | Scalar::Float(_) => 0,
                Scalar::Text(_) => 1,
                Scalar::Bool(_) => 2,
                Scalar::Null => 3,
            }
        }
        rank(self).cmp(&rank(other)).then_with(|| match (self, other) {
            (Scalar::Bool(a), Scalar::Bool(b)) => a.cmp(b),
            _ => self.partial_order(other).unwrap_or(Ordering::Equal),
        })
    }
}

fn json_f64(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn option_json(value: Option<f64>) -> Value {
    value.map(json_f64).unwrap_or(Value::Null)
}
