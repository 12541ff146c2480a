//! Concrete runtime values.

use crate::lattice::DType;
use crate::runtime::ObjectHandle;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A dense tensor with row-major element storage. Elements are kept as
/// f64 regardless of dtype; the dtype governs arithmetic semantics and
/// conversion, not storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorValue {
    pub dtype: DType,
    pub shape: Vec<u64>,
    pub data: Vec<f64>,
}

impl TensorValue {
    pub fn scalar(dtype: DType, value: f64) -> Self {
        Self {
            dtype,
            shape: Vec::new(),
            data: vec![value],
        }
    }

    pub fn new(dtype: DType, shape: Vec<u64>, data: Vec<f64>) -> Self {
        Self { dtype, shape, data }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product::<u64>() as usize
    }

    /// The single element of a rank-0 tensor.
    pub fn scalar_value(&self) -> Option<f64> {
        if self.shape.is_empty() {
            self.data.first().copied()
        } else {
            None
        }
    }
}

/// A runtime value flowing through regions. `Object` only appears inside
/// interpreted regions; boundary crossings project it away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Tensor(TensorValue),
    Tuple(Vec<Value>),
    Object(ObjectHandle),
}

impl Value {
    pub fn tensor_scalar(dtype: DType, value: f64) -> Self {
        Value::Tensor(TensorValue::scalar(dtype, value))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "str",
            Value::Tensor(_) => "tensor",
            Value::Tuple(_) => "tuple",
            Value::Object(_) => "object",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Tensor(t) => write!(f, "tensor<{:?}>{:?}", t.dtype, t.shape),
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Value::Object(handle) => write!(f, "object#{}", handle.0),
        }
    }
}
