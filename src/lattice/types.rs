//! Abstract value lattice for graph-mode compilation.
//!
//! Every value flowing through a compiled function is over-approximated by
//! an [`AbstractValue`]. The lattice hierarchy is:
//!
//! ```text
//! Unknown (any graph value - most general)
//!   ↑
//! Scalar / Tensor / Sequence / Interpreted (kind-specific abstracts)
//!   ↑
//! Scalar with literal (exact compile-time constant)
//!   ↑
//! Bottom (no valid unification - signals rejection or fallback)
//! ```
//!
//! Unlike a classical type lattice there is no union layer: incompatible
//! kinds join straight to `Bottom`, which downstream passes read as "cannot
//! keep this merge in the graph".

use serde::{Deserialize, Serialize};

/// Element dtype of a tensor abstract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    I32,
    I64,
    F32,
    F64,
    Bool,
}

impl DType {
    /// True for integer dtypes.
    pub fn is_integer(&self) -> bool {
        matches!(self, DType::I32 | DType::I64)
    }

    /// True for floating-point dtypes.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// True for any numeric dtype (everything except Bool).
    pub fn is_numeric(&self) -> bool {
        !matches!(self, DType::Bool)
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::Bool => "bool",
        };
        write!(f, "{name}")
    }
}

/// Kind of a native (non-tensor) scalar.
///
/// Boolean is distinct from integer: the two never unify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    Int,
    Float,
    Bool,
    Str,
}

impl ScalarKind {
    /// The dtype a scalar of this kind takes on when cast into a tensor.
    pub fn widened_dtype(&self) -> Option<DType> {
        match self {
            ScalarKind::Int => Some(DType::I64),
            ScalarKind::Float => Some(DType::F64),
            ScalarKind::Bool => Some(DType::Bool),
            ScalarKind::Str => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ScalarKind::Int | ScalarKind::Float)
    }
}

impl std::fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScalarKind::Int => "int",
            ScalarKind::Float => "float",
            ScalarKind::Bool => "bool",
            ScalarKind::Str => "str",
        };
        write!(f, "{name}")
    }
}

/// A scalar constant known at compile time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarLiteral {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Eq for ScalarLiteral {}

impl std::hash::Hash for ScalarLiteral {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            ScalarLiteral::Int(v) => v.hash(state),
            ScalarLiteral::Float(v) => v.to_bits().hash(state),
            ScalarLiteral::Bool(v) => v.hash(state),
            ScalarLiteral::Str(v) => v.hash(state),
        }
    }
}

impl ScalarLiteral {
    /// The scalar kind of this literal.
    pub fn kind(&self) -> ScalarKind {
        match self {
            ScalarLiteral::Int(_) => ScalarKind::Int,
            ScalarLiteral::Float(_) => ScalarKind::Float,
            ScalarLiteral::Bool(_) => ScalarKind::Bool,
            ScalarLiteral::Str(_) => ScalarKind::Str,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScalarLiteral::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScalarLiteral::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScalarLiteral::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// One dimension of a tensor shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    Known(u64),
    Unknown,
}

impl std::fmt::Display for Dim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dim::Known(n) => write!(f, "{n}"),
            Dim::Unknown => write!(f, "?"),
        }
    }
}

/// Compile-time over-approximation of a run-time value.
///
/// Every graph node carries exactly one `AbstractValue` per output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AbstractValue {
    /// No valid unification exists. Never delivered as a final merged type;
    /// passes that observe it reject or fall back.
    Bottom,

    /// Native scalar, optionally with an exact literal value.
    Scalar {
        kind: ScalarKind,
        literal: Option<ScalarLiteral>,
    },

    /// Tensor with a dtype and an optionally-known shape.
    /// `shape: None` means the rank itself is unknown.
    Tensor {
        dtype: DType,
        shape: Option<Vec<Dim>>,
    },

    /// Fixed-length sequence of abstracts (tuples in the source language).
    Sequence(Vec<AbstractValue>),

    /// Opaque value that only interpreted execution understands.
    Interpreted,

    /// Any graph value (top of the lattice).
    Unknown,
}

impl Eq for AbstractValue {}

impl std::hash::Hash for AbstractValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            AbstractValue::Bottom | AbstractValue::Interpreted | AbstractValue::Unknown => {}
            AbstractValue::Scalar { kind, literal } => {
                kind.hash(state);
                literal.hash(state);
            }
            AbstractValue::Tensor { dtype, shape } => {
                dtype.hash(state);
                shape.hash(state);
            }
            AbstractValue::Sequence(elems) => {
                for e in elems {
                    e.hash(state);
                }
            }
        }
    }
}

impl AbstractValue {
    /// Integer scalar with a known literal value.
    pub fn int(value: i64) -> Self {
        AbstractValue::Scalar {
            kind: ScalarKind::Int,
            literal: Some(ScalarLiteral::Int(value)),
        }
    }

    /// Float scalar with a known literal value.
    pub fn float(value: f64) -> Self {
        AbstractValue::Scalar {
            kind: ScalarKind::Float,
            literal: Some(ScalarLiteral::Float(value)),
        }
    }

    /// Boolean scalar with a known literal value.
    pub fn bool(value: bool) -> Self {
        AbstractValue::Scalar {
            kind: ScalarKind::Bool,
            literal: Some(ScalarLiteral::Bool(value)),
        }
    }

    /// String scalar with a known literal value.
    pub fn str(value: impl Into<String>) -> Self {
        AbstractValue::Scalar {
            kind: ScalarKind::Str,
            literal: Some(ScalarLiteral::Str(value.into())),
        }
    }

    /// Scalar of the given kind with no known literal.
    pub fn scalar(kind: ScalarKind) -> Self {
        AbstractValue::Scalar {
            kind,
            literal: None,
        }
    }

    /// Tensor with a fully-known shape.
    pub fn tensor(dtype: DType, dims: &[u64]) -> Self {
        AbstractValue::Tensor {
            dtype,
            shape: Some(dims.iter().map(|d| Dim::Known(*d)).collect()),
        }
    }

    /// Tensor whose rank is not known.
    pub fn tensor_unranked(dtype: DType) -> Self {
        AbstractValue::Tensor {
            dtype,
            shape: None,
        }
    }

    /// True for `Bottom`.
    pub fn is_bottom(&self) -> bool {
        matches!(self, AbstractValue::Bottom)
    }

    /// True when this abstract is (or transitively contains) an opaque
    /// interpreted object.
    pub fn contains_interpreted(&self) -> bool {
        match self {
            AbstractValue::Interpreted => true,
            AbstractValue::Sequence(elems) => elems.iter().any(Self::contains_interpreted),
            _ => false,
        }
    }

    /// True when the value has a concrete run-time representation, with no
    /// unresolved shape left. Required of values handed to interpreted
    /// execution at a `ToInterpreted` boundary.
    pub fn has_concrete_representation(&self) -> bool {
        match self {
            AbstractValue::Bottom | AbstractValue::Unknown => false,
            AbstractValue::Scalar { .. } | AbstractValue::Interpreted => true,
            AbstractValue::Tensor { shape, .. } => match shape {
                Some(dims) => dims.iter().all(|d| matches!(d, Dim::Known(_))),
                None => false,
            },
            AbstractValue::Sequence(elems) => {
                elems.iter().all(Self::has_concrete_representation)
            }
        }
    }

    /// Compile-time known integer, if this is an int scalar with a literal.
    pub fn as_static_int(&self) -> Option<i64> {
        match self {
            AbstractValue::Scalar {
                kind: ScalarKind::Int,
                literal: Some(lit),
            } => lit.as_int(),
            _ => None,
        }
    }

    /// Compile-time known string, if this is a str scalar with a literal.
    pub fn as_static_str(&self) -> Option<&str> {
        match self {
            AbstractValue::Scalar {
                kind: ScalarKind::Str,
                literal: Some(lit),
            } => lit.as_str(),
            _ => None,
        }
    }

    /// The registry dtype of this abstract, for operator resolution.
    /// Scalars map to their widened dtype; sequences and opaque values
    /// have none.
    pub fn registry_dtype(&self) -> Option<DType> {
        match self {
            AbstractValue::Tensor { dtype, .. } => Some(*dtype),
            AbstractValue::Scalar { kind, .. } => kind.widened_dtype(),
            _ => None,
        }
    }

    /// Drop the literal from a scalar, keeping only its kind.
    pub fn widen_literal(&self) -> AbstractValue {
        match self {
            AbstractValue::Scalar { kind, .. } => AbstractValue::Scalar {
                kind: *kind,
                literal: None,
            },
            other => other.clone(),
        }
    }
}

impl std::fmt::Display for AbstractValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbstractValue::Bottom => write!(f, "Bottom"),
            AbstractValue::Unknown => write!(f, "Unknown"),
            AbstractValue::Interpreted => write!(f, "InterpretedObject"),
            AbstractValue::Scalar { kind, literal } => match literal {
                Some(ScalarLiteral::Int(v)) => write!(f, "{kind}({v})"),
                Some(ScalarLiteral::Float(v)) => write!(f, "{kind}({v})"),
                Some(ScalarLiteral::Bool(v)) => write!(f, "{kind}({v})"),
                Some(ScalarLiteral::Str(v)) => write!(f, "{kind}({v:?})"),
                None => write!(f, "{kind}"),
            },
            AbstractValue::Tensor { dtype, shape } => match shape {
                Some(dims) => {
                    let rendered: Vec<_> = dims.iter().map(|d| d.to_string()).collect();
                    write!(f, "Tensor[{dtype}; {}]", rendered.join("x"))
                }
                None => write!(f, "Tensor[{dtype}; ?]"),
            },
            AbstractValue::Sequence(elems) => {
                let rendered: Vec<_> = elems.iter().map(|e| e.to_string()).collect();
                write!(f, "({})", rendered.join(", "))
            }
        }
    }
}
