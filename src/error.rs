//! Compile-time error taxonomy.
//!
//! Three failure classes exist at this layer:
//!
//! - [`InferenceError`]: dtype/shape mismatch on a graph-native operator;
//!   aborts compilation of the enclosing region immediately.
//! - `Rejected`: a construct no execution mode can satisfy; fatal, carries
//!   the construct's source location and a fixed diagnostic message.
//! - [`ConversionError`]: a value crossing a boundary node cannot be
//!   represented on the target side.
//!
//! `RequiresFallback` is deliberately absent: it is a routing decision, not
//! an error (see [`crate::diagnostics::FallbackReason`]).
//!
//! All variants are `Clone` so a failed compilation can be cached per
//! specialization key without blocking other specializations.

use crate::diagnostics::RejectReason;
use crate::ir::ConstructKind;
use crate::lattice::DType;
use crate::span::Span;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why type/shape inference failed for an expression.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum InferenceReason {
    #[error("variable '{0}' is not bound at this point")]
    UnknownVariable(String),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("operator '{op}' has no valid signature for input dtypes {inputs:?}")]
    InvalidOperatorSignature { op: String, inputs: Vec<DType> },

    #[error("dtype mismatch: {left} vs {right}")]
    DtypeMismatch { left: DType, right: DType },

    #[error("shape rank mismatch: rank {left} vs rank {right}")]
    RankMismatch { left: usize, right: usize },

    #[error("operand kind '{0}' is not valid here")]
    InvalidOperand(String),

    #[error("tuple index {index} out of bounds for length {len}")]
    TupleIndexOutOfBounds { index: usize, len: usize },
}

/// Inference failure tagged with the offending construct's location.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("type inference failed at {span}: {reason}")]
pub struct InferenceError {
    pub span: Span,
    pub reason: InferenceReason,
}

impl InferenceError {
    pub fn new(span: Span, reason: InferenceReason) -> Self {
        Self { span, reason }
    }
}

/// A value could not cross a graph/interpreted boundary.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum ConversionError {
    #[error("value has no graph representation: {0}")]
    NoGraphRepresentation(String),

    #[error("value has no concrete interpreted representation: {0}")]
    NoConcreteRepresentation(String),

    #[error("interpreted runtime state is unavailable")]
    RuntimePoisoned,
}

impl ConversionError {
    pub fn no_graph_representation(what: impl Into<String>) -> Self {
        ConversionError::NoGraphRepresentation(what.into())
    }

    pub fn no_concrete_representation(what: impl Into<String>) -> Self {
        ConversionError::NoConcreteRepresentation(what.into())
    }

    pub fn runtime_poisoned() -> Self {
        ConversionError::RuntimePoisoned
    }
}

/// Terminal failure of one compilation attempt.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum CompileError {
    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// No valid program exists under any execution mode for this construct.
    #[error("{construct} at {span} is not supported: {reason}")]
    Rejected {
        construct: ConstructKind,
        span: Span,
        reason: RejectReason,
    },

    #[error("boundary conversion at {span} failed: {reason}")]
    Conversion { span: Span, reason: ConversionError },

    #[error("input signature has {given} abstract values for {expected} parameters")]
    SignatureMismatch { expected: usize, given: usize },
}

impl CompileError {
    pub fn rejected(construct: ConstructKind, span: Span, reason: RejectReason) -> Self {
        CompileError::Rejected {
            construct,
            span,
            reason,
        }
    }

    pub fn conversion(span: Span, reason: ConversionError) -> Self {
        CompileError::Conversion { span, reason }
    }
}
