//! Operator registry lookup.
//!
//! The inference engine validates every graph-native operator call against
//! a registry of (operator, input dtypes) -> output dtypes entries. The
//! registry is an external collaborator consumed as a lookup; this module
//! defines the seam plus a builtin table sufficient for elementwise math.

use crate::lattice::DType;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Lookup failure for an operator call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RegistryError {
    #[error("operator '{0}' is not registered")]
    NotFound(String),

    #[error("operator '{op}' does not accept input dtypes {inputs:?}")]
    InvalidSignature { op: String, inputs: Vec<DType> },
}

/// Resolves operator signatures. `resolve` must be pure and deterministic.
pub trait OpRegistry: Send + Sync {
    /// Output dtypes of `op` applied to inputs with the given dtypes.
    fn resolve(&self, op: &str, inputs: &[DType]) -> Result<Vec<DType>, RegistryError>;

    /// Whether `op` accepts the given input dtype combination.
    fn supports(&self, op: &str, inputs: &[DType]) -> bool {
        self.resolve(op, inputs).is_ok()
    }
}

/// Dtype rule of one builtin operator.
#[derive(Debug, Clone, Copy)]
enum DtypeRule {
    /// All inputs share one numeric dtype; the output keeps it.
    ElementwiseNumeric,
    /// All inputs share one dtype of any kind; the output keeps it.
    ElementwiseAny,
    /// Inputs share one numeric dtype; the output is Bool.
    ComparisonLike,
}

#[derive(Debug, Clone, Copy)]
struct OpSpec {
    arity: usize,
    rule: DtypeRule,
}

static BUILTIN_OPS: Lazy<HashMap<&'static str, OpSpec>> = Lazy::new(|| {
    let mut ops = HashMap::new();
    let binary_numeric = OpSpec {
        arity: 2,
        rule: DtypeRule::ElementwiseNumeric,
    };
    let unary_numeric = OpSpec {
        arity: 1,
        rule: DtypeRule::ElementwiseNumeric,
    };
    ops.insert("add", binary_numeric);
    ops.insert("sub", binary_numeric);
    ops.insert("mul", binary_numeric);
    ops.insert("div", binary_numeric);
    ops.insert("maximum", binary_numeric);
    ops.insert("minimum", binary_numeric);
    ops.insert("neg", unary_numeric);
    ops.insert("abs", unary_numeric);
    ops.insert("square", unary_numeric);
    ops.insert("relu", unary_numeric);
    ops.insert(
        "equal",
        OpSpec {
            arity: 2,
            rule: DtypeRule::ComparisonLike,
        },
    );
    ops.insert(
        "identity",
        OpSpec {
            arity: 1,
            rule: DtypeRule::ElementwiseAny,
        },
    );
    ops
});

/// Registry over the builtin elementwise operator table.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinRegistry;

impl BuiltinRegistry {
    pub fn new() -> Self {
        Self
    }
}

impl OpRegistry for BuiltinRegistry {
    fn resolve(&self, op: &str, inputs: &[DType]) -> Result<Vec<DType>, RegistryError> {
        let spec = BUILTIN_OPS
            .get(op)
            .ok_or_else(|| RegistryError::NotFound(op.to_string()))?;

        let invalid = || RegistryError::InvalidSignature {
            op: op.to_string(),
            inputs: inputs.to_vec(),
        };

        if inputs.len() != spec.arity {
            return Err(invalid());
        }
        let first = *inputs.first().ok_or_else(invalid)?;
        if inputs.iter().any(|d| *d != first) {
            return Err(invalid());
        }

        match spec.rule {
            DtypeRule::ElementwiseNumeric => {
                if !first.is_numeric() {
                    return Err(invalid());
                }
                Ok(vec![first])
            }
            DtypeRule::ElementwiseAny => Ok(vec![first]),
            DtypeRule::ComparisonLike => {
                if !first.is_numeric() {
                    return Err(invalid());
                }
                Ok(vec![DType::Bool])
            }
        }
    }
}
