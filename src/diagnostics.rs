//! Diagnostics and the policy vocabulary for classification verdicts.
//!
//! Every `Rejected` verdict renders through [`RejectReason`]'s `Display`
//! into a fixed, test-covered message naming the construct and the
//! unsupported input kind. Downstream error-matching tests depend on these
//! strings staying stable; change them only together with their tests.
//!
//! `RequiresFallback` verdicts are never user-visible errors. They are
//! recorded as [`FallbackEvent`]s on the compiled artifact for
//! introspection tooling.

use crate::ir::ConstructKind;
use crate::lattice::ScalarKind;
use crate::span::Span;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a construct is rejected outright: no execution mode can satisfy it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RejectReason {
    /// The graph's loop primitive cannot source a trip count from a
    /// runtime tensor value. Hard rejection, never a fallback.
    #[error("range operator only supports a fixed integer bound, got a tensor-valued bound")]
    TensorValuedRangeBound,

    #[error("range operator only supports a fixed integer bound, got a {0} bound")]
    NonIntegerRangeBound(ScalarKind),

    #[error("no implicit cast between operand kinds {left} and {right}")]
    NoImplicitCast { left: String, right: String },
}

/// Why a construct is routed to interpreted execution. A valid program
/// still exists; it just runs under interpreted semantics for that region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FallbackReason {
    /// An operand is an interpreted object not convertible to a graph value.
    InterpretedOperand,
    /// The range bound is an integer but its value is not known at
    /// compile time.
    RangeBoundNotStatic,
    /// The static trip count exceeds the unrolling cap.
    LoopBoundTooLarge(i64),
    /// A while condition did not stay a scalar bool across iterations.
    WhileConditionNotScalarBool,
    /// A branch condition has no graph boolean representation.
    OpaqueCondition,
    /// A call names a function the operator registry does not know.
    UnknownCallee(String),
    /// The attribute name expression does not fold to a static string.
    UnresolvedAttributeName,
    /// The attribute resolved to a name with no graph operator for the
    /// operand's dtype.
    NoGraphOperatorForAttribute(String),
    /// Joining control-flow paths produced Bottom for the named variable.
    MergeDivergence(String),
    /// break/continue inside a nested loop interacting with outer-loop
    /// state merging; handled conservatively.
    NestedEarlyExit,
    /// The while-loop abstract state did not converge within the
    /// iteration cap.
    FixpointDivergence,
    /// The loop iterable is not a fixed-length sequence or static range.
    UnknownIterable,
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackReason::InterpretedOperand => {
                write!(f, "operand is an interpreted object")
            }
            FallbackReason::RangeBoundNotStatic => {
                write!(f, "range bound is not a compile-time integer")
            }
            FallbackReason::LoopBoundTooLarge(n) => {
                write!(f, "static trip count {n} exceeds the unrolling cap")
            }
            FallbackReason::WhileConditionNotScalarBool => {
                write!(f, "while condition must stay a scalar bool")
            }
            FallbackReason::OpaqueCondition => {
                write!(f, "branch condition is not a graph bool")
            }
            FallbackReason::UnknownCallee(name) => {
                write!(f, "callee '{name}' is not a graph operator")
            }
            FallbackReason::UnresolvedAttributeName => {
                write!(f, "attribute name is not statically resolvable")
            }
            FallbackReason::NoGraphOperatorForAttribute(name) => {
                write!(f, "no graph operator for attribute '{name}'")
            }
            FallbackReason::MergeDivergence(var) => {
                write!(f, "variable '{var}' has no graph type after merging control paths")
            }
            FallbackReason::NestedEarlyExit => {
                write!(f, "early exit from a nested loop is handled conservatively")
            }
            FallbackReason::FixpointDivergence => {
                write!(f, "loop state did not stabilize within the iteration cap")
            }
            FallbackReason::UnknownIterable => {
                write!(f, "iterable is not a fixed-length sequence or static range")
            }
        }
    }
}

/// One recorded fallback routing decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackEvent {
    pub construct: ConstructKind,
    pub span: Span,
    pub reason: FallbackReason,
}

impl FallbackEvent {
    pub fn new(construct: ConstructKind, span: Span, reason: FallbackReason) -> Self {
        Self {
            construct,
            span,
            reason,
        }
    }

    /// Introspection message for tooling. Never surfaced as an error.
    pub fn message(&self) -> String {
        format!(
            "{} at {} lowered to interpreted execution: {}",
            self.construct, self.span, self.reason
        )
    }
}

/// Fallback summary for one compiled specialization, in the shape
/// introspection tooling consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackReport {
    pub function: String,
    pub events: Vec<FallbackEvent>,
}

impl FallbackReport {
    pub fn new(function: impl Into<String>, events: Vec<FallbackEvent>) -> Self {
        Self {
            function: function.into(),
            events,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.events.is_empty()
    }

    /// Human-readable rendering, one line per event.
    pub fn render(&self) -> String {
        let mut out = format!("fallback report for '{}'\n", self.function);
        for event in &self.events {
            out.push_str("  ");
            out.push_str(&event.message());
            out.push('\n');
        }
        out
    }

    /// Machine-readable rendering for log pipelines.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// One row of the decision-policy matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyRow {
    pub construct: &'static str,
    pub operand: &'static str,
    pub verdict: &'static str,
}

/// The policy matrix driving classification, one row per (construct,
/// operand-kind) pair the classifier distinguishes. Kept in one place so
/// documentation and tests agree with the implementation.
pub fn policy_matrix() -> &'static [PolicyRow] {
    const ROWS: &[PolicyRow] = &[
        PolicyRow {
            construct: "for-range",
            operand: "integer bound with known literal",
            verdict: "graphable",
        },
        PolicyRow {
            construct: "for-range",
            operand: "tensor-valued bound",
            verdict: "rejected",
        },
        PolicyRow {
            construct: "for-range",
            operand: "non-integer scalar bound",
            verdict: "rejected",
        },
        PolicyRow {
            construct: "for-range",
            operand: "integer bound without literal",
            verdict: "fallback",
        },
        PolicyRow {
            construct: "for-zip",
            operand: "fixed-length tuple of known abstracts",
            verdict: "graphable",
        },
        PolicyRow {
            construct: "for-zip",
            operand: "non-sequence iterable",
            verdict: "fallback",
        },
        PolicyRow {
            construct: "while",
            operand: "scalar bool condition",
            verdict: "graphable",
        },
        PolicyRow {
            construct: "while",
            operand: "non-bool or opaque condition",
            verdict: "fallback",
        },
        PolicyRow {
            construct: "getattr",
            operand: "static name with registered operator",
            verdict: "graphable",
        },
        PolicyRow {
            construct: "getattr",
            operand: "dynamic name",
            verdict: "fallback",
        },
        PolicyRow {
            construct: "arithmetic",
            operand: "tensor with castable native scalar",
            verdict: "graphable",
        },
        PolicyRow {
            construct: "arithmetic",
            operand: "tensor with non-castable operand",
            verdict: "rejected",
        },
        PolicyRow {
            construct: "any",
            operand: "interpreted object operand",
            verdict: "fallback",
        },
    ];
    ROWS
}
