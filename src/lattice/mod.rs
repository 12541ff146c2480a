//! Abstract value lattice used throughout compilation.
//!
//! - `types`: the [`AbstractValue`] variants and supporting kinds
//! - `ops`: join / meet / subtype operations
//! - `widening`: termination bounds for abstract interpretation

pub mod ops;
pub mod types;
pub mod widening;

pub use types::{AbstractValue, DType, Dim, ScalarKind, ScalarLiteral};
