//! Bounds on abstract interpretation.
//!
//! These constants cap the work the compiler performs per construct so that
//! inference always terminates.

/// Maximum trip count a statically-bounded `for` loop is unrolled to.
/// Larger known bounds route the loop to interpreted execution instead.
pub const MAX_STATIC_UNROLL: usize = 64;

/// Maximum iterations of the abstract fixpoint for `while` loops before
/// the loop is routed to interpreted execution.
pub const MAX_LOOP_FIXPOINT_ITERATIONS: usize = 10;
