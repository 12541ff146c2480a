// Prevent accidental debug output in library code.
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]

//! Graph-mode compiler with interpreted fallback.
//!
//! Traced function bodies are compiled against an abstract argument
//! signature. Constructs the graph can represent are lowered (bounded
//! loops unroll, static branches fold); constructs it cannot run fall
//! back to interpreted regions, with boundary nodes moving live values
//! across. Constructs no mode can satisfy reject the compilation with a
//! diagnostic naming the construct and the reason.

// Core modules
pub mod cache;
pub mod classify;
pub mod compiler;
pub mod diagnostics;
pub mod error;
pub mod ir;
pub mod span;

// Abstract domain and inference
pub mod infer;
pub mod lattice;

// Region planning
pub mod extract;
pub mod unroll;

// Operator registry
pub mod registry;

// Concrete execution of compiled plans
pub mod exec;
pub mod runtime;

pub use cache::{CompilationCache, SpecializationKey};
pub use compiler::{compile, CompiledFunction, Compiler, ExecutionMode};
pub use diagnostics::{FallbackEvent, FallbackReason, RejectReason};
pub use error::{CompileError, ConversionError, InferenceError};
pub use exec::value::{TensorValue, Value};
pub use exec::Executor;
pub use lattice::{AbstractValue, DType, Dim, ScalarKind};
pub use registry::{BuiltinRegistry, OpRegistry};
pub use runtime::{DefaultRuntime, ObjectHandle, OpaqueRuntime};
